//! Process-wide Prometheus registry and the `/metrics`+`/health` server.
//!
//! Mirrors this codebase's existing pattern of a standalone metrics HTTP
//! server running alongside the main service, rather than folding `/metrics`
//! into the admission TLS listener.

use anyhow::Result;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::AppConfig;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref ADMISSION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "imageswap_admission_requests_total",
            "Total number of admission requests handled"
        ),
        &["allowed"]
    ).unwrap();

    pub static ref IMAGES_SWAPPED_TOTAL: IntCounter = IntCounter::new(
        "imageswap_images_swapped_total",
        "Total number of container images rewritten"
    ).unwrap();

    pub static ref SWAP_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "imageswap_swap_duration_seconds",
            "Time spent resolving a single image reference against the rule tables"
        ).buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1])
    ).unwrap();

    pub static ref BOOTSTRAP_STATE: IntGauge = IntGauge::new(
        "imageswap_bootstrap_state",
        "Last TLS bootstrap state reached, as an ordinal (see tls::State)"
    ).unwrap();

    pub static ref TLS_ROTATIONS_TOTAL: IntCounter = IntCounter::new(
        "imageswap_tls_rotations_total",
        "Total number of times the bootstrap generated a new TLS keypair"
    ).unwrap();

    pub static ref MWC_RECONCILE_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "imageswap_mwc_reconcile_total",
            "Total number of webhook configuration reconcile passes, by action taken"
        ),
        &["action"]
    ).unwrap();

    pub static ref MAP_RELOAD_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "imageswap_map_reload_total",
            "Total number of map file reload attempts, by result"
        ),
        &["result"]
    ).unwrap();
}

pub fn register_metrics() {
    REGISTRY.register(Box::new(ADMISSION_REQUESTS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(IMAGES_SWAPPED_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(SWAP_DURATION_SECONDS.clone())).ok();
    REGISTRY.register(Box::new(BOOTSTRAP_STATE.clone())).ok();
    REGISTRY.register(Box::new(TLS_ROTATIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(MWC_RECONCILE_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(MAP_RELOAD_TOTAL.clone())).ok();

    info!("Metrics registered");
}

pub async fn start_metrics_server(config: &AppConfig) -> Result<JoinHandle<()>> {
    register_metrics();

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_check));

    let addr = format!("0.0.0.0:{}", config.metrics_port);
    info!(%addr, "Starting metrics server");

    let handle = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .expect("failed to bind metrics server");

        axum::serve(listener, app)
            .await
            .expect("metrics server failed");
    });

    Ok(handle)
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_twice_does_not_panic() {
        register_metrics();
        register_metrics();
    }

    #[test]
    fn counters_increment() {
        register_metrics();
        IMAGES_SWAPPED_TOTAL.inc();
        ADMISSION_REQUESTS_TOTAL.with_label_values(&["true"]).inc();
        MWC_RECONCILE_TOTAL.with_label_values(&["patch"]).inc();
        assert!(IMAGES_SWAPPED_TOTAL.get() >= 1);
    }
}
