//! The admission HTTP server: `POST /` accepts an `AdmissionReview`, walks
//! the submitted object's containers through the swap engine, and returns
//! a JSON Patch. `GET /healthz` is a liveness contract independent of the
//! metrics server's `/health`.
//!
//! The handler is pure apart from logging and metrics: it never talks to
//! the Kubernetes API, and failures are swallowed into an allow-no-patch
//! response rather than propagated, per the "fail open" policy.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use base64::Engine;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::config::{AppConfig, Mode};
use crate::maps::RuleTablesHandle;
use crate::metrics::{ADMISSION_REQUESTS_TOTAL, IMAGES_SWAPPED_TOTAL, SWAP_DURATION_SECONDS};
use crate::swap;

const POD_CONTAINER_PATHS: [(&str, &str); 2] = [("/spec/containers", "containers"), ("/spec/initContainers", "initContainers")];
const TEMPLATE_CONTAINER_PATHS: [(&str, &str); 2] = [
    ("/spec/template/spec/containers", "containers"),
    ("/spec/template/spec/initContainers", "initContainers"),
];

#[derive(Clone)]
struct AdmissionState {
    config: AppConfig,
    rule_tables: Arc<RuleTablesHandle>,
}

pub async fn start_admission_server(config: AppConfig, rule_tables: Arc<RuleTablesHandle>) -> anyhow::Result<JoinHandle<()>> {
    let tls_config = RustlsConfig::from_pem_file(&config.tls_cert_path, &config.tls_key_path).await?;
    let addr: std::net::SocketAddr = format!("0.0.0.0:{}", config.admission_port).parse()?;

    let state = AdmissionState {
        config: config.clone(),
        rule_tables,
    };

    let app = Router::new()
        .route("/", post(mutate))
        .route("/healthz", get(healthz))
        .with_state(state);

    info!(%addr, "starting admission server");

    let handle = tokio::spawn(async move {
        if let Err(err) = axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await {
            tracing::error!(%err, "admission server failed");
        }
    });

    Ok(handle)
}

#[instrument(skip(state, body), fields(namespace, kind))]
async fn mutate(State(state): State<AdmissionState>, Json(body): Json<Value>) -> impl IntoResponse {
    Json(review(&state.config, &state.rule_tables, body))
}

/// Processes one `AdmissionReview` body end to end and returns the response
/// body. Exposed separately from the axum handler so it can be exercised
/// without standing up an HTTP/TLS listener.
pub fn review(config: &AppConfig, rule_tables: &RuleTablesHandle, body: Value) -> Value {
    let api_version = body
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or("admission.k8s.io/v1")
        .to_string();

    let request = match body.get("request") {
        Some(r) => r,
        None => {
            warn!("admission request missing `request` field, allowing with no patch");
            return allow_response(&api_version, Value::Null);
        }
    };

    let uid = request.get("uid").cloned().unwrap_or(Value::Null);
    let kind = request.get("kind").and_then(|k| k.get("kind")).and_then(Value::as_str).unwrap_or("");
    let namespace = request.get("namespace").and_then(Value::as_str).unwrap_or("");
    let original = match request.get("object") {
        Some(o) => o.clone(),
        None => {
            warn!("admission request missing `request.object`, allowing with no patch");
            return allow_response(&api_version, uid);
        }
    };

    tracing::Span::current().record("namespace", namespace).record("kind", kind);

    if is_disabled(&original, &config.disable_label) {
        info!("disable label present, skipping image swap");
        ADMISSION_REQUESTS_TOTAL.with_label_values(&["true"]).inc();
        return allow_response(&api_version, uid);
    }

    let mut modified = original.clone();
    let changed = apply_swaps(&mut modified, kind, config, rule_tables);

    ADMISSION_REQUESTS_TOTAL.with_label_values(&["true"]).inc();

    if !changed {
        return allow_response(&api_version, uid);
    }

    let patch = json_patch::diff(&original, &modified);
    if patch.0.is_empty() {
        return allow_response(&api_version, uid);
    }

    let patch_json = match serde_json::to_vec(&patch) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(%err, "failed to serialize JSON patch, allowing with no patch");
            return allow_response(&api_version, uid);
        }
    };
    let patch_b64 = base64::engine::general_purpose::STANDARD.encode(patch_json);

    info!(namespace, kind, "admission request produced a patch");

    json!({
        "apiVersion": api_version,
        "kind": "AdmissionReview",
        "response": {
            "uid": uid,
            "allowed": true,
            "patch": patch_b64,
            "patchType": "JSONPatch",
        }
    })
}

fn allow_response(api_version: &str, uid: Value) -> Value {
    json!({
        "apiVersion": api_version,
        "kind": "AdmissionReview",
        "response": {
            "uid": uid,
            "allowed": true,
        }
    })
}

fn is_disabled(object: &Value, disable_label: &str) -> bool {
    object
        .pointer("/metadata/labels")
        .and_then(|labels| labels.get(disable_label))
        .and_then(Value::as_str)
        == Some("disabled")
}

/// Walks every container/init-container of the object (Pod-shaped or
/// template-shaped, per workload kind) and rewrites `image` fields in
/// place. Returns whether anything changed.
fn apply_swaps(object: &mut Value, kind: &str, config: &AppConfig, rule_tables: &RuleTablesHandle) -> bool {
    let paths = if kind == "Pod" { &POD_CONTAINER_PATHS } else { &TEMPLATE_CONTAINER_PATHS };
    let tables = rule_tables.current();
    let mut changed = false;

    for (pointer, _label) in paths {
        let Some(containers) = object.pointer_mut(pointer).and_then(Value::as_array_mut) else {
            continue;
        };

        for container in containers.iter_mut() {
            let Some(image) = container.get("image").and_then(Value::as_str) else {
                continue;
            };

            let timer = SWAP_DURATION_SECONDS.start_timer();
            let result = match config.mode {
                Mode::Maps => swap::swap(image, &tables),
                Mode::Legacy => swap::legacy::swap(image, &config.image_prefix),
            };
            timer.observe_duration();

            if result.changed {
                container["image"] = Value::String(result.image);
                IMAGES_SWAPPED_TOTAL.inc();
                changed = true;
            }
        }
    }

    changed
}

async fn healthz(State(state): State<AdmissionState>) -> impl IntoResponse {
    Json(json!({
        "pod_name": state.config.pod_name,
        "date_time": Utc::now().to_rfc3339(),
        "health": "ok",
    }))
}
