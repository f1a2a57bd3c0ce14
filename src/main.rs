use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use imageswap::config::AppConfig;
use imageswap::maps::RuleTablesHandle;
use imageswap::{admission, metrics, reconciler, tls};

const MAP_RELOAD_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env().context("loading configuration from environment")?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(config.tracing_filter()).unwrap_or_else(|_| "imageswap=info,kube=info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(namespace = %config.namespace, pod = %config.pod_name, mode = ?config.mode, "starting imageswap");

    let client = kube::Client::try_default()
        .await
        .context("building Kubernetes client from the in-cluster or local kubeconfig")?;

    let tls_material = tls::bootstrap(client.clone(), &config).await.unwrap_or_else(|err| {
        error!(%err, "TLS bootstrap failed, exiting so Kubernetes restarts the pod");
        std::process::exit(1);
    });

    reconciler::reconcile(client.clone(), &config, &tls_material.issued_by)
        .await
        .unwrap_or_else(|err| {
            error!(%err, "webhook configuration reconcile failed, exiting so Kubernetes restarts the pod");
            std::process::exit(1);
        });

    let metrics_handle = metrics::start_metrics_server(&config).await?;

    let rule_tables = Arc::new(
        RuleTablesHandle::load(&config.maps_file).context("loading initial image swap map file")?,
    );
    let reload_handle = imageswap::maps::spawn_reload_task(rule_tables.clone(), MAP_RELOAD_INTERVAL);

    let admission_handle = admission::start_admission_server(config.clone(), rule_tables).await?;

    info!("imageswap is running");

    tokio::select! {
        _ = metrics_handle => info!("metrics server stopped"),
        _ = admission_handle => info!("admission server stopped"),
        _ = reload_handle => info!("map reload task stopped"),
    }

    Ok(())
}
