//! Process-wide application configuration.
//!
//! Everything this binary reads from the environment is parsed once, here,
//! into a single typed, `Clone`-able value and threaded explicitly into every
//! task spawned from `main` — no component reaches into `std::env` itself.

use std::path::PathBuf;

use thiserror::Error;

/// Swap-resolution mode. `Maps` is the table-driven pipeline of the swap
/// engine; `Legacy` is the single-prefix mode kept for operators migrating
/// off the original flat-mirror behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Maps,
    Legacy,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingRequired(&'static str),
}

/// Every environment-derived and file-path constant this service needs,
/// built once in `main` and cloned cheaply into each task.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub namespace: String,
    pub pod_name: String,
    pub log_level: String,
    pub disable_label: String,
    pub mode: Mode,
    pub maps_file: PathBuf,
    pub image_prefix: String,

    pub svc_name: String,
    pub tls_secret_name: String,
    pub tls_byoc_annotation: String,
    pub mwc_name: String,
    pub mwc_webhook_name: String,

    pub metrics_port: u16,
    pub admission_port: u16,

    /// Constants: not independently configurable via environment variables,
    /// but named here so every module reads them from `AppConfig` rather
    /// than hardcoding a literal.
    pub tls_rootca_secret_name: String,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,
    pub mwc_template_path: PathBuf,
}

impl AppConfig {
    /// Reads the environment variables documented in the external
    /// interfaces section, applying the documented defaults. Fails only if
    /// `IMAGESWAP_POD_NAME` is absent — every other variable has a usable
    /// default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let pod_name = std::env::var("IMAGESWAP_POD_NAME")
            .map_err(|_| ConfigError::MissingRequired("IMAGESWAP_POD_NAME"))?;

        let mode = match env_string("IMAGESWAP_MODE", "MAPS").to_uppercase().as_str() {
            "LEGACY" => Mode::Legacy,
            _ => Mode::Maps,
        };

        Ok(AppConfig {
            namespace: env_string("IMAGESWAP_NAMESPACE_NAME", "imageswap-system"),
            pod_name,
            log_level: env_string("IMAGESWAP_LOG_LEVEL", "info"),
            disable_label: env_string("IMAGESWAP_DISABLE_LABEL", "k8s.twr.io/imageswap"),
            mode,
            maps_file: PathBuf::from(env_string(
                "IMAGESWAP_MAPS_FILE",
                "/app/maps/imageswap-maps.conf",
            )),
            image_prefix: env_string("IMAGE_PREFIX", ""),

            svc_name: env_string("IMAGESWAP_SVC_NAME", "imageswap-webhook-svc"),
            tls_secret_name: env_string("IMAGESWAP_TLS_SECRET_NAME", "imageswap-tls"),
            tls_byoc_annotation: env_string("IMAGESWAP_TLS_BYOC_ANNOTATION", "imageswap-byoc"),
            mwc_name: env_string("IMAGESWAP_MWC_NAME", "imageswap-webhook"),
            mwc_webhook_name: env_string(
                "IMAGESWAP_WEBHOOK_NAME",
                "imageswap.webhook.k8s.twr.io",
            ),

            metrics_port: env_parse("IMAGESWAP_METRICS_PORT", 9090),
            admission_port: env_parse("IMAGESWAP_ADMISSION_PORT", 5000),

            tls_rootca_secret_name: "imageswap-tls-ca".to_string(),
            tls_cert_path: PathBuf::from("/tls/cert.pem"),
            tls_key_path: PathBuf::from("/tls/key.pem"),
            mwc_template_path: PathBuf::from("/mwc/imageswap-mwc.yaml"),
        })
    }

    pub fn tracing_filter(&self) -> String {
        format!("imageswap={level},kube={level}", level = self.log_level.to_lowercase())
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
