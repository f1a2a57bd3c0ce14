//! Loads the `MutatingWebhookConfiguration` template, injects the trust
//! bundle, and converges the cluster object via a structural diff-then-patch
//! against the desired state.
//!
//! Per the design notes, the diff is implemented directly over
//! `serde_json::Value` (whose own variants already distinguish
//! object/array/scalar) rather than a parallel tagged-tree type.

use std::fs;

use base64::Engine;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use kube::api::{Api, PostParams};
use kube::Client;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::AppConfig;
use crate::metrics::MWC_RECONCILE_TOTAL;
use crate::tls::CertSource;

const PKS_NAMESPACE: &str = "pks-system";
const IN_CLUSTER_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("reading webhook template {path}: {source}")]
    ReadTemplate {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing webhook template: {0}")]
    ParseTemplate(String),
    #[error("webhook template has no entry named {0}")]
    WebhookNotFound(String),
    #[error("kubernetes API error: {0}")]
    ClusterApi(String),
    #[error("reading cluster CA bundle: {0}")]
    RootCa(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    None,
    Create,
    Patch,
}

/// Loads the template, derives the trust bundle, and brings the cluster's
/// `MutatingWebhookConfiguration` into line with it.
#[instrument(skip(client, config, cert_source), fields(mwc = %config.mwc_name))]
pub async fn reconcile(
    client: Client,
    config: &AppConfig,
    cert_source: &CertSource,
) -> Result<ReconcileAction, ReconcileError> {
    let mut template = load_template(config)?;
    let bundle = derive_trust_bundle(client.clone(), config, cert_source).await?;
    inject_ca_bundle(&mut template, config, &bundle)?;

    let api: Api<MutatingWebhookConfiguration> = Api::all(client);

    let action = match api.get(&config.mwc_name).await {
        Ok(existing) => {
            let existing_value = serde_json::to_value(&existing).map_err(|e| ReconcileError::ParseTemplate(e.to_string()))?;
            if values_equal(&template, &existing_value) {
                info!("existing MutatingWebhookConfiguration already matches the template");
                ReconcileAction::None
            } else {
                info!("template differs from the cluster object, replacing");
                let mut desired: MutatingWebhookConfiguration =
                    serde_json::from_value(template).map_err(|e| ReconcileError::ParseTemplate(e.to_string()))?;
                // Replace the whole object rather than computing a minimal
                // JSON Patch (§9): carry over the resourceVersion so the
                // PUT is accepted as an update, not a conflicting create.
                desired.metadata.resource_version = existing.metadata.resource_version.clone();
                api.replace(&config.mwc_name, &PostParams::default(), &desired)
                    .await
                    .map_err(|e| ReconcileError::ClusterApi(e.to_string()))?;
                ReconcileAction::Patch
            }
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            info!("no existing MutatingWebhookConfiguration, creating");
            let desired: MutatingWebhookConfiguration =
                serde_json::from_value(template).map_err(|e| ReconcileError::ParseTemplate(e.to_string()))?;
            api.create(&PostParams::default(), &desired)
                .await
                .map_err(|e| ReconcileError::ClusterApi(e.to_string()))?;
            ReconcileAction::Create
        }
        Err(e) => return Err(ReconcileError::ClusterApi(e.to_string())),
    };

    let action_label = match action {
        ReconcileAction::None => "none",
        ReconcileAction::Create => "create",
        ReconcileAction::Patch => "patch",
    };
    MWC_RECONCILE_TOTAL.with_label_values(&[action_label]).inc();

    Ok(action)
}

fn load_template(config: &AppConfig) -> Result<serde_json::Value, ReconcileError> {
    let contents = fs::read_to_string(&config.mwc_template_path).map_err(|source| ReconcileError::ReadTemplate {
        path: config.mwc_template_path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|e| ReconcileError::ParseTemplate(e.to_string()))
}

fn inject_ca_bundle(template: &mut serde_json::Value, config: &AppConfig, bundle_b64: &str) -> Result<(), ReconcileError> {
    let webhooks = template
        .get_mut("webhooks")
        .and_then(|w| w.as_array_mut())
        .ok_or_else(|| ReconcileError::WebhookNotFound(config.mwc_webhook_name.clone()))?;

    let entry = webhooks
        .iter_mut()
        .find(|w| w.get("name").and_then(|n| n.as_str()) == Some(config.mwc_webhook_name.as_str()))
        .ok_or_else(|| ReconcileError::WebhookNotFound(config.mwc_webhook_name.clone()))?;

    let client_config = entry
        .get_mut("clientConfig")
        .and_then(|c| c.as_object_mut())
        .ok_or_else(|| ReconcileError::WebhookNotFound(config.mwc_webhook_name.clone()))?;

    client_config.insert("caBundle".to_string(), serde_json::Value::String(bundle_b64.to_string()));
    Ok(())
}

async fn derive_trust_bundle(client: Client, config: &AppConfig, cert_source: &CertSource) -> Result<String, ReconcileError> {
    let engine = base64::engine::general_purpose::STANDARD;

    match cert_source {
        CertSource::Byoc { root_ca_pem } => Ok(engine.encode(root_ca_pem.as_bytes())),
        CertSource::ClusterSigned => {
            if looks_like_pks(client.clone()).await? {
                info!("PKS cluster detected, reading CA from extension-apiserver-authentication configmap");
                let configmaps: Api<k8s_openapi::api::core::v1::ConfigMap> = Api::namespaced(client, "kube-system");
                let cm = configmaps
                    .get("extension-apiserver-authentication")
                    .await
                    .map_err(|e| ReconcileError::RootCa(e.to_string()))?;
                let ca = cm
                    .data
                    .as_ref()
                    .and_then(|d| d.get("client-ca-file"))
                    .ok_or_else(|| ReconcileError::RootCa("client-ca-file not found in configmap".to_string()))?;
                Ok(engine.encode(ca.as_bytes()))
            } else {
                let raw = fs::read_to_string(IN_CLUSTER_CA_PATH).map_err(|e| ReconcileError::RootCa(e.to_string()))?;
                Ok(engine.encode(raw.as_bytes()))
            }
        }
    }
}

async fn looks_like_pks(client: Client) -> Result<bool, ReconcileError> {
    let namespaces: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(client);
    let list = namespaces
        .list(&Default::default())
        .await
        .map_err(|e| ReconcileError::ClusterApi(e.to_string()))?;
    Ok(list.items.iter().any(|ns| ns.metadata.name.as_deref() == Some(PKS_NAMESPACE)))
}

/// Recursive structural comparison over the `new` (template) tree: every key
/// or index present in `new` must be present and equal in `existing`. Keys
/// that `existing` carries but `new` doesn't are ignored, matching the
/// ported comparison's one-directional walk.
fn values_equal(new: &serde_json::Value, existing: &serde_json::Value) -> bool {
    use serde_json::Value;

    match new {
        Value::Object(map) => map.iter().all(|(key, value)| match existing.get(key) {
            Some(existing_value) => values_equal(value, existing_value),
            None => {
                warn!(%key, "template field missing from existing object");
                false
            }
        }),
        Value::Array(items) => {
            let existing_items = existing.as_array();
            items.iter().enumerate().all(|(index, value)| match existing_items.and_then(|a| a.get(index)) {
                Some(existing_value) => values_equal(value, existing_value),
                None => false,
            })
        }
        scalar => scalar == existing,
    }
}
