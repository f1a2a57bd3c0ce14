//! TLS identity bootstrap: the `READ_SECRET -> DECIDE -> (GENERATE|REUSE) ->
//! (CSR_CYCLE|SKIP_CSR) -> WRITE_SECRET -> WRITE_LOCAL_FILES -> DONE` state
//! machine run once per pod before the admission server starts accepting
//! traffic.
//!
//! Bootstrap favors crashing loudly: any `TlsError` here is fatal and the
//! caller (`main`) terminates the process so Kubernetes restarts the pod.

mod csr;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{info, instrument, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::AppConfig;
use crate::metrics::{BOOTSTRAP_STATE, TLS_ROTATIONS_TOTAL};

const ROTATE_THRESHOLD: chrono::Duration = chrono::Duration::days(180);
const UPDATED_BY_POD_LABEL: &str = "imageswap/updated-by-pod";
const SECRET_WRITER_POLL_WINDOW: Duration = Duration::from_secs(30);
const SECRET_WRITER_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("generating RSA keypair: {0}")]
    KeyGen(String),
    #[error("building certificate signing request: {0}")]
    CsrBuild(String),
    #[error("timed out waiting for certificate signing request {0} to be issued")]
    CsrTimeout(String),
    #[error("kubernetes API error: {0}")]
    ClusterApi(String),
    #[error("BYOC secret is missing a non-empty rootca.pem field")]
    ByocMissingRootCa,
    #[error("BYOC secret is missing cert.pem/key.pem data")]
    ByocMissingMaterial,
    #[error("reading local file {path}: {source}")]
    LocalFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Whether the certificate in play was supplied by the operator ("bring
/// your own cert") or generated/rotated by this bootstrap via a cluster CSR.
/// Modeled as an enum, not a boolean threaded through every function, per
/// the design note on tagged variants.
#[derive(Debug, Clone)]
pub enum CertSource {
    ClusterSigned,
    Byoc { root_ca_pem: String },
}

/// The TLS material produced by a bootstrap run: owned here transiently,
/// written out to the local filesystem for the admission server to load,
/// with the authoritative copy living in the cluster secret.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub not_after: DateTime<Utc>,
    pub issued_by: CertSource,
}

/// Runs the full bootstrap state machine and returns the TLS material the
/// admission server should serve. Also writes `cert.pem`/`key.pem` to the
/// configured local paths as a side effect of `WRITE_LOCAL_FILES`.
#[instrument(skip(client, config), fields(namespace = %config.namespace, pod = %config.pod_name))]
pub async fn bootstrap(client: Client, config: &AppConfig) -> Result<TlsMaterial, TlsError> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &config.namespace);

    // READ_SECRET
    BOOTSTRAP_STATE.set(1);
    let existing = read_secret(&secrets, &config.tls_secret_name).await?;
    let byoc = match &existing {
        Some(secret) => check_byoc(&secrets, secret, config).await?,
        None => None,
    };

    // DECIDE
    BOOTSTRAP_STATE.set(2);
    let decision = decide(&existing, &byoc)?;
    info!(rotate = decision.rotate, byoc = byoc.is_some(), "bootstrap decision made");

    let material = if decision.rotate {
        // GENERATE + CSR_CYCLE
        BOOTSTRAP_STATE.set(3);
        TLS_ROTATIONS_TOTAL.inc();
        let key = csr::generate_keypair()?;
        let csr_der = csr::build_csr_der(config, &key)?;

        BOOTSTRAP_STATE.set(4);
        let certificate_pem = csr::submit_approve_and_issue(client.clone(), config, csr_der).await?;
        let not_after = parse_not_after(&certificate_pem)?;

        TlsMaterial {
            certificate_pem,
            private_key_pem: key.private_key_pem,
            not_after,
            issued_by: CertSource::ClusterSigned,
        }
    } else {
        // REUSE + SKIP_CSR
        BOOTSTRAP_STATE.set(5);
        let secret = existing.as_ref().expect("reuse path implies an existing secret");
        let (certificate_pem, private_key_pem) = decode_cert_key(secret)?;
        let not_after = parse_not_after(&certificate_pem)?;
        TlsMaterial {
            certificate_pem,
            private_key_pem,
            not_after,
            issued_by: byoc
                .clone()
                .map(|root_ca_pem| CertSource::Byoc { root_ca_pem })
                .unwrap_or(CertSource::ClusterSigned),
        }
    };

    // WRITE_SECRET
    BOOTSTRAP_STATE.set(6);
    let material = write_secret(&secrets, config, existing.is_some(), decision.rotate, byoc.is_some(), material).await?;

    // WRITE_LOCAL_FILES
    BOOTSTRAP_STATE.set(7);
    write_local_files(config, &material)?;

    BOOTSTRAP_STATE.set(8);
    Ok(material)
}

async fn read_secret(secrets: &Api<Secret>, name: &str) -> Result<Option<Secret>, TlsError> {
    match secrets.get(name).await {
        Ok(secret) => Ok(Some(secret)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(TlsError::ClusterApi(e.to_string())),
    }
}

/// Returns `Some(root_ca_pem)` when the secret carries the BYOC annotation,
/// reading and validating the companion root CA secret.
async fn check_byoc(secrets: &Api<Secret>, secret: &Secret, config: &AppConfig) -> Result<Option<String>, TlsError> {
    let annotated = secret
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(&config.tls_byoc_annotation));

    if !annotated {
        return Ok(None);
    }

    let rootca_secret = secrets
        .get(&config.tls_rootca_secret_name)
        .await
        .map_err(|e| TlsError::ClusterApi(e.to_string()))?;

    let rootca_bytes = rootca_secret
        .data
        .as_ref()
        .and_then(|d| d.get("rootca.pem"))
        .map(|b| b.0.clone())
        .filter(|b| !b.is_empty())
        .ok_or(TlsError::ByocMissingRootCa)?;

    let pem = String::from_utf8(rootca_bytes).map_err(|_| TlsError::ByocMissingRootCa)?;
    Ok(Some(pem))
}

struct Decision {
    rotate: bool,
}

fn decide(existing: &Option<Secret>, byoc: &Option<String>) -> Result<Decision, TlsError> {
    let Some(secret) = existing else {
        return Ok(Decision { rotate: true });
    };

    let has_material = secret
        .data
        .as_ref()
        .is_some_and(|d| non_empty(d.get("cert.pem")) && non_empty(d.get("key.pem")));

    if !has_material {
        return if byoc.is_some() {
            Err(TlsError::ByocMissingMaterial)
        } else {
            Ok(Decision { rotate: true })
        };
    }

    let (cert_pem, _) = decode_cert_key(secret)?;
    let not_after = parse_not_after(&cert_pem)?;
    let remaining = not_after - Utc::now();

    if remaining > ROTATE_THRESHOLD {
        return Ok(Decision { rotate: false });
    }

    if byoc.is_some() {
        warn!("certificate is near expiry but is operator-supplied (BYOC); not rotating");
        return Ok(Decision { rotate: false });
    }

    Ok(Decision { rotate: true })
}

fn non_empty(bytes: Option<&ByteString>) -> bool {
    bytes.is_some_and(|b| !b.0.is_empty())
}

fn decode_cert_key(secret: &Secret) -> Result<(String, String), TlsError> {
    let data = secret.data.as_ref().ok_or(TlsError::ByocMissingMaterial)?;
    let cert = data.get("cert.pem").ok_or(TlsError::ByocMissingMaterial)?;
    let key = data.get("key.pem").ok_or(TlsError::ByocMissingMaterial)?;
    let cert_pem = String::from_utf8(cert.0.clone()).map_err(|_| TlsError::ByocMissingMaterial)?;
    let key_pem = String::from_utf8(key.0.clone()).map_err(|_| TlsError::ByocMissingMaterial)?;
    Ok((cert_pem, key_pem))
}

fn parse_not_after(cert_pem: &str) -> Result<DateTime<Utc>, TlsError> {
    let der = pem_to_der(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der).map_err(|e| TlsError::CsrBuild(e.to_string()))?;
    let not_after = cert.validity().not_after;
    DateTime::from_timestamp(not_after.timestamp(), 0).ok_or(TlsError::CsrBuild("invalid certificate expiry".to_string()))
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>, TlsError> {
    let (_, doc) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).map_err(|e| TlsError::CsrBuild(e.to_string()))?;
    Ok(doc.contents)
}

/// Applies the `WRITE_SECRET` transition and returns the `TlsMaterial` the
/// pod should actually serve — which may differ from `material` if another
/// replica won a create race and we fell back to reading its result.
async fn write_secret(
    secrets: &Api<Secret>,
    config: &AppConfig,
    existed: bool,
    rotated: bool,
    byoc: bool,
    material: TlsMaterial,
) -> Result<TlsMaterial, TlsError> {
    if !existed {
        let secret = build_secret(config, &material);
        match secrets.create(&PostParams::default(), &secret).await {
            Ok(_) => {
                info!(secret = %config.tls_secret_name, "created TLS secret");
                return Ok(material);
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                warn!("lost the race to create the TLS secret; waiting for the winner");
                wait_for_writer(secrets, config).await;
                let winner = secrets
                    .get(&config.tls_secret_name)
                    .await
                    .map_err(|e| TlsError::ClusterApi(e.to_string()))?;
                let (certificate_pem, private_key_pem) = decode_cert_key(&winner)?;
                let not_after = parse_not_after(&certificate_pem)?;
                return Ok(TlsMaterial {
                    certificate_pem,
                    private_key_pem,
                    not_after,
                    issued_by: material.issued_by,
                });
            }
            Err(e) => return Err(TlsError::ClusterApi(e.to_string())),
        }
    }

    if rotated && !byoc {
        let patch = serde_json::json!({
            "metadata": { "labels": { UPDATED_BY_POD_LABEL: config.pod_name } },
            "data": {
                "cert.pem": base64_encode(material.certificate_pem.as_bytes()),
                "key.pem": base64_encode(material.private_key_pem.as_bytes()),
            }
        });
        secrets
            .patch(&config.tls_secret_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| TlsError::ClusterApi(e.to_string()))?;
        info!(secret = %config.tls_secret_name, "patched TLS secret with rotated material");
    } else {
        wait_for_writer(secrets, config).await;
    }

    Ok(material)
}

fn build_secret(config: &AppConfig, material: &TlsMaterial) -> Secret {
    let mut data = BTreeMap::new();
    data.insert("cert.pem".to_string(), ByteString(material.certificate_pem.clone().into_bytes()));
    data.insert("key.pem".to_string(), ByteString(material.private_key_pem.clone().into_bytes()));

    Secret {
        metadata: ObjectMeta {
            name: Some(config.tls_secret_name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(
                [
                    ("app".to_string(), "imageswap".to_string()),
                    (UPDATED_BY_POD_LABEL.to_string(), config.pod_name.clone()),
                ]
                .into(),
            ),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// Waits up to ~30s for the `updated-by-pod` label to carry a non-empty
/// value, per the race protocol. Resolves the original's ambiguous exit
/// condition: on timeout, proceeds with whatever is currently in the
/// secret rather than failing the pod.
async fn wait_for_writer(secrets: &Api<Secret>, config: &AppConfig) {
    let deadline = Instant::now() + SECRET_WRITER_POLL_WINDOW;

    loop {
        match secrets.get(&config.tls_secret_name).await {
            Ok(secret) => {
                let label = secret
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(UPDATED_BY_POD_LABEL))
                    .filter(|v| !v.is_empty());
                if label.is_some() {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "error polling TLS secret for writer label"),
        }

        if Instant::now() >= deadline {
            warn!("timed out waiting for updated-by-pod label; proceeding with current secret contents");
            return;
        }

        sleep(SECRET_WRITER_POLL_INTERVAL).await;
    }
}

fn write_local_files(config: &AppConfig, material: &TlsMaterial) -> Result<(), TlsError> {
    std::fs::write(&config.tls_cert_path, &material.certificate_pem).map_err(|source| TlsError::LocalFile {
        path: config.tls_cert_path.display().to_string(),
        source,
    })?;
    std::fs::write(&config.tls_key_path, &material.private_key_pem).map_err(|source| TlsError::LocalFile {
        path: config.tls_key_path.display().to_string(),
        source,
    })?;
    info!(cert = %config.tls_cert_path.display(), key = %config.tls_key_path.display(), "wrote TLS material locally");
    Ok(())
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_empty_detects_blank_bytestrings() {
        assert!(!non_empty(Some(&ByteString(Vec::new()))));
        assert!(non_empty(Some(&ByteString(vec![1]))));
        assert!(!non_empty(None));
    }
}
