//! Keypair generation and the Kubernetes `CertificateSigningRequest` cycle.

use k8s_openapi::ByteString;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use rsa::pkcs8::EncodePrivateKey;
use serde_json::json;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info, warn};

use super::TlsError;
use crate::config::AppConfig;

const CSR_SIGNER_NAME: &str = "kubernetes.io/kubelet-serving";
const CSR_POLL_WINDOW: Duration = Duration::from_secs(5);
const CSR_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A freshly generated RSA keypair, kept as both the PKCS#8 PEM (written to
/// the local filesystem and the cluster secret) and an `rcgen::KeyPair`
/// (needed to sign the CSR).
pub struct GeneratedKey {
    pub private_key_pem: String,
    keypair: rcgen::KeyPair,
}

/// Generates a 2048-bit RSA keypair with the standard 65537 public exponent,
/// per the bootstrap's `GENERATE` state.
pub fn generate_keypair() -> Result<GeneratedKey, TlsError> {
    let mut rng = rsa::rand_core::OsRng;
    let rsa_key = rsa::RsaPrivateKey::new(&mut rng, 2048).map_err(|e| TlsError::KeyGen(e.to_string()))?;

    let pkcs8_der = rsa_key
        .to_pkcs8_der()
        .map_err(|e| TlsError::KeyGen(e.to_string()))?;
    let private_key_pem = rsa_key
        .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|e| TlsError::KeyGen(e.to_string()))?
        .to_string();

    let keypair = rcgen::KeyPair::from_der(pkcs8_der.as_bytes()).map_err(|e| TlsError::KeyGen(e.to_string()))?;

    Ok(GeneratedKey { private_key_pem, keypair })
}

/// Builds the DER-encoded PKCS#10 certificate signing request with the
/// subject, organization, and SANs the bootstrap's `CSR_CYCLE` state
/// requires.
pub fn build_csr_der(config: &AppConfig, key: &GeneratedKey) -> Result<Vec<u8>, TlsError> {
    let svc = &config.svc_name;
    let ns = &config.namespace;
    let fqdn = format!("{svc}.{ns}.svc");

    let mut params = rcgen::CertificateParams::new(vec![
        svc.clone(),
        format!("{svc}.{ns}"),
        fqdn.clone(),
    ])
    .map_err(|e| TlsError::CsrBuild(e.to_string()))?;

    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, format!("system:node:{fqdn}"));
    dn.push(rcgen::DnType::OrganizationName, "system:nodes");
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(&key.keypair)
        .map_err(|e| TlsError::CsrBuild(e.to_string()))?;

    Ok(csr.der().to_vec())
}

fn csr_name(config: &AppConfig) -> String {
    format!("{}.{}.cert-request", config.svc_name, config.namespace)
}

/// Submits the CSR, idempotently deleting any prior request of the same
/// name first, approves it in the name of this pod, and polls until the
/// cluster has issued a signed certificate.
///
/// Matches the original bootstrap's "delete then create" idempotency: two
/// replicas racing here will have one succeed and one observe an
/// `AlreadyExists`/transient conflict on create, which is treated as
/// informational rather than fatal — the caller falls back to reading
/// whatever the other replica produces via the shared secret.
pub async fn submit_approve_and_issue(
    client: Client,
    config: &AppConfig,
    csr_der: Vec<u8>,
) -> Result<String, TlsError> {
    let api: Api<CertificateSigningRequest> = Api::all(client);
    let name = csr_name(config);

    match api.get(&name).await {
        Ok(_) => {
            info!(csr = %name, "deleting existing certificate signing request");
            api.delete(&name, &DeleteParams::default())
                .await
                .map_err(|e| TlsError::ClusterApi(e.to_string()))?;
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!(csr = %name, "no existing certificate signing request found");
        }
        Err(e) => return Err(TlsError::ClusterApi(e.to_string())),
    }

    let csr = CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some([("app".to_string(), "imageswap".to_string())].into()),
            ..Default::default()
        },
        spec: CertificateSigningRequestSpec {
            groups: Some(vec!["system:authenticated".to_string()]),
            usages: Some(vec![
                "key encipherment".to_string(),
                "digital signature".to_string(),
                "server auth".to_string(),
            ]),
            request: ByteString(csr_der),
            signer_name: CSR_SIGNER_NAME.to_string(),
            ..Default::default()
        },
        status: None,
    };

    match api.create(&PostParams::default(), &csr).await {
        Ok(_) => {
            info!(csr = %name, "certificate signing request created");
            approve(&api, &name, config).await?;
        }
        Err(kube::Error::Api(e)) if e.code == 409 => {
            warn!(csr = %name, "lost the race to create the certificate signing request; reading the winner's");
        }
        Err(e) => return Err(TlsError::ClusterApi(e.to_string())),
    }

    poll_for_certificate(&api, &name).await
}

async fn approve(
    api: &Api<CertificateSigningRequest>,
    name: &str,
    config: &AppConfig,
) -> Result<(), TlsError> {
    let condition = CertificateSigningRequestCondition {
        type_: "Approved".to_string(),
        status: "True".to_string(),
        reason: Some("AutoApproved".to_string()),
        message: Some("Automatically approved by imageswap bootstrap".to_string()),
        ..Default::default()
    };

    let mut csr = api.get(name).await.map_err(|e| TlsError::ClusterApi(e.to_string()))?;
    let mut status = csr.status.take().unwrap_or_default();
    status.conditions = Some(vec![condition]);
    csr.status = Some(status);

    let patch = json!({ "status": csr.status });
    api.patch_subresource("approval", name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| TlsError::ClusterApi(e.to_string()))?;

    info!(csr = %name, pod = %config.pod_name, "certificate signing request approved");
    Ok(())
}

async fn poll_for_certificate(api: &Api<CertificateSigningRequest>, name: &str) -> Result<String, TlsError> {
    let deadline = Instant::now() + CSR_POLL_WINDOW;

    loop {
        let csr = api.get(name).await.map_err(|e| TlsError::ClusterApi(e.to_string()))?;

        if let Some(status) = &csr.status {
            let approved = status
                .conditions
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|c| c.type_ == "Approved");

            if approved {
                if let Some(cert) = &status.certificate {
                    let pem = String::from_utf8(cert.0.clone()).map_err(|e| TlsError::CsrBuild(e.to_string()))?;
                    info!(csr = %name, "certificate issued");
                    return Ok(pem);
                }
            }
        }

        if Instant::now() >= deadline {
            warn!(csr = %name, "timed out waiting for certificate issuance");
            return Err(TlsError::CsrTimeout(name.to_string()));
        }

        sleep(CSR_POLL_INTERVAL).await;
    }
}
