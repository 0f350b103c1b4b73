use chrono::Utc;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;
use tracing::{debug, info};

use crate::cluster::{collection_path, item_path, ClusterApi};
use crate::error::Error;
use crate::pki::{generate_csr_pem, import_signed_certificate, Certificate, KeyPairRecord};
use crate::retry::{poll_until_ready, PollConfig};

pub const CSR_USAGES: [&str; 3] = ["digital signature", "key encipherment", "server auth"];
const APPROVAL_REASON: &str = "OpenUnison Deployment";
const APPROVAL_MESSAGE: &str = "This CSR was approved by the OpenUnison bootstrap";

/// A CSR the API server has accepted but nobody has approved yet.
#[derive(Debug)]
pub struct SubmittedCsr {
    name: String,
    record: KeyPairRecord,
}

/// A CSR carrying an `Approved` condition, waiting for the signer.
#[derive(Debug)]
pub struct ApprovedCsr {
    name: String,
    record: KeyPairRecord,
}

/// Drives submit, approve and fetch against the cluster's CSR API for one
/// certificate at a time.
pub struct CsrApprovalProtocol<'a> {
    api: &'a dyn ClusterApi,
    signer_name: &'a str,
    poll: &'a PollConfig,
}

impl<'a> CsrApprovalProtocol<'a> {
    pub fn new(
        api: &'a dyn ClusterApi,
        signer_name: &'a str,
        poll: &'a PollConfig,
    ) -> CsrApprovalProtocol<'a> {
        CsrApprovalProtocol {
            api,
            signer_name,
            poll,
        }
    }

    /// Runs all three steps and returns the certificate with the
    /// authority-signed chain in place of the self-signed one.
    pub async fn sign(&self, name: &str, record: KeyPairRecord) -> Result<Certificate, Error> {
        let submitted = self.submit(name, record).await?;
        let approved = self.approve(submitted).await?;
        self.fetch(approved).await
    }

    pub async fn submit(&self, name: &str, record: KeyPairRecord) -> Result<SubmittedCsr, Error> {
        let submission_error = |reason: String| Error::Submission {
            name: name.to_string(),
            reason,
        };

        // a CSR left over from an earlier run belongs to a different key
        let existing = self
            .api
            .get(&item_path::<CertificateSigningRequest>(name, None))
            .await
            .map_err(|e| submission_error(e.to_string()))?;
        if existing.is_some() {
            return Err(submission_error("a CSR with this name already exists".into()));
        }

        let request = generate_csr_pem(&record)?;
        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(request.into_bytes()),
                signer_name: self.signer_name.to_string(),
                usages: Some(CSR_USAGES.iter().map(|u| u.to_string()).collect()),
                ..Default::default()
            },
            status: None,
        };

        info!(csr = name, "Requesting certificate");
        self.api
            .create(
                &collection_path::<CertificateSigningRequest>(None),
                &serde_json::to_value(&csr)?,
            )
            .await
            .map_err(|e| submission_error(e.to_string()))?;

        Ok(SubmittedCsr {
            name: name.to_string(),
            record,
        })
    }

    pub async fn approve(&self, csr: SubmittedCsr) -> Result<ApprovedCsr, Error> {
        let approval_error = |reason: String| Error::Approval {
            name: csr.name.clone(),
            reason,
        };
        let path = item_path::<CertificateSigningRequest>(&csr.name, None);

        let current = self
            .api
            .get(&path)
            .await
            .map_err(|e| approval_error(e.to_string()))?
            .ok_or_else(|| approval_error("CSR does not exist".into()))?;
        let mut current: CertificateSigningRequest = serde_json::from_value(current)?;

        let mut status = current.status.take().unwrap_or_default();
        let mut conditions = status.conditions.take().unwrap_or_default();
        conditions.push(CertificateSigningRequestCondition {
            type_: "Approved".into(),
            status: "True".into(),
            reason: Some(APPROVAL_REASON.into()),
            message: Some(APPROVAL_MESSAGE.into()),
            last_update_time: Some(Time(Utc::now())),
            ..Default::default()
        });
        status.conditions = Some(conditions);
        current.status = Some(status);

        info!(csr = %csr.name, "Approving certificate");
        self.api
            .replace(&format!("{}/approval", path), &serde_json::to_value(&current)?)
            .await
            .map_err(|e| approval_error(e.to_string()))?;

        Ok(ApprovedCsr {
            name: csr.name,
            record: csr.record,
        })
    }

    pub async fn fetch(&self, csr: ApprovedCsr) -> Result<Certificate, Error> {
        info!(csr = %csr.name, "Retrieving certificate from API server");
        let operation = format!("signed certificate for CSR {}", csr.name);
        let signed =
            poll_until_ready(self.poll, &operation, || self.read_certificate(&csr.name)).await?;
        debug!(csr = %csr.name, bytes = signed.len(), "Signed certificate received");
        import_signed_certificate(csr.record, &signed)
    }

    async fn read_certificate(&self, name: &str) -> Result<Vec<u8>, Error> {
        let path = item_path::<CertificateSigningRequest>(name, None);
        let current = self.api.get(&path).await?.ok_or_else(|| Error::Approval {
            name: name.to_string(),
            reason: "CSR no longer exists".into(),
        })?;
        let current: CertificateSigningRequest = serde_json::from_value(current)?;
        let status = current.status.unwrap_or_default();

        let refused = status
            .conditions
            .iter()
            .flatten()
            .any(|c| (c.type_ == "Denied" || c.type_ == "Failed") && c.status == "True");
        if refused {
            return Err(Error::Approval {
                name: name.to_string(),
                reason: "CSR was denied or failed to sign".into(),
            });
        }

        match status.certificate {
            Some(ByteString(bytes)) if !bytes.is_empty() => Ok(bytes),
            _ => Err(Error::Retrieval {
                name: name.to_string(),
            }),
        }
    }
}

/// CSR name for a cluster service: `<service>.<namespace>.svc.cluster.local`,
/// with an optional per-run suffix.
pub fn service_csr_name(service: &str, namespace: &str, suffix: Option<&str>) -> String {
    let base = format!("{}.{}.svc.cluster.local", service, namespace);
    match suffix {
        Some(s) if !s.is_empty() => format!("{}-{}", base, s),
        _ => base,
    }
}
