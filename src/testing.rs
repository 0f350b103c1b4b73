//! In-memory cluster and certificate authority used by the unit tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use kube::core::ErrorResponse;
use kube::Resource;
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa};
use serde::Serialize;
use serde_json::{json, Value};

use crate::cluster::{item_path, ClusterApi, CLUSTER_CA};
use crate::config::{InputProperties, LEGACY_SIGNER};
use crate::error::Error;

pub const TEST_SIGNER: &str = "example.com/openunison-serving";

/// The properties of a typical first install.
pub fn scenario_a() -> InputProperties {
    [
        ("unisonKeystorePassword", "pw1"),
        ("OU_HOST", "ou.example.com"),
        ("OU_CERT_OU", "k8s"),
        ("OU_CERT_O", "org"),
        ("OU_CERT_L", "city"),
        ("OU_CERT_ST", "state"),
        ("OU_CERT_C", "us"),
        ("K8S_DASHBOARD_HOST", "dash.example.com"),
    ]
    .into_iter()
    .collect()
}

/// Stands in for the cluster's CSR signer.
pub struct TestAuthority {
    ca: rcgen::Certificate,
    cert_pem: String,
}

impl TestAuthority {
    pub fn new() -> TestAuthority {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "test cluster ca");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = rcgen::Certificate::from_params(params).unwrap();
        let cert_pem = ca.serialize_pem().unwrap();
        TestAuthority { ca, cert_pem }
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Signs a PEM CSR and returns the leaf followed by the authority.
    pub fn sign(&self, csr_pem: &str) -> String {
        let csr = rcgen::CertificateSigningRequest::from_pem(csr_pem).unwrap();
        let leaf = csr.serialize_pem_with_signer(&self.ca).unwrap();
        format!("{}{}", leaf, self.cert_pem)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub method: &'static str,
    pub path: String,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Value>,
    calls: Vec<Call>,
    // CSR path -> (reads left, encoded certificate)
    pending: BTreeMap<String, (u32, String)>,
}

pub struct FakeCluster {
    state: Mutex<State>,
    authority: TestAuthority,
    token_secrets: bool,
    deny_approval: bool,
    sign_after_reads: u32,
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message,
        reason: reason.into(),
        code,
    }))
}

fn object_name(body: &Value) -> String {
    body["metadata"]["name"].as_str().unwrap_or_default().to_string()
}

impl FakeCluster {
    pub fn new() -> FakeCluster {
        FakeCluster {
            state: Mutex::new(State::default()),
            authority: TestAuthority::new(),
            token_secrets: true,
            deny_approval: false,
            sign_after_reads: 0,
        }
    }

    /// Service accounts are created without a token secret, as on clusters
    /// that no longer populate them.
    pub fn without_token_secrets(mut self) -> FakeCluster {
        self.token_secrets = false;
        self
    }

    pub fn deny_approval(mut self) -> FakeCluster {
        self.deny_approval = true;
        self
    }

    /// The signer only publishes a certificate on the `reads`-th GET after approval.
    pub fn sign_after_reads(mut self, reads: u32) -> FakeCluster {
        self.sign_after_reads = reads;
        self
    }

    pub fn seed<K>(&self, value: &K)
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let meta = value.meta();
        let path = item_path::<K>(
            meta.name.as_deref().unwrap_or_default(),
            meta.namespace.as_deref(),
        );
        let body = serde_json::to_value(value).unwrap();
        self.state.lock().unwrap().objects.insert(path, body);
    }

    pub fn object(&self, path: &str) -> Option<Value> {
        self.state.lock().unwrap().objects.get(path).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn created_paths(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == "POST")
            .map(|c| c.path)
            .collect()
    }

    pub fn create_count(&self) -> usize {
        self.created_paths().len()
    }

    fn add_token_secret(&self, state: &mut State, collection: &str, account: &mut Value) {
        let name = object_name(account);
        let secret_name = format!("{}-token-x7k2p", name);
        account["secrets"] = json!([{ "name": secret_name }]);

        let secrets = collection.replace("/serviceaccounts", "/secrets");
        let namespace = account["metadata"]["namespace"].clone();
        state.objects.insert(
            format!("{}/{}", secrets, secret_name),
            json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": { "name": secret_name, "namespace": namespace },
                "type": "kubernetes.io/service-account-token",
                "data": { "token": STANDARD.encode(format!("token-for-{}", name)) },
            }),
        );
    }

    fn approve(&self, state: &mut State, csr_path: &str, body: &Value) -> Result<Value, Error> {
        if !state.objects.contains_key(csr_path) {
            return Err(api_error(404, "NotFound", format!("{} not found", csr_path)));
        }
        if self.deny_approval {
            return Err(api_error(
                403,
                "Forbidden",
                format!(
                    "certificatesigningrequests.certificates.k8s.io \"{}\" is forbidden: user not permitted to approve requests",
                    object_name(body)
                ),
            ));
        }

        let request = body["spec"]["request"].as_str().unwrap_or_default();
        let csr_pem = String::from_utf8(STANDARD.decode(request).unwrap()).unwrap();
        let signed = STANDARD.encode(self.authority.sign(&csr_pem));

        let mut stored = body.clone();
        if self.sign_after_reads == 0 {
            stored["status"]["certificate"] = Value::String(signed);
        } else {
            state
                .pending
                .insert(csr_path.to_string(), (self.sign_after_reads, signed));
        }
        state.objects.insert(csr_path.to_string(), stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create(&self, path: &str, body: &Value) -> Result<Value, Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            method: "POST",
            path: path.to_string(),
        });

        let item = format!("{}/{}", path, object_name(body));
        if state.objects.contains_key(&item) {
            return Err(Error::conflict("object", item));
        }
        if body["spec"]["signerName"] == LEGACY_SIGNER {
            return Err(api_error(
                422,
                "Invalid",
                format!(
                    "CertificateSigningRequest.certificates.k8s.io \"{}\" is invalid: spec.signerName: Invalid value: \"{}\": the legacy signerName is not allowed via this API version",
                    object_name(body),
                    LEGACY_SIGNER
                ),
            ));
        }

        let mut stored = body.clone();
        if self.token_secrets && path.ends_with("/serviceaccounts") {
            self.add_token_secret(&mut state, path, &mut stored);
        }
        state.objects.insert(item, stored.clone());
        Ok(stored)
    }

    async fn replace(&self, path: &str, body: &Value) -> Result<Value, Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            method: "PUT",
            path: path.to_string(),
        });

        if let Some(csr_path) = path.strip_suffix("/approval") {
            return self.approve(&mut state, csr_path, body);
        }
        if !state.objects.contains_key(path) {
            return Err(api_error(404, "NotFound", format!("{} not found", path)));
        }
        state.objects.insert(path.to_string(), body.clone());
        Ok(body.clone())
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            method: "GET",
            path: path.to_string(),
        });

        let ready = match state.pending.get_mut(path) {
            Some((reads, _)) => {
                *reads -= 1;
                *reads == 0
            }
            None => false,
        };
        if ready {
            if let Some((_, signed)) = state.pending.remove(path) {
                if let Some(csr) = state.objects.get_mut(path) {
                    csr["status"]["certificate"] = Value::String(signed);
                }
            }
        }
        Ok(state.objects.get(path).cloned())
    }

    async fn trusted_certificate(&self, name: &str) -> Result<String, Error> {
        if name == CLUSTER_CA {
            return Ok(self.authority.cert_pem().to_string());
        }
        let cert = rcgen::generate_simple_self_signed(vec![format!("{}.example.com", name)])?;
        Ok(cert.serialize_pem()?)
    }
}
