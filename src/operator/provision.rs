use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;
use tracing::{debug, info};

use crate::cluster::{ensure_created, perform_get, ClusterApi};
use crate::config::{encode_env_file, ExistingPolicy, InputProperties};
use crate::error::Error;
use crate::pki::Certificate;
use crate::retry::{poll_until_ready, PollConfig};

pub const NAMESPACE: &str = "openunison";
pub const SERVICE_ACCOUNT: &str = "openunison";
pub const DASHBOARD_NAMESPACE: &str = "kube-system";
pub const DASHBOARD_SECRET: &str = "kubernetes-dashboard-certs";
pub const INGRESS_SECRET: &str = "ou-tls-certificate";
pub const APPLICATION_SECRET: &str = "openunison-secrets";
pub const API_SERVER_CONFIG: &str = "api-server-config";
pub const ADMIN_BINDING: &str = "openunison-cluster-administrators";
pub const ADMIN_GROUP: &str = "k8s-cluster-administrators";
pub const LIST_NAMESPACES_ROLE: &str = "list-namespaces";
pub const LIST_NAMESPACES_BINDING: &str = "openunison-cluster-list-namespaces";
pub const USERS_GROUP: &str = "users";
pub const KEYSTORE_ENTRY: &str = "unisonKeyStore.p12";

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";
const BASE_CONFIG: &str = include_str!("openunison.yaml");

/// Keys of `api-server-config` that hold API-server flags, in the order
/// they are printed.
pub const API_SERVER_FLAG_KEYS: [&str; 5] = [
    "oidc-issuer",
    "oidc-client-id",
    "oidc-username-sub",
    "oidc-groups-claims",
    "oidc-ca-file",
];

/// Decoded token of the front end's service account.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceAccountToken(String);

impl ServiceAccountToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ServiceAccountToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServiceAccountToken(<redacted>)")
    }
}

fn metadata(name: &str, namespace: Option<&str>) -> ObjectMeta {
    let mut labels: BTreeMap<String, String> = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".into(),
        "openunison-bootstrap".into(),
    );
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels),
        ..Default::default()
    }
}

fn name_of(meta: &ObjectMeta) -> Result<&str, Error> {
    meta.name
        .as_deref()
        .ok_or_else(|| Error::dependency("object returned without a name"))
}

fn pem_secret(
    name: &str,
    namespace: &str,
    type_: &str,
    cert_key: &str,
    key_key: &str,
    certificate: &Certificate,
) -> Secret {
    let mut data: BTreeMap<String, ByteString> = BTreeMap::new();
    data.insert(
        cert_key.into(),
        ByteString(certificate.certificate_pem().as_bytes().to_vec()),
    );
    data.insert(
        key_key.into(),
        ByteString(certificate.private_key_pem().as_bytes().to_vec()),
    );
    Secret {
        metadata: metadata(name, Some(namespace)),
        type_: Some(type_.into()),
        data: Some(data),
        ..Default::default()
    }
}

pub fn dashboard_secret(dashboard: &Certificate) -> Secret {
    pem_secret(
        DASHBOARD_SECRET,
        DASHBOARD_NAMESPACE,
        "Opaque",
        "dashboard.crt",
        "dashboard.key",
        dashboard,
    )
}

pub fn ingress_secret(namespace: &str, ingress: &Certificate) -> Secret {
    pem_secret(
        INGRESS_SECRET,
        namespace,
        "kubernetes.io/tls",
        "tls.crt",
        "tls.key",
        ingress,
    )
}

pub fn application_secret(
    namespace: &str,
    env: &BTreeMap<String, String>,
    keystore: &[u8],
) -> Secret {
    let mut data: BTreeMap<String, ByteString> = BTreeMap::new();
    data.insert(
        "openunison.yaml".into(),
        ByteString(BASE_CONFIG.as_bytes().to_vec()),
    );
    data.insert(
        "ou.env".into(),
        ByteString(encode_env_file(env).into_bytes()),
    );
    data.insert(KEYSTORE_ENTRY.into(), ByteString(keystore.to_vec()));
    Secret {
        metadata: metadata(APPLICATION_SECRET, Some(namespace)),
        type_: Some("Opaque".into()),
        data: Some(data),
        ..Default::default()
    }
}

pub fn api_server_config(namespace: &str, host: &str, ingress: &Certificate) -> ConfigMap {
    let mut data: BTreeMap<String, String> = BTreeMap::new();
    data.insert(
        "oidc-issuer".into(),
        format!("--oidc-issuer-url=https://{}/auth/idp/k8sIdp", host),
    );
    data.insert("oidc-client-id".into(), "--oidc-client-id=kubernetes".into());
    data.insert(
        "oidc-username-sub".into(),
        "--oidc-username-claim=sub".into(),
    );
    data.insert(
        "oidc-groups-claims".into(),
        "--oidc-groups-claim=groups".into(),
    );
    data.insert(
        "oidc-ca-file".into(),
        "--oidc-ca-file=/etc/kubernetes/pki/ou-ca.pem".into(),
    );
    data.insert(
        "ou-ca.pem-base64-encoded".into(),
        ingress.certificate_pem().to_string(),
    );
    ConfigMap {
        metadata: metadata(API_SERVER_CONFIG, Some(namespace)),
        data: Some(data),
        ..Default::default()
    }
}

fn cluster_role_binding(name: &str, role: &str, subjects: Vec<Subject>) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: metadata(name, None),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.into(),
            kind: "ClusterRole".into(),
            name: role.into(),
        },
        subjects: Some(subjects),
    }
}

fn group(name: &str) -> Subject {
    Subject {
        kind: "Group".into(),
        name: name.into(),
        api_group: Some(RBAC_GROUP.into()),
        ..Default::default()
    }
}

/// Creates the cluster objects the front end needs. Every step takes the
/// objects it depends on as arguments.
pub struct ClusterResourceProvisioner<'a> {
    api: &'a dyn ClusterApi,
    policy: ExistingPolicy,
    token_poll: &'a PollConfig,
}

impl<'a> ClusterResourceProvisioner<'a> {
    pub fn new(
        api: &'a dyn ClusterApi,
        policy: ExistingPolicy,
        token_poll: &'a PollConfig,
    ) -> ClusterResourceProvisioner<'a> {
        ClusterResourceProvisioner {
            api,
            policy,
            token_poll,
        }
    }

    pub async fn create_dashboard_secret(&self, dashboard: &Certificate) -> Result<Secret, Error> {
        info!("Creating dashboard secret");
        ensure_created(self.api, self.policy, &dashboard_secret(dashboard)).await
    }

    pub async fn create_namespace(&self) -> Result<Namespace, Error> {
        info!(namespace = NAMESPACE, "Creating namespace");
        let namespace = Namespace {
            metadata: metadata(NAMESPACE, None),
            ..Default::default()
        };
        ensure_created(self.api, self.policy, &namespace).await
    }

    pub async fn create_service_account(
        &self,
        namespace: &Namespace,
    ) -> Result<ServiceAccount, Error> {
        let ns = name_of(&namespace.metadata)?;
        info!(namespace = ns, name = SERVICE_ACCOUNT, "Creating service account");
        let account = ServiceAccount {
            metadata: metadata(SERVICE_ACCOUNT, Some(ns)),
            ..Default::default()
        };
        ensure_created(self.api, self.policy, &account).await
    }

    /// Service account, then its token secret, then the decoded token.
    pub async fn read_service_account_token(
        &self,
        account: &ServiceAccount,
    ) -> Result<ServiceAccountToken, Error> {
        let name = name_of(&account.metadata)?;
        let namespace = account
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::dependency("service account has no namespace"))?;
        let operation = format!("token of service account {}/{}", namespace, name);
        poll_until_ready(self.token_poll, &operation, || {
            self.read_token_once(name, namespace)
        })
        .await
    }

    async fn read_token_once(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<ServiceAccountToken, Error> {
        let account: ServiceAccount = perform_get(self.api, name, Some(namespace))
            .await?
            .ok_or_else(|| {
                Error::dependency(format!("service account {}/{}", namespace, name))
            })?;

        let secret_name = account
            .secrets
            .iter()
            .flatten()
            .find_map(|s| s.name.clone())
            .ok_or_else(|| {
                Error::dependency(format!(
                    "token secret name of service account {}/{}",
                    namespace, name
                ))
            })?;
        debug!(secret = %secret_name, "Found service account token secret");

        let secret: Secret = perform_get(self.api, &secret_name, Some(namespace))
            .await?
            .ok_or_else(|| Error::dependency(format!("secret {}/{}", namespace, secret_name)))?;

        let token = secret
            .data
            .and_then(|mut d| d.remove("token"))
            .filter(|t| !t.0.is_empty())
            .ok_or_else(|| {
                Error::dependency(format!("token in secret {}/{}", namespace, secret_name))
            })?;

        String::from_utf8(token.0)
            .map(ServiceAccountToken)
            .map_err(|_| Error::dependency(format!("utf-8 token in secret {}", secret_name)))
    }

    pub async fn bind_cluster_admin(
        &self,
        account: &ServiceAccount,
    ) -> Result<ClusterRoleBinding, Error> {
        info!("Creating RBAC bindings");
        let binding = cluster_role_binding(
            ADMIN_BINDING,
            "cluster-admin",
            vec![
                group(ADMIN_GROUP),
                Subject {
                    kind: "ServiceAccount".into(),
                    name: name_of(&account.metadata)?.to_string(),
                    namespace: account.metadata.namespace.clone(),
                    ..Default::default()
                },
            ],
        );
        ensure_created(self.api, self.policy, &binding).await
    }

    pub async fn grant_namespace_listing(
        &self,
    ) -> Result<(ClusterRole, ClusterRoleBinding), Error> {
        let role = ClusterRole {
            metadata: metadata(LIST_NAMESPACES_ROLE, None),
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec!["".into()]),
                resources: Some(vec!["namespaces".into()]),
                verbs: vec!["list".into()],
                ..Default::default()
            }]),
            ..Default::default()
        };
        let role = ensure_created(self.api, self.policy, &role).await?;

        let binding = cluster_role_binding(
            LIST_NAMESPACES_BINDING,
            name_of(&role.metadata)?,
            vec![group(USERS_GROUP)],
        );
        let binding = ensure_created(self.api, self.policy, &binding).await?;
        Ok((role, binding))
    }

    pub async fn create_ingress_secret(
        &self,
        namespace: &Namespace,
        ingress: &Certificate,
    ) -> Result<Secret, Error> {
        info!("Creating ingress TLS secret");
        let secret = ingress_secret(name_of(&namespace.metadata)?, ingress);
        ensure_created(self.api, self.policy, &secret).await
    }

    pub async fn create_application_secret(
        &self,
        namespace: &Namespace,
        properties: &InputProperties,
        token: &ServiceAccountToken,
        keystore: &[u8],
    ) -> Result<Secret, Error> {
        info!("Creating OpenUnison secret");
        let env = properties.with_token(token.as_str());
        let secret = application_secret(name_of(&namespace.metadata)?, &env, keystore);
        ensure_created(self.api, self.policy, &secret).await
    }

    pub async fn create_api_server_config(
        &self,
        namespace: &Namespace,
        host: &str,
        ingress: &Certificate,
    ) -> Result<ConfigMap, Error> {
        info!("Creating post deployment configmap");
        let config = api_server_config(name_of(&namespace.metadata)?, host, ingress);
        ensure_created(self.api, self.policy, &config).await
    }
}

/// Reads `api-server-config` back and returns the API-server flags it holds.
pub async fn read_api_server_flags(
    api: &dyn ClusterApi,
    namespace: &str,
) -> Result<Vec<String>, Error> {
    let config: ConfigMap = perform_get(api, API_SERVER_CONFIG, Some(namespace))
        .await?
        .ok_or_else(|| {
            Error::dependency(format!("configmap {}/{}", namespace, API_SERVER_CONFIG))
        })?;
    let data = config.data.unwrap_or_default();
    API_SERVER_FLAG_KEYS
        .iter()
        .map(|k| {
            data.get(*k)
                .cloned()
                .ok_or_else(|| Error::dependency(format!("{} in {}", k, API_SERVER_CONFIG)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{create_certificate, CertificateRequest, Subject as CertSubject};
    use crate::testing::FakeCluster;

    fn certificate() -> Certificate {
        let req = CertificateRequest::new(
            "ou.example.com",
            CertSubject::new("k8s", "org", "city", "state", "us"),
        )
        .certificate_authority(true);
        Certificate::SelfSigned(create_certificate(&req).unwrap())
    }

    fn namespace() -> Namespace {
        Namespace {
            metadata: metadata(NAMESPACE, None),
            ..Default::default()
        }
    }

    #[test]
    fn tls_secret_layout() {
        let cert = certificate();
        let secret = ingress_secret(NAMESPACE, &cert);
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
        let data = secret.data.unwrap();
        assert_eq!(data["tls.crt"].0, cert.certificate_pem().as_bytes());
        assert_eq!(data["tls.key"].0, cert.private_key_pem().as_bytes());

        let secret = dashboard_secret(&cert);
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("kube-system"));
        assert!(secret.data.unwrap().contains_key("dashboard.key"));
    }

    #[test]
    fn application_secret_bundles_config_env_and_keystore() {
        let mut env = BTreeMap::new();
        env.insert("OU_HOST".to_string(), "ou.example.com".to_string());
        let secret = application_secret(NAMESPACE, &env, b"blob");
        let data = secret.data.unwrap();

        let base = String::from_utf8(data["openunison.yaml"].0.clone()).unwrap();
        assert!(base.contains("secure_key_alias: \"unison-tls\""));
        assert_eq!(data["ou.env"].0, b"OU_HOST=ou.example.com\n");
        assert_eq!(data[KEYSTORE_ENTRY].0, b"blob");
    }

    #[test]
    fn api_server_config_carries_issuer_and_ca() {
        let cert = certificate();
        let config = api_server_config(NAMESPACE, "ou.example.com", &cert);
        let data = config.data.unwrap();
        assert_eq!(
            data["oidc-issuer"],
            "--oidc-issuer-url=https://ou.example.com/auth/idp/k8sIdp"
        );
        assert_eq!(data["ou-ca.pem-base64-encoded"], cert.certificate_pem());
    }

    #[tokio::test]
    async fn token_is_read_through_its_secret() {
        let cluster = FakeCluster::new();
        let poll = PollConfig::single_attempt();
        let provisioner = ClusterResourceProvisioner::new(&cluster, ExistingPolicy::Fail, &poll);

        let ns = provisioner.create_namespace().await.unwrap();
        let account = provisioner.create_service_account(&ns).await.unwrap();
        let token = provisioner.read_service_account_token(&account).await.unwrap();

        assert_eq!(token.as_str(), "token-for-openunison");
        assert!(!format!("{:?}", token).contains("token-for"));
    }

    #[tokio::test]
    async fn missing_token_secret_is_a_dependency_error() {
        let cluster = FakeCluster::new().without_token_secrets();
        let poll = PollConfig::single_attempt();
        let provisioner = ClusterResourceProvisioner::new(&cluster, ExistingPolicy::Fail, &poll);

        let ns = provisioner.create_namespace().await.unwrap();
        let account = provisioner.create_service_account(&ns).await.unwrap();
        let err = provisioner
            .read_service_account_token(&account)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DependencyResolution(_)));
    }

    #[tokio::test]
    async fn rbac_objects_reference_their_roles() {
        let cluster = FakeCluster::new();
        let poll = PollConfig::single_attempt();
        let provisioner = ClusterResourceProvisioner::new(&cluster, ExistingPolicy::Fail, &poll);

        let ns = provisioner.create_namespace().await.unwrap();
        let account = provisioner.create_service_account(&ns).await.unwrap();
        let admin = provisioner.bind_cluster_admin(&account).await.unwrap();
        let (role, listing) = provisioner.grant_namespace_listing().await.unwrap();

        assert_eq!(admin.role_ref.name, "cluster-admin");
        let subjects = admin.subjects.unwrap();
        assert_eq!(subjects[0].name, ADMIN_GROUP);
        assert_eq!(subjects[1].kind, "ServiceAccount");
        assert_eq!(subjects[1].namespace.as_deref(), Some(NAMESPACE));

        assert_eq!(role.rules.unwrap()[0].verbs, vec!["list"]);
        assert_eq!(listing.role_ref.name, LIST_NAMESPACES_ROLE);
        assert_eq!(listing.subjects.unwrap()[0].name, USERS_GROUP);
    }

    #[tokio::test]
    async fn api_server_flags_are_read_back() {
        let cluster = FakeCluster::new();
        let poll = PollConfig::single_attempt();
        let provisioner = ClusterResourceProvisioner::new(&cluster, ExistingPolicy::Fail, &poll);
        provisioner
            .create_api_server_config(&namespace(), "ou.example.com", &certificate())
            .await
            .unwrap();

        let flags = read_api_server_flags(&cluster, NAMESPACE).await.unwrap();
        assert_eq!(flags.len(), 5);
        assert_eq!(
            flags[0],
            "--oidc-issuer-url=https://ou.example.com/auth/idp/k8sIdp"
        );
        assert_eq!(flags[4], "--oidc-ca-file=/etc/kubernetes/pki/ou-ca.pem");
    }

    #[tokio::test]
    async fn missing_api_server_config_is_reported() {
        let cluster = FakeCluster::new();
        let err = read_api_server_flags(&cluster, NAMESPACE).await.unwrap_err();
        assert!(matches!(err, Error::DependencyResolution(_)));
    }
}
