use tracing::info;

use super::csr::{service_csr_name, CsrApprovalProtocol};
use super::provision::{ClusterResourceProvisioner, NAMESPACE};
use crate::cluster::{ClusterApi, CLUSTER_CA};
use crate::config::{
    BootstrapSettings, InputProperties, OU_CERT_C, OU_CERT_L, OU_CERT_O, OU_CERT_OU, OU_CERT_ST,
};
use crate::error::{Error, StepContext};
use crate::pki::{
    create_certificate, Certificate, CertificateRequest, KeyMaterialStore, Subject,
};

pub const TLS_ALIAS: &str = "unison-tls";
pub const SESSION_KEY_ALIAS: &str = "session-unison";
pub const LASTMILE_KEY_ALIAS: &str = "lastmile-oidc";
pub const SAML2_SIGNING_ALIAS: &str = "unison-saml2-rp-sig";
pub const K8S_IDP_SIGNING_ALIAS: &str = "unison-k8sidp-sig";
pub const DIRECTORY_CA_ALIAS: &str = "trusted-adldaps";
pub const INGRESS_CA_ALIAS: &str = "unison-ca";

/// Aliases the front end looks up by name.
pub const REQUIRED_ALIASES: [&str; 8] = [
    TLS_ALIAS,
    SESSION_KEY_ALIAS,
    LASTMILE_KEY_ALIAS,
    SAML2_SIGNING_ALIAS,
    K8S_IDP_SIGNING_ALIAS,
    DIRECTORY_CA_ALIAS,
    CLUSTER_CA,
    INGRESS_CA_ALIAS,
];

fn service_subject() -> Subject {
    Subject::new("kubernetes", "tremolo", "cloud", "cncf", "ea")
}

fn properties_subject(props: &InputProperties) -> Result<Subject, Error> {
    Ok(Subject::new(
        props.require(OU_CERT_OU)?,
        props.require(OU_CERT_O)?,
        props.require(OU_CERT_L)?,
        props.require(OU_CERT_ST)?,
        props.require(OU_CERT_C)?,
    ))
}

fn self_signed(request: &CertificateRequest) -> Result<Certificate, Error> {
    Ok(Certificate::SelfSigned(create_certificate(request)?))
}

/// Certificate for `<service>.<namespace>.svc`, signed by the cluster through a CSR.
async fn cluster_signed(
    protocol: &CsrApprovalProtocol<'_>,
    settings: &BootstrapSettings,
    service: &str,
    namespace: &str,
) -> Result<Certificate, Error> {
    let name = service_csr_name(service, namespace, settings.csr_suffix.as_deref());
    let common_name = service_csr_name(service, namespace, None);
    let record = create_certificate(&CertificateRequest::new(common_name, service_subject()))?;
    protocol.sign(&name, record).await
}

/// Runs the whole install: certificates first, then the key store, then the
/// cluster objects. Stops at the first failure and leaves whatever was
/// already created in place.
pub async fn bootstrap(
    api: &dyn ClusterApi,
    props: &InputProperties,
    settings: &BootstrapSettings,
) -> Result<(), Error> {
    props.validate()?;
    settings.validate()?;
    let host = props.host()?;
    let dashboard_host = props.dashboard_host()?;

    let protocol = CsrApprovalProtocol::new(api, &settings.csr_signer, &settings.csr_poll);
    let mut store =
        KeyMaterialStore::new(props.keystore_password()?).requiring(&REQUIRED_ALIASES);

    info!("Generating openunison tls certificate");
    let tls = cluster_signed(&protocol, settings, "openunison", NAMESPACE)
        .await
        .step("sign openunison tls certificate")?;
    store
        .store_certificate(TLS_ALIAS, &tls)
        .step("store openunison tls certificate")?;
    for alias in [SESSION_KEY_ALIAS, LASTMILE_KEY_ALIAS] {
        store.allocate_secret_key(alias).step("allocate secret key")?;
    }

    info!("Generating OIDC certificates");
    for alias in [SAML2_SIGNING_ALIAS, K8S_IDP_SIGNING_ALIAS] {
        let cert = self_signed(&CertificateRequest::new(alias, service_subject()))
            .step("generate oidc signing certificate")?;
        store
            .store_certificate(alias, &cert)
            .step("store oidc signing certificate")?;
    }

    info!(host, "Generating ingress certificate");
    let ingress = self_signed(
        &CertificateRequest::new(host, properties_subject(props)?)
            .certificate_authority(true)
            .alternative_names(vec![dashboard_host.to_string()]),
    )
    .step("generate ingress certificate")?;
    store
        .import_trusted_certificate(INGRESS_CA_ALIAS, ingress.certificate_pem())
        .step("import ingress certificate")?;

    info!("Generating dashboard tls certificate");
    let dashboard = cluster_signed(&protocol, settings, "kubernetes-dashboard", "kube-system")
        .await
        .step("sign dashboard tls certificate")?;

    info!("Storing k8s and directory certificates");
    for alias in [DIRECTORY_CA_ALIAS, CLUSTER_CA] {
        let pem = api
            .trusted_certificate(alias)
            .await
            .step("read trusted certificate")?;
        store
            .import_trusted_certificate(alias, &pem)
            .step("import trusted certificate")?;
    }

    let provisioner =
        ClusterResourceProvisioner::new(api, settings.on_existing, &settings.token_poll);

    provisioner
        .create_dashboard_secret(&dashboard)
        .await
        .step("create dashboard secret")?;
    let namespace = provisioner
        .create_namespace()
        .await
        .step("create namespace")?;
    let account = provisioner
        .create_service_account(&namespace)
        .await
        .step("create service account")?;
    let token = provisioner
        .read_service_account_token(&account)
        .await
        .step("read service account token")?;
    provisioner
        .bind_cluster_admin(&account)
        .await
        .step("bind cluster-admin")?;
    provisioner
        .grant_namespace_listing()
        .await
        .step("grant namespace listing")?;
    provisioner
        .create_ingress_secret(&namespace, &ingress)
        .await
        .step("create ingress tls secret")?;

    let keystore = store.serialize().step("serialize key store")?;
    provisioner
        .create_application_secret(&namespace, props, &token, &keystore)
        .await
        .step("create openunison secret")?;
    provisioner
        .create_api_server_config(&namespace, host, &ingress)
        .await
        .step("create api server configmap")?;

    info!(
        "Artifacts created, to configure the API server run 'kubectl describe configmap api-server-config -n {}'",
        NAMESPACE
    );
    Ok(())
}
