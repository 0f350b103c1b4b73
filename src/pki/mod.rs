//! Certificate generation on top of `rcgen`.
//!
//! Every certificate starts life as a self-signed [`KeyPairRecord`]. Those that
//! must be trusted by the cluster are then sent through the CSR protocol and
//! come back as [`Certificate::Signed`] with the same private key.

use std::fmt;

use chrono::{Datelike, Utc};
use rcgen::{
    BasicConstraints, Certificate as RcgenCertificate, CertificateParams, DistinguishedName,
    DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
    PKCS_RSA_SHA256,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use tracing::debug;
use x509_parser::parse_x509_certificate;

use crate::error::Error;

pub mod keystore;

pub use keystore::KeyMaterialStore;

const LEAF_VALIDITY_YEARS: i32 = 2;
const CA_VALIDITY_YEARS: i32 = 10;
const RSA_KEY_BITS: usize = 2048;

/// Organizational fields of a certificate subject.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    pub organizational_unit: String,
    pub organization: String,
    pub locality: String,
    pub state: String,
    pub country: String,
}

impl Subject {
    pub fn new(
        organizational_unit: impl Into<String>,
        organization: impl Into<String>,
        locality: impl Into<String>,
        state: impl Into<String>,
        country: impl Into<String>,
    ) -> Subject {
        Subject {
            organizational_unit: organizational_unit.into(),
            organization: organization.into(),
            locality: locality.into(),
            state: state.into(),
            country: country.into(),
        }
    }
}

/// Everything needed to generate one key pair and its certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateRequest {
    common_name: String,
    subject: Subject,
    is_ca: bool,
    subject_alternative_names: Vec<String>,
}

impl CertificateRequest {
    pub fn new(common_name: impl Into<String>, subject: Subject) -> CertificateRequest {
        CertificateRequest {
            common_name: common_name.into(),
            subject,
            is_ca: false,
            subject_alternative_names: Vec::new(),
        }
    }

    pub fn certificate_authority(mut self, is_ca: bool) -> CertificateRequest {
        self.is_ca = is_ca;
        self
    }

    pub fn alternative_names(mut self, names: Vec<String>) -> CertificateRequest {
        self.subject_alternative_names = names;
        self
    }

    fn distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, utf8(&self.common_name));
        dn.push(
            DnType::OrganizationalUnitName,
            utf8(&self.subject.organizational_unit),
        );
        dn.push(DnType::OrganizationName, utf8(&self.subject.organization));
        dn.push(DnType::LocalityName, utf8(&self.subject.locality));
        dn.push(DnType::StateOrProvinceName, utf8(&self.subject.state));
        dn.push(DnType::CountryName, utf8(&self.subject.country));
        dn
    }

    fn subject_alt_names(&self) -> Vec<SanType> {
        std::iter::once(&self.common_name)
            .chain(self.subject_alternative_names.iter())
            .map(|n| SanType::DnsName(n.clone()))
            .collect()
    }

    fn params(&self, key_pair: KeyPair) -> CertificateParams {
        let mut params = CertificateParams::default();
        params.alg = &PKCS_RSA_SHA256;
        params.distinguished_name = self.distinguished_name();
        params.subject_alt_names = self.subject_alt_names();
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let years = if self.is_ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
            ];
            CA_VALIDITY_YEARS
        } else {
            params.is_ca = IsCa::NoCa;
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ];
            LEAF_VALIDITY_YEARS
        };

        let today = Utc::now().date_naive();
        // clamp the day so a Feb 29 start never produces an invalid end date
        let day = today.day().min(28) as u8;
        params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, day);
        params.not_after = rcgen::date_time_ymd(today.year() + years, today.month() as u8, day);
        params.key_pair = Some(key_pair);
        params
    }

    /// A PKCS#10 request may only carry the subject and its names. Usages and
    /// validity are chosen by the signer.
    fn request_params(&self, key_pair: KeyPair) -> CertificateParams {
        let mut params = CertificateParams::default();
        params.alg = &PKCS_RSA_SHA256;
        params.distinguished_name = self.distinguished_name();
        params.subject_alt_names = self.subject_alt_names();
        params.key_pair = Some(key_pair);
        params
    }
}

fn utf8(s: &str) -> DnValue {
    DnValue::Utf8String(s.to_string())
}

/// A private key with the certificate currently issued for it.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPairRecord {
    request: CertificateRequest,
    private_key_pem: String,
    certificate_pem: String,
}

impl fmt::Debug for KeyPairRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPairRecord")
            .field("common_name", &self.request.common_name)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

impl KeyPairRecord {
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }
}

/// A certificate either still carrying its self-signed placeholder or
/// replaced by one the cluster authority issued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Certificate {
    SelfSigned(KeyPairRecord),
    Signed {
        key_pair: KeyPairRecord,
        /// Leaf first, as returned by the authority.
        chain: Vec<String>,
    },
}

impl Certificate {
    pub fn key_pair(&self) -> &KeyPairRecord {
        match self {
            Certificate::SelfSigned(k) => k,
            Certificate::Signed { key_pair, .. } => key_pair,
        }
    }

    pub fn certificate_pem(&self) -> &str {
        self.key_pair().certificate_pem()
    }

    pub fn private_key_pem(&self) -> &str {
        self.key_pair().private_key_pem()
    }

    pub fn chain(&self) -> Vec<String> {
        match self {
            Certificate::SelfSigned(k) => vec![k.certificate_pem.clone()],
            Certificate::Signed { chain, .. } => chain.clone(),
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Certificate::Signed { .. })
    }
}

fn generate_key_pair() -> Result<KeyPair, Error> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
        .map_err(|e| Error::CertificateGeneration(format!("unable to generate RSA key: {}", e)))?;
    let der = key
        .to_pkcs8_der()
        .map_err(|e| Error::CertificateGeneration(format!("unable to encode RSA key: {}", e)))?;
    Ok(KeyPair::from_der_and_sign_algo(der.as_bytes(), &PKCS_RSA_SHA256)?)
}

fn load_key_pair(private_key_pem: &str) -> Result<KeyPair, Error> {
    Ok(KeyPair::from_pem_and_sign_algo(private_key_pem, &PKCS_RSA_SHA256)?)
}

fn encode_pem(p: &pem::Pem) -> String {
    pem::encode_config(p, pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF))
}

/// PEM text of a DER certificate, with `\n` line endings.
pub fn certificate_pem(der: Vec<u8>) -> String {
    encode_pem(&pem::Pem::new("CERTIFICATE", der))
}

/// Generates a fresh RSA key pair and a self-signed certificate for `request`.
pub fn create_certificate(request: &CertificateRequest) -> Result<KeyPairRecord, Error> {
    let cert = RcgenCertificate::from_params(request.params(generate_key_pair()?))?;
    let record = KeyPairRecord {
        request: request.clone(),
        private_key_pem: cert.serialize_private_key_pem(),
        certificate_pem: cert.serialize_pem()?,
    };
    debug!(cn = %request.common_name, ca = request.is_ca, "Generated certificate");
    Ok(record)
}

/// PEM-encoded PKCS#10 request for the record's key and subject.
pub fn generate_csr_pem(record: &KeyPairRecord) -> Result<String, Error> {
    let key_pair = load_key_pair(&record.private_key_pem)?;
    let cert = RcgenCertificate::from_params(record.request.request_params(key_pair))?;
    Ok(cert.serialize_request_pem()?)
}

/// Replaces the self-signed placeholder with the authority-issued chain.
///
/// The leaf must carry the record's public key; the private key is kept.
pub fn import_signed_certificate(
    mut record: KeyPairRecord,
    signed_pem: &[u8],
) -> Result<Certificate, Error> {
    let chain: Vec<pem::Pem> = pem::parse_many(signed_pem)
        .map_err(|e| Error::CertificateGeneration(format!("invalid signed certificate: {}", e)))?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .collect();

    let leaf = chain.first().ok_or_else(|| {
        Error::CertificateGeneration("signed response holds no certificate".into())
    })?;

    let (_, parsed) = parse_x509_certificate(leaf.contents()).map_err(|e| {
        Error::CertificateGeneration(format!("unable to parse signed certificate: {}", e))
    })?;
    let key_pair = load_key_pair(&record.private_key_pem)?;
    if &*parsed.public_key().subject_public_key.data != key_pair.public_key_raw() {
        return Err(Error::CertificateGeneration(format!(
            "signed certificate for {} does not match its private key",
            record.request.common_name
        )));
    }

    let chain: Vec<String> = chain.iter().map(encode_pem).collect();
    record.certificate_pem = chain[0].clone();
    Ok(Certificate::Signed {
        key_pair: record,
        chain,
    })
}

/// DER bytes of the first certificate in a PEM string.
pub fn certificate_der(certificate_pem: &str) -> Result<Vec<u8>, Error> {
    let p = pem::parse(certificate_pem)
        .map_err(|e| Error::CertificateGeneration(format!("invalid PEM certificate: {}", e)))?;
    if p.tag() != "CERTIFICATE" {
        return Err(Error::CertificateGeneration(format!(
            "expected CERTIFICATE, found {}",
            p.tag()
        )));
    }
    Ok(p.into_contents())
}
