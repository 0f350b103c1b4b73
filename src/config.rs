use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use clap::ValueEnum;
use tracing::debug;

use crate::error::Error;
use crate::retry::PollConfig;

pub const KEYSTORE_PASSWORD: &str = "unisonKeystorePassword";
pub const OU_HOST: &str = "OU_HOST";
pub const OU_CERT_OU: &str = "OU_CERT_OU";
pub const OU_CERT_O: &str = "OU_CERT_O";
pub const OU_CERT_L: &str = "OU_CERT_L";
pub const OU_CERT_ST: &str = "OU_CERT_ST";
pub const OU_CERT_C: &str = "OU_CERT_C";
pub const K8S_DASHBOARD_HOST: &str = "K8S_DASHBOARD_HOST";
/// Added by the bootstrap once the service-account token is known.
pub const K8S_TOKEN: &str = "K8S_TOKEN";

pub const LEGACY_SIGNER: &str = "kubernetes.io/legacy-unknown";

pub const REQUIRED_PROPERTIES: [&str; 8] = [
    KEYSTORE_PASSWORD,
    OU_HOST,
    OU_CERT_OU,
    OU_CERT_O,
    OU_CERT_L,
    OU_CERT_ST,
    OU_CERT_C,
    K8S_DASHBOARD_HOST,
];

/// Flat input map supplied by the installer.
#[derive(Clone, Default, PartialEq)]
pub struct InputProperties {
    values: BTreeMap<String, String>,
}

impl fmt::Debug for InputProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // values carry the keystore password
        f.debug_struct("InputProperties")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for InputProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        InputProperties {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl InputProperties {
    pub fn from_file(path: &Path) -> Result<InputProperties, Error> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("unable to read {}: {}", path.display(), e))
        })?;
        let props = InputProperties::parse(&text);
        debug!(path = %path.display(), count = props.values.len(), "Loaded input properties");
        Ok(props)
    }

    /// Parses `key=value` / `key: value` lines. `#` and `!` start comments.
    pub fn parse(text: &str) -> InputProperties {
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('!'))
            .filter_map(|line| {
                let split = line.find(|c| c == '=' || c == ':')?;
                let (key, value) = line.split_at(split);
                Some((key.trim().to_string(), value[1..].trim().to_string()))
            })
            .collect()
    }

    /// Applies `KEY=VALUE` overrides on top of what was loaded.
    pub fn apply_overrides(&mut self, overrides: &[String]) -> Result<(), Error> {
        for o in overrides {
            match o.split_once('=') {
                Some((k, v)) if !k.trim().is_empty() => {
                    self.set(k.trim(), v);
                }
                _ => {
                    return Err(Error::configuration(format!(
                        "override {:?} is not KEY=VALUE",
                        o
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str, Error> {
        match self.get(key) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(Error::configuration(format!(
                "required property {} is not set",
                key
            ))),
        }
    }

    /// Checks every required property before anything touches the cluster.
    pub fn validate(&self) -> Result<(), Error> {
        let missing: Vec<&str> = REQUIRED_PROPERTIES
            .iter()
            .copied()
            .filter(|k| self.require(k).is_err())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::configuration(format!(
                "required properties not set: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn keystore_password(&self) -> Result<&str, Error> {
        self.require(KEYSTORE_PASSWORD)
    }

    pub fn host(&self) -> Result<&str, Error> {
        self.require(OU_HOST)
    }

    pub fn dashboard_host(&self) -> Result<&str, Error> {
        self.require(K8S_DASHBOARD_HOST)
    }

    /// The map embedded as `ou.env`: every input plus the resolved token.
    pub fn with_token(&self, token: &str) -> BTreeMap<String, String> {
        let mut env = self.values.clone();
        env.insert(K8S_TOKEN.to_string(), token.to_string());
        env
    }
}

/// Renders a map in the line-oriented environment-file format read by the
/// front end: `KEY=VALUE`, one per line, sorted by key.
pub fn encode_env_file(map: &BTreeMap<String, String>) -> String {
    map.iter().fold(String::new(), |mut out, (k, v)| {
        out.push_str(k);
        out.push('=');
        out.push_str(v);
        out.push('\n');
        out
    })
}

/// What to do when an object the bootstrap is about to create already exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ExistingPolicy {
    /// Abort with a conflict.
    #[default]
    Fail,
    /// Reuse the existing object and skip the create.
    Adopt,
}

#[derive(Clone, Debug)]
pub struct BootstrapSettings {
    pub on_existing: ExistingPolicy,
    pub csr_signer: String,
    /// Appended to CSR names so each run submits fresh requests.
    pub csr_suffix: Option<String>,
    pub csr_poll: PollConfig,
    pub token_poll: PollConfig,
}

impl BootstrapSettings {
    pub fn new(csr_signer: impl Into<String>) -> BootstrapSettings {
        BootstrapSettings {
            on_existing: ExistingPolicy::Fail,
            csr_signer: csr_signer.into(),
            csr_suffix: None,
            csr_poll: PollConfig::default(),
            token_poll: PollConfig::default(),
        }
    }

    /// The v1 certificates API refuses new requests for the legacy signer.
    pub fn validate(&self) -> Result<(), Error> {
        let signer = self.csr_signer.trim();
        if signer.is_empty() {
            return Err(Error::configuration("a CSR signer name is required"));
        }
        if signer == LEGACY_SIGNER {
            return Err(Error::configuration(format!(
                "signer {} cannot be used with certificates.k8s.io/v1, pass --csr-signer with a signer that issues serving certificates",
                LEGACY_SIGNER
            )));
        }
        Ok(())
    }
}
