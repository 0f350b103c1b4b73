use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("CSR {name} could not be submitted: {reason}")]
    Submission { name: String, reason: String },
    #[error("CSR {name} could not be approved: {reason}")]
    Approval { name: String, reason: String },
    #[error("CSR {name} has no signed certificate yet")]
    Retrieval { name: String },
    #[error("UnableToCreateCertificate: {0}")]
    CertificateGeneration(String),
    #[error("{kind} {name} already exists")]
    ResourceConflict { kind: String, name: String },
    #[error("unable to resolve {0}")]
    DependencyResolution(String),
    #[error("gave up waiting for {operation} after {attempts} attempts: {last}")]
    Timeout {
        operation: String,
        attempts: u32,
        last: Box<Error>,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("keystore error: {0}")]
    KeyStore(String),
    #[error("{step} failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
    #[error("UnableToSerializeObject: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("UnableToBuildRequest: {0}")]
    Request(#[from] http::Error),
}

impl From<rcgen::RcgenError> for Error {
    fn from(e: rcgen::RcgenError) -> Self {
        Error::CertificateGeneration(e.to_string())
    }
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn key_store(msg: impl Into<String>) -> Self {
        Self::KeyStore(msg.into())
    }

    pub fn dependency(msg: impl Into<String>) -> Self {
        Self::DependencyResolution(msg.into())
    }

    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ResourceConflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// True for errors that only mean the cluster has not finished an
    /// asynchronous job yet (CSR signing, token population).
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            Error::Retrieval { .. } | Error::DependencyResolution(_)
        )
    }

    /// Strips step labels and poll timeouts down to the error that caused them.
    #[cfg(test)]
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root(),
            Error::Timeout { last, .. } => last.root(),
            e => e,
        }
    }
}

pub trait StepContext<T> {
    fn step(self, step: &'static str) -> Result<T, Error>;
}

impl<T> StepContext<T> for Result<T, Error> {
    fn step(self, step: &'static str) -> Result<T, Error> {
        self.map_err(|e| Error::Step {
            step,
            source: Box::new(e),
        })
    }
}
