use shared::error::CommonError;
use thiserror::Error;
use uuid::Uuid;

/// Failures raised by key proxies, providers and the services built on them.
///
/// Providers classify their own failures into these variants so the canary matching
/// and retry logic only ever asks [`EncryptionError::indicates_wrong_key`] and
/// [`EncryptionError::is_retryable`].
#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("authentication failure: {msg}")]
    AuthFailure {
        msg: String,
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("transient provider failure: {msg}")]
    Transient {
        msg: String,
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("incorrect key: {msg}")]
    IncorrectKey {
        msg: String,
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("encryption key {key_uuid} is not present in the key set")]
    KeyNotFound { key_uuid: Uuid },
    #[error("no active encryption key is configured")]
    NoActiveKey,
    #[error("invalid encryption configuration: {msg}")]
    InvalidConfiguration { msg: String },
    #[error("timed out after {waited:?} waiting for {what}")]
    BootstrapTimeout {
        what: String,
        waited: std::time::Duration,
    },
    #[error(transparent)]
    Repository(#[from] CommonError),
    #[error("encryption failure: {msg}")]
    Fatal {
        msg: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

impl EncryptionError {
    pub fn auth_failure(msg: impl Into<String>) -> Self {
        EncryptionError::AuthFailure {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn transient(msg: impl Into<String>, source: Option<anyhow::Error>) -> Self {
        EncryptionError::Transient {
            msg: msg.into(),
            source,
        }
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        EncryptionError::Fatal {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        EncryptionError::InvalidConfiguration { msg: msg.into() }
    }

    /// Errors that warrant a provider reconnect followed by a single retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EncryptionError::AuthFailure { .. } | EncryptionError::Transient { .. }
        )
    }

    /// Errors that mean "a different key was tried" rather than "something broke".
    /// Canary matching treats these as no match.
    pub fn indicates_wrong_key(&self) -> bool {
        matches!(self, EncryptionError::AuthFailure { .. })
    }

    /// Short machine-friendly name of the error, used by CLI output
    pub fn name(&self) -> &'static str {
        match self {
            EncryptionError::AuthFailure { .. } => "AuthFailure",
            EncryptionError::Transient { .. } => "Transient",
            EncryptionError::IncorrectKey { .. } => "IncorrectKey",
            EncryptionError::KeyNotFound { .. } => "KeyNotFound",
            EncryptionError::NoActiveKey => "NoActiveKey",
            EncryptionError::InvalidConfiguration { .. } => "InvalidConfiguration",
            EncryptionError::BootstrapTimeout { .. } => "BootstrapTimeout",
            EncryptionError::Repository(e) => e.name(),
            EncryptionError::Fatal { .. } => "Fatal",
        }
    }
}

impl From<EncryptionError> for CommonError {
    fn from(value: EncryptionError) -> Self {
        match value {
            EncryptionError::Repository(e) => e,
            EncryptionError::KeyNotFound { key_uuid } => CommonError::NotFound {
                msg: format!("encryption key {key_uuid} is not present in the key set"),
                lookup_id: key_uuid.to_string(),
                source: None,
            },
            e @ (EncryptionError::NoActiveKey
            | EncryptionError::InvalidConfiguration { .. }) => CommonError::InvalidRequest {
                msg: e.to_string(),
                source: Some(e.into()),
            },
            e => CommonError::Unknown(e.into()),
        }
    }
}
