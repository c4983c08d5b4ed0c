use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommonError {
    #[error("could not find resource: {msg}")]
    NotFound {
        msg: String,
        lookup_id: String,
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("unknown error: {0}")]
    Unknown(#[from] anyhow::Error),
    #[error("invalid request: {msg}")]
    InvalidRequest {
        msg: String,
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("repository error: {msg}")]
    Repository {
        msg: String,
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("sqlite database error")]
    SqliteError {
        #[from]
        #[source]
        source: libsql::Error,
    },
    #[error("libsql migration error")]
    LibsqlMigrationError {
        #[from]
        #[source]
        source: libsql_migration::errors::LibsqlDirMigratorError,
    },
    #[error("io error")]
    IoError {
        #[from]
        #[source]
        source: std::io::Error,
    },
    #[error("url parse error")]
    UrlParseError {
        #[from]
        #[source]
        source: url::ParseError,
    },
    #[error("serde json error")]
    SerdeSerializationError {
        #[from]
        #[source]
        source: serde_json::Error,
    },
    #[error("serde yaml error")]
    SerdeYamlError {
        #[from]
        #[source]
        source: serde_yaml::Error,
    },
    #[error("var error")]
    VarError {
        #[from]
        #[source]
        source: std::env::VarError,
    },
    #[error("tokio task error")]
    TokioTaskError {
        #[from]
        #[source]
        source: tokio::task::JoinError,
    },
}

impl CommonError {
    /// Short machine-friendly name of the error category, used by CLI output
    pub fn name(&self) -> &'static str {
        match self {
            CommonError::NotFound { .. } => "NotFound",
            CommonError::InvalidRequest { .. } => "InvalidRequest",
            CommonError::Repository { .. } => "Repository",
            CommonError::Unknown(_)
            | CommonError::SqliteError { .. }
            | CommonError::LibsqlMigrationError { .. }
            | CommonError::IoError { .. }
            | CommonError::UrlParseError { .. }
            | CommonError::SerdeSerializationError { .. }
            | CommonError::SerdeYamlError { .. }
            | CommonError::VarError { .. }
            | CommonError::TokioTaskError { .. } => "InternalError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_names() {
        let not_found = CommonError::NotFound {
            msg: "missing".to_string(),
            lookup_id: "abc".to_string(),
            source: None,
        };
        assert_eq!(not_found.name(), "NotFound");
        assert!(not_found.to_string().contains("missing"));

        let unknown = CommonError::Unknown(anyhow::anyhow!("boom"));
        assert_eq!(unknown.name(), "InternalError");
    }
}
