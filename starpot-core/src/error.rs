use thiserror::Error;

pub type Result<T> = std::result::Result<T, StarpotError>;

#[derive(Error, Debug)]
pub enum StarpotError {
    #[error("Document already exists: {path}")]
    AlreadyExists { path: String },

    #[error("Document not found: {path}")]
    NotFound { path: String },

    #[error("Precondition failed on {path}: {reason}")]
    PreconditionFailed { path: String, reason: String },

    #[error("Invalid field '{field}' on {path}: {reason}")]
    InvalidField {
        path: String,
        field: String,
        reason: String,
    },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Identity unavailable: {0}")]
    Identity(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StarpotError {
    pub fn precondition(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_field(
        path: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidField {
            path: path.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn identity(msg: impl Into<String>) -> Self {
        Self::Identity(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Failures a caller may retry with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Storage(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
