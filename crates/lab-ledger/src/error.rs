use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no runs found for identifier '{identifier}'")]
    IdentifierNotFound { identifier: String },
    #[error("no run found for identifier '{identifier}' and uid '{uid}'")]
    RunNotFound { identifier: String, uid: String },
    #[error("identifier must be a non-empty string")]
    EmptyIdentifier,
    #[error("uid capacity exhausted for identifier '{identifier}': all {maxsize} uids are in use")]
    CapacityExceeded { identifier: String, maxsize: usize },
    #[error("ledger schema validation failed ({}): {message}", path.display())]
    Validation { path: PathBuf, message: String },
    #[error("timed out after {waited:?} waiting for ledger lock ({})", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("io error ({}): {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("attached payload is not valid JSON ({}): {source}", path.display())]
    Payload {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid ledger config: {message}")]
    Config { message: String },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl LedgerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LedgerError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn validation(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        LedgerError::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// True for both the identifier-level and the run-level lookup misses.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LedgerError::IdentifierNotFound { .. } | LedgerError::RunNotFound { .. }
        )
    }

    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, LedgerError::CapacityExceeded { .. })
    }
}
