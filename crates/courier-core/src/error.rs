use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures talking to the external secret service.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret service unavailable")]
    Unavailable,

    #[error("secret service call `{operation}` timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("secret collection is owned by a different application")]
    CollectionConflict,

    #[error("secret not found")]
    NotFound,

    #[error("secret service `{operation}` failed: code={code} error_code={error_code} {message}")]
    Remote {
        operation: &'static str,
        code: i32,
        error_code: i32,
        message: String,
    },

    #[error("secret service protocol error: {0}")]
    Protocol(String),

    #[error("secret service transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("secret service serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl SecretError {
    /// Timeouts and an absent daemon both mean "no answer"; callers degrade the same way.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            SecretError::Unavailable | SecretError::Timeout { .. } | SecretError::Transport(_)
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("no encryption key loaded")]
    NoKey,

    #[error("envelope is malformed or truncated")]
    CorruptEnvelope,

    #[error("envelope authentication failed (tampered data or wrong key)")]
    AuthenticationFailed,

    #[error("envelope encryption failed")]
    Encrypt,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("legacy file {path} could not be migrated: {reason}")]
    MigrationFailure { path: PathBuf, reason: String },

    #[error("state file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_no_key(&self) -> bool {
        matches!(self, StoreError::Envelope(EnvelopeError::NoKey))
    }
}
