//! Error types for the provisioning orchestrator

use std::time::Duration;

use thiserror::Error;

use crate::session::SessionError;

/// Main error type for pressbuild
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Host refused, unreachable, or did not answer in time
    #[error("Connection error: {0}")]
    Connection(String),

    /// The resolved credential was rejected by the host
    #[error("Authentication error: {0}")]
    Auth(String),

    /// A remote command exited non-zero, timed out, or lost its session
    #[error("Command error: {0}")]
    Command(String),

    /// Detection failures are advisory and never fail a run
    #[error("Detection error: {0}")]
    Detection(String),

    #[error("Phase '{phase}' exceeded its {}s ceiling", .ceiling.as_secs())]
    PhaseTimeout { phase: String, ceiling: Duration },

    #[error("Provisioning already in progress for website {0}")]
    AlreadyRunning(String),

    #[error("Website {0} is not owned by the caller")]
    Ownership(String),

    #[error("Invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid website: {0}")]
    InvalidWebsite(String),

    #[error("Provisioning cancelled: {0}")]
    Cancelled(String),

    #[error("Website {0} already exists")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Compare-and-set lost against a concurrent writer
    #[error("Version conflict for website {website_id}: expected {expected}, found {found}")]
    Conflict {
        website_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Credential error: {0}")]
    CredentialError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProvisionError {
    /// Whether a step that failed with this error may be attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProvisionError::Connection(_) | ProvisionError::Command(_) | ProvisionError::IoError(_)
        )
    }
}

impl From<SessionError> for ProvisionError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::ConnectionRefused(_)
            | SessionError::HostUnreachable(_)
            | SessionError::Timeout(_) => ProvisionError::Connection(err.to_string()),
            SessionError::AuthFailure(_) => ProvisionError::Auth(err.to_string()),
            SessionError::CommandTimeout(_) | SessionError::SessionClosed(_) => {
                ProvisionError::Command(err.to_string())
            }
            SessionError::Io(e) => ProvisionError::IoError(e),
        }
    }
}

impl From<anyhow::Error> for ProvisionError {
    fn from(err: anyhow::Error) -> Self {
        ProvisionError::Internal(err.to_string())
    }
}
