//! Remote command-execution sessions
//!
//! A [`Session`] is one authenticated channel to one host, scoped to one
//! provisioning run. [`Connector`] opens them; the production implementation
//! lives in [`ssh`].

pub mod runner;
pub mod ssh;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::authn::credentials::Credential;
use crate::models::website::ConnectionDescriptor;

/// Transport-level session failures
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("connection timed out: {0}")]
    Timeout(String),

    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("command timed out after {}s", .0.as_secs())]
    CommandTimeout(Duration),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Which pipe a streamed line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of streamed command output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// An authenticated remote command channel
#[async_trait]
pub trait Session: Send + Sync {
    /// Run one command, forwarding each output line to `lines` as it arrives
    async fn execute_streaming(
        &self,
        command: &str,
        timeout: Duration,
        lines: Option<mpsc::UnboundedSender<OutputLine>>,
    ) -> Result<CommandOutput, SessionError>;

    /// Run one command and collect its output
    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, SessionError> {
        self.execute_streaming(command, timeout, None).await
    }

    /// Close the channel. Idempotent.
    async fn close(&self);

    /// Whether the session can still run commands
    fn is_closed(&self) -> bool;
}

/// Opens sessions; the credential is consumed by `open`
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        credential: Credential,
        timeout: Duration,
    ) -> Result<Box<dyn Session>, SessionError>;
}
