//! Failure notifications
//!
//! Delivered best-effort after a phase fails. A notifier error is logged and
//! never changes the outcome of the run.

pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::ProvisionError;

/// What a site owner is told about a failed phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureNotice {
    pub website_id: String,
    pub owner_id: String,
    pub domain: String,
    /// `build` or `ssl`
    pub phase: String,
    /// Sanitized error message, identical to the stored one
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn phase_failed(&self, notice: &FailureNotice) -> Result<(), ProvisionError>;
}

/// Notifier that drops every notice
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn phase_failed(&self, _notice: &FailureNotice) -> Result<(), ProvisionError> {
        Ok(())
    }
}
