//! Finite State Machine for website provisioning status

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::CooldownOptions;

/// FSM settings shared by both phases
#[derive(Debug, Clone)]
pub struct FsmSettings {
    /// Timeout for a single step when the step does not set its own
    pub step_timeout: Duration,

    /// Extra attempts after the first failure of a step
    pub retry_count: u32,

    /// Backoff between attempts of a step
    pub retry_backoff: CooldownOptions,

    /// Ceiling for one phase, retries and backoff included
    pub phase_timeout: Duration,
}

impl Default for FsmSettings {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(600),
            retry_count: 2,
            retry_backoff: CooldownOptions {
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
            },
            phase_timeout: Duration::from_secs(45 * 60),
        }
    }
}

/// Website lifecycle status
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebsiteStatus {
    /// Registered, never provisioned
    #[default]
    Pending,

    /// Build phase running
    Building,

    /// Certificate phase running
    SslProvisioning,

    /// Both phases completed
    Active,

    /// A phase failed; see the error message
    Failed,
}

impl WebsiteStatus {
    /// A run is executing for the website
    pub fn is_running(&self) -> bool {
        matches!(self, WebsiteStatus::Building | WebsiteStatus::SslProvisioning)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WebsiteStatus::Pending => "pending",
            WebsiteStatus::Building => "building",
            WebsiteStatus::SslProvisioning => "ssl_provisioning",
            WebsiteStatus::Active => "active",
            WebsiteStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WebsiteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provisioning event
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// Start (or restart) the build phase
    StartBuild,

    /// Resume directly at the certificate phase, build already completed
    StartSsl,

    /// Build phase completed successfully
    BuildCompleted,

    /// Certificate phase completed successfully
    SslCompleted,

    /// The running phase failed
    Fail(String),
}

/// Status FSM
#[derive(Debug, Clone)]
pub struct StatusFsm {
    state: WebsiteStatus,
    error: Option<String>,
}

impl StatusFsm {
    /// Create an FSM from a persisted status
    pub fn new(state: WebsiteStatus) -> Self {
        Self { state, error: None }
    }

    /// Get current state
    pub fn state(&self) -> &WebsiteStatus {
        &self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: StatusEvent) -> Result<&WebsiteStatus, String> {
        let new_state = match (&self.state, &event) {
            // Entering the build phase
            (
                WebsiteStatus::Pending | WebsiteStatus::Failed | WebsiteStatus::Active,
                StatusEvent::StartBuild,
            ) => {
                self.error = None;
                WebsiteStatus::Building
            }

            // Retrying only the certificate phase
            (WebsiteStatus::Failed, StatusEvent::StartSsl) => {
                self.error = None;
                WebsiteStatus::SslProvisioning
            }

            (WebsiteStatus::Building, StatusEvent::BuildCompleted) => {
                WebsiteStatus::SslProvisioning
            }
            (WebsiteStatus::SslProvisioning, StatusEvent::SslCompleted) => WebsiteStatus::Active,

            (WebsiteStatus::Building | WebsiteStatus::SslProvisioning, StatusEvent::Fail(err)) => {
                self.error = Some(err.clone());
                WebsiteStatus::Failed
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(&self.state)
    }
}
