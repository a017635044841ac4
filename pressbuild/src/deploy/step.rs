//! Provisioning steps
//!
//! A step is one idempotent unit of remote work. Steps with a read-only
//! `check` are skipped when the check already passes, which is what makes a
//! replayed phase safe on a partially provisioned host.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::errors::ProvisionError;
use crate::session::{CommandOutput, OutputLine, Session, SessionError};
use crate::utils::tail_lines;

/// Lines of remote output kept in a step failure message
const ERROR_TAIL_LINES: usize = 8;

/// What a successful step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Remote state was changed
    Applied,
    /// The check showed the work was already done
    AlreadySatisfied,
}

/// One unit of work within a phase
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable identifier, used in logs
    fn name(&self) -> &str;

    /// Human readable progress message
    fn description(&self) -> &str;

    /// Per-step timeout; the phase default applies when `None`
    fn timeout(&self) -> Option<Duration>;

    /// Run the step once within `timeout`
    async fn run(
        &self,
        session: &dyn Session,
        timeout: Duration,
        lines: Option<mpsc::UnboundedSender<OutputLine>>,
    ) -> Result<StepOutcome, ProvisionError>;
}

/// A step expressed as shell scripts
#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub name: String,
    pub description: String,
    /// Exits 0 when the step's effect is already in place
    pub check: Option<String>,
    /// Performs the work
    pub apply: String,
    pub timeout: Option<Duration>,
}

impl ScriptStep {
    pub fn new(name: &str, description: &str, apply: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            check: None,
            apply: apply.into(),
            timeout: None,
        }
    }

    pub fn with_check(mut self, check: impl Into<String>) -> Self {
        self.check = Some(check.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn remaining(&self, deadline: Instant) -> Result<Duration, ProvisionError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProvisionError::Command(format!("step '{}' ran out of time", self.name)));
        }
        Ok(remaining)
    }

    fn failure(&self, what: &str, output: &CommandOutput) -> ProvisionError {
        let detail = if output.stderr.trim().is_empty() {
            tail_lines(&output.stdout, ERROR_TAIL_LINES)
        } else {
            tail_lines(&output.stderr, ERROR_TAIL_LINES)
        };
        ProvisionError::Command(format!(
            "step '{}' {} exited with code {}: {}",
            self.name, what, output.exit_code, detail
        ))
    }

    fn session_failure(&self, err: SessionError) -> ProvisionError {
        match ProvisionError::from(err) {
            ProvisionError::Command(msg) => {
                ProvisionError::Command(format!("step '{}': {}", self.name, msg))
            }
            other => other,
        }
    }
}

#[async_trait]
impl Step for ScriptStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn run(
        &self,
        session: &dyn Session,
        timeout: Duration,
        lines: Option<mpsc::UnboundedSender<OutputLine>>,
    ) -> Result<StepOutcome, ProvisionError> {
        let deadline = Instant::now() + timeout;

        if let Some(check) = &self.check {
            let output = session
                .execute(check, self.remaining(deadline)?)
                .await
                .map_err(|e| self.session_failure(e))?;
            if output.success() {
                info!(step = %self.name, "Step already satisfied, skipping");
                return Ok(StepOutcome::AlreadySatisfied);
            }
            debug!(step = %self.name, exit_code = output.exit_code, "Check did not pass");
        }

        let output = session
            .execute_streaming(&self.apply, self.remaining(deadline)?, lines)
            .await
            .map_err(|e| self.session_failure(e))?;
        if !output.success() {
            return Err(self.failure("command", &output));
        }

        // the check must hold once the work is done
        if let Some(check) = &self.check {
            let output = session
                .execute(check, self.remaining(deadline)?)
                .await
                .map_err(|e| self.session_failure(e))?;
            if !output.success() {
                return Err(self.failure("verification", &output));
            }
        }

        Ok(StepOutcome::Applied)
    }
}
