//! Phase executor
//!
//! Runs a phase's steps in order over one session. Each step is retried on
//! transient failures with exponential backoff, the whole phase is bounded by
//! a ceiling, and progress is persisted after every completed step.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::deploy::fsm::FsmSettings;
use crate::deploy::lease::CancelSignal;
use crate::deploy::recorder::Recorder;
use crate::deploy::step::{Step, StepOutcome};
use crate::errors::ProvisionError;
use crate::models::progress::PhaseProgress;
use crate::models::website::Website;
use crate::session::{OutputLine, OutputStream, Session};
use crate::utils::{calc_exp_backoff, Redactor};

/// The two phases of a provisioning run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Build,
    Ssl,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Build => "build",
            Phase::Ssl => "ssl",
        }
    }

    pub fn progress<'a>(&self, website: &'a Website) -> &'a PhaseProgress {
        match self {
            Phase::Build => &website.build_progress,
            Phase::Ssl => &website.ssl_progress,
        }
    }

    pub fn progress_mut<'a>(&self, website: &'a mut Website) -> &'a mut PhaseProgress {
        match self {
            Phase::Build => &mut website.build_progress,
            Phase::Ssl => &mut website.ssl_progress,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executes one phase of one run
pub struct PhaseRunner<'a> {
    pub phase: Phase,
    pub settings: &'a FsmSettings,
    pub session: &'a dyn Session,
    pub recorder: &'a Recorder,
    pub cancel: &'a CancelSignal,
    pub redactor: &'a Redactor,
}

impl PhaseRunner<'_> {
    /// Run `steps` to completion, or stop at the first unrecoverable failure
    pub async fn run(&self, steps: &[Box<dyn Step>]) -> Result<(), ProvisionError> {
        let total = steps.len() as u32;
        let started = Instant::now();
        let ceiling = self.settings.phase_timeout;
        info!(phase = %self.phase, total, "Phase starting");

        if steps.is_empty() {
            let phase = self.phase;
            self.recorder
                .update(|website| {
                    let progress = phase.progress_mut(website);
                    *progress = progress.advance(0, 0, "Nothing to do");
                    Ok(())
                })
                .await?;
            info!(phase = %self.phase, "Phase has no steps");
            return Ok(());
        }

        for (index, step) in steps.iter().enumerate() {
            let number = index as u32 + 1;
            let span = info_span!("step", phase = %self.phase, step = step.name(), number);
            self.run_step(step.as_ref(), started, ceiling)
                .instrument(span)
                .await?;

            if self.cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled(format!(
                    "stopped after step '{}'",
                    step.name()
                )));
            }

            let phase = self.phase;
            let message = step.description().to_string();
            let committed = self
                .recorder
                .update(|website| {
                    let progress = phase.progress_mut(website);
                    *progress = progress.advance(number, total, message.clone());
                    Ok(())
                })
                .await?;
            info!(
                phase = %self.phase,
                step = number,
                total,
                percent = phase.progress(&committed).percent,
                "Step completed"
            );
        }

        info!(phase = %self.phase, elapsed_secs = started.elapsed().as_secs(), "Phase completed");
        Ok(())
    }

    async fn run_step(
        &self,
        step: &dyn Step,
        started: Instant,
        ceiling: Duration,
    ) -> Result<StepOutcome, ProvisionError> {
        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled(format!(
                    "stopped before step '{}'",
                    step.name()
                )));
            }

            let remaining = ceiling.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(ProvisionError::PhaseTimeout {
                    phase: self.phase.to_string(),
                    ceiling,
                });
            }
            let timeout = step.timeout().unwrap_or(self.settings.step_timeout).min(remaining);

            info!(attempt = attempt + 1, timeout_secs = timeout.as_secs(), "{}", step.description());
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(forward_output(rx, self.redactor.clone()).in_current_span());

            match step.run(self.session, timeout, Some(tx)).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < self.settings.retry_count => {
                    let delay = calc_exp_backoff(&self.settings.retry_backoff, attempt);
                    attempt += 1;
                    warn!(
                        retry_in_ms = delay.as_millis() as u64,
                        "Step failed, retrying: {}",
                        self.redactor.redact(&e.to_string())
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Forward streamed command output to debug logs
async fn forward_output(mut rx: mpsc::UnboundedReceiver<OutputLine>, redactor: Redactor) {
    while let Some(line) = rx.recv().await {
        let text = redactor.redact(&line.line);
        match line.stream {
            OutputStream::Stdout => debug!(target: "pressbuild::remote", "{}", text),
            OutputStream::Stderr => debug!(target: "pressbuild::remote", stderr = true, "{}", text),
        }
    }
}
