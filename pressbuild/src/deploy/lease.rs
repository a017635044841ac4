//! In-process run registry and cancellation
//!
//! The registry is the fast path of the one-run-per-website rule: a second
//! start on this worker fails before touching the store. The persisted
//! [`RunLease`](crate::models::website::RunLease) covers other workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

use crate::errors::ProvisionError;

/// Receiving side of a run's cancellation flag
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // sender gone without cancelling
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Sending side of a run's cancellation flag
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn pair() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, CancelSignal { rx })
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

#[derive(Debug)]
struct ActiveRun {
    run_id: String,
    cancel: CancelHandle,
    started_at: DateTime<Utc>,
}

/// Runs currently executing in this process
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, ActiveRun>>,
}

impl RunRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `website_id` for `run_id`. The claim is released when dropped.
    pub fn try_claim(
        self: &Arc<Self>,
        website_id: &str,
        run_id: &str,
    ) -> Result<(RunClaim, CancelHandle, CancelSignal), ProvisionError> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(active) = runs.get(website_id) {
            debug!(
                website_id,
                active_run = %active.run_id,
                since = %active.started_at,
                "Website already has a run in this process"
            );
            return Err(ProvisionError::AlreadyRunning(website_id.to_string()));
        }

        let (cancel, signal) = CancelHandle::pair();
        runs.insert(
            website_id.to_string(),
            ActiveRun {
                run_id: run_id.to_string(),
                cancel: cancel.clone(),
                started_at: Utc::now(),
            },
        );

        let claim = RunClaim {
            registry: Arc::clone(self),
            website_id: website_id.to_string(),
            run_id: run_id.to_string(),
        };
        Ok((claim, cancel, signal))
    }

    /// Request cancellation of the website's run; false when none is active
    pub fn cancel(&self, website_id: &str) -> bool {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        match runs.get(website_id) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        for active in runs.values() {
            active.cancel.cancel();
        }
        runs.len()
    }

    pub fn is_active(&self, website_id: &str) -> bool {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.contains_key(website_id)
    }

    pub fn active_count(&self) -> usize {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.len()
    }

    fn release(&self, website_id: &str, run_id: &str) {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if runs.get(website_id).is_some_and(|active| active.run_id == run_id) {
            runs.remove(website_id);
        }
    }
}

/// Exclusive claim on a website within this process
#[derive(Debug)]
pub struct RunClaim {
    registry: Arc<RunRegistry>,
    website_id: String,
    run_id: String,
}

impl RunClaim {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.registry.release(&self.website_id, &self.run_id);
    }
}
