//! Lease reaper worker
//!
//! Fails websites whose run stopped renewing its lease, so a crashed worker
//! never leaves a site stuck in `building` or `ssl_provisioning`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::deploy::fsm::{StatusEvent, StatusFsm};
use crate::deploy::recorder::Recorder;
use crate::errors::ProvisionError;
use crate::storage::store::ProgressStore;

pub const ABANDONED_MESSAGE: &str = "Provisioning run abandoned: worker stopped renewing its lease";

/// Lease reaper options
#[derive(Debug, Clone)]
pub struct Options {
    /// Scan interval
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Run the lease reaper worker
pub async fn run<S, F>(
    options: &Options,
    store: Arc<dyn ProgressStore>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Lease reaper worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Lease reaper worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        match reap_expired(store.clone(), Utc::now()).await {
            Ok(0) => debug!("No abandoned runs"),
            Ok(reaped) => info!("Released {} abandoned run(s)", reaped),
            Err(e) => error!("Lease scan failed: {}", e),
        }
    }
}

/// Mark every running website without a live lease as failed
pub async fn reap_expired(store: Arc<dyn ProgressStore>, now: DateTime<Utc>) -> Result<usize, ProvisionError> {
    let mut reaped = 0;
    for website in store.list().await? {
        if !website.status.is_running() || website.has_live_lease(now) {
            continue;
        }

        let recorder = Recorder::new(store.clone(), &website.id);
        let result = recorder
            .update(|current| {
                // re-checked against the committed record
                if !current.status.is_running() || current.has_live_lease(now) {
                    return Err(ProvisionError::Conflict {
                        website_id: current.id.clone(),
                        expected: website.version,
                        found: current.version,
                    });
                }
                let mut fsm = StatusFsm::new(current.status.clone());
                fsm.process(StatusEvent::Fail(ABANDONED_MESSAGE.to_string()))
                    .map_err(ProvisionError::Internal)?;
                current.status = fsm.state().clone();
                current.error_message = Some(ABANDONED_MESSAGE.to_string());
                current.lease = None;
                Ok(())
            })
            .await;

        match result {
            Ok(_) => {
                warn!(website_id = %website.id, "Released abandoned provisioning run");
                reaped += 1;
            }
            Err(ProvisionError::Conflict { .. }) => {
                debug!(website_id = %website.id, "Run resumed before it could be released");
            }
            Err(e) => error!(website_id = %website.id, "Failed to release run: {}", e),
        }
    }
    Ok(reaped)
}
