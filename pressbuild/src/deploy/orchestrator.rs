//! Build orchestrator
//!
//! Owns the lifecycle of provisioning runs: one exclusive run per website,
//! build then certificate phase over a single session, every transition
//! persisted through compare-and-set.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::authn::credentials::CredentialResolver;
use crate::deploy::blueprint::{Blueprint, SiteContext};
use crate::deploy::executor::{Phase, PhaseRunner};
use crate::deploy::fsm::{FsmSettings, StatusEvent, StatusFsm, WebsiteStatus};
use crate::deploy::lease::{CancelHandle, CancelSignal, RunRegistry};
use crate::deploy::recorder::Recorder;
use crate::errors::ProvisionError;
use crate::models::progress::PhaseProgress;
use crate::models::website::{
    normalize_domain, validate_website_id, ConnectionDescriptor, NewWebsite, RunLease, StatusView,
    Website,
};
use crate::notify::{FailureNotice, Notifier};
use crate::probe;
use crate::session::{Connector, Session};
use crate::storage::store::ProgressStore;
use crate::utils::{calc_exp_backoff, generate_uuid, CooldownOptions, Redactor};

const QUEUED: &str = "Queued";

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Identifies this process in run leases
    pub worker_id: String,

    pub connect_timeout: Duration,

    /// Extra connection attempts on transient failures; never on auth errors
    pub connect_retries: u32,

    pub connect_backoff: CooldownOptions,

    /// Timeout for each detection check
    pub probe_timeout: Duration,

    /// Lease lifetime; renewed every third of it
    pub lease_ttl: Duration,

    pub notify_timeout: Duration,

    pub fsm: FsmSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            worker_id: format!("pressbuild-{}", &generate_uuid()[..8]),
            connect_timeout: Duration::from_secs(30),
            connect_retries: 2,
            connect_backoff: CooldownOptions {
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
            },
            probe_timeout: Duration::from_secs(30),
            lease_ttl: Duration::from_secs(120),
            notify_timeout: Duration::from_secs(10),
            fsm: FsmSettings::default(),
        }
    }
}

/// Collaborators the orchestrator drives
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn ProgressStore>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub connector: Arc<dyn Connector>,
    pub blueprint: Arc<dyn Blueprint>,
    pub notifier: Arc<dyn Notifier>,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub website_id: String,
    pub run_id: String,
    pub status: WebsiteStatus,
    pub error_message: Option<String>,
}

/// A started run
pub struct RunHandle {
    website_id: String,
    run_id: String,
    initial: StatusView,
    cancel: CancelHandle,
    join: JoinHandle<RunReport>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("website_id", &self.website_id)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    pub fn website_id(&self) -> &str {
        &self.website_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Status committed when the run was accepted
    pub fn initial_status(&self) -> &StatusView {
        &self.initial
    }

    /// Request cancellation; the in-flight command is allowed to finish
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<RunReport, ProvisionError> {
        self.join
            .await
            .map_err(|e| ProvisionError::Internal(format!("run task failed: {}", e)))
    }
}

struct Inner {
    services: Services,
    settings: OrchestratorSettings,
    registry: Arc<RunRegistry>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(services: Services, settings: OrchestratorSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                services,
                settings,
                registry: RunRegistry::new(),
            }),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> Arc<dyn ProgressStore> {
        self.inner.services.store.clone()
    }

    /// Create a website record in `pending`
    pub async fn register(&self, new: NewWebsite) -> Result<Website, ProvisionError> {
        new.connection.validate()?;
        let domain = normalize_domain(&new.domain)?;
        if new.owner_id.trim().is_empty() {
            return Err(ProvisionError::InvalidWebsite("owner is empty".to_string()));
        }

        let id = match new.id {
            Some(id) => {
                validate_website_id(&id)?;
                id
            }
            None => generate_uuid(),
        };
        let website = Website::new(id, new.owner_id, domain, new.connection);
        let website = self.inner.services.store.insert(website).await?;
        info!(website_id = %website.id, domain = %website.domain, "Website registered");
        Ok(website)
    }

    /// Start provisioning `website_id` over `descriptor`.
    ///
    /// Returns as soon as the run is accepted and its initial status is
    /// committed. A failed website resumes at the phase that failed; any
    /// other website provisions from scratch.
    pub async fn start(
        &self,
        website_id: &str,
        descriptor: ConnectionDescriptor,
    ) -> Result<RunHandle, ProvisionError> {
        descriptor.validate()?;

        let inner = &self.inner;
        let run_id = generate_uuid();
        let (claim, cancel, signal) = inner.registry.try_claim(website_id, &run_id)?;

        let now = Utc::now();
        let lease = RunLease {
            run_id: run_id.clone(),
            worker: inner.settings.worker_id.clone(),
            expires_at: now + lease_duration(inner.settings.lease_ttl),
        };

        let recorder = Recorder::new(inner.services.store.clone(), website_id);
        let mut phase = Phase::Build;
        let website = recorder
            .update(|website| {
                if website.has_live_lease(now) {
                    return Err(ProvisionError::AlreadyRunning(website.id.clone()));
                }
                phase = begin_run(website, &descriptor, &lease)?;
                Ok(())
            })
            .await?;

        info!(
            website_id,
            run_id = %run_id,
            phase = %phase,
            "Provisioning run accepted"
        );

        let task = RunTask {
            inner: self.inner.clone(),
            website_id: website_id.to_string(),
            owner_id: website.owner_id.clone(),
            domain: website.domain.clone(),
            descriptor,
            phase,
            recorder: recorder.for_run(&run_id),
            cancel: cancel.clone(),
            signal,
        };
        let span = info_span!("run", website_id = %website_id, run_id = %run_id);
        let join = tokio::spawn(
            async move {
                let _claim = claim;
                task.run().await
            }
            .instrument(span),
        );

        Ok(RunHandle {
            website_id: website_id.to_string(),
            run_id,
            initial: website.status_view(),
            cancel,
            join,
        })
    }

    /// Latest committed status of a website
    pub async fn get(&self, website_id: &str) -> Result<StatusView, ProvisionError> {
        Ok(self.inner.services.store.get(website_id).await?.status_view())
    }

    /// Connection descriptor stored with a website, for starts that do not
    /// supply a new one
    pub async fn stored_descriptor(&self, website_id: &str) -> Result<ConnectionDescriptor, ProvisionError> {
        Ok(self.inner.services.store.get(website_id).await?.connection)
    }

    /// Signal the website's active run; false when this process runs none
    pub fn cancel(&self, website_id: &str) -> bool {
        let found = self.inner.registry.cancel(website_id);
        if found {
            info!(website_id, "Cancellation requested");
        }
        found
    }

    pub fn active_runs(&self) -> usize {
        self.inner.registry.active_count()
    }

    /// Cancel every run and wait up to `timeout` for them to wind down.
    /// Returns the number of runs still active.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let cancelled = self.inner.registry.cancel_all();
        if cancelled > 0 {
            info!("Cancelling {} active provisioning run(s)...", cancelled);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while self.inner.registry.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.inner.registry.active_count()
    }
}

/// Reset the record for a new run and decide where it resumes
fn begin_run(
    website: &mut Website,
    descriptor: &ConnectionDescriptor,
    lease: &RunLease,
) -> Result<Phase, ProvisionError> {
    // a running status without a live lease belongs to a dead run
    let status = if website.status.is_running() {
        WebsiteStatus::Failed
    } else {
        website.status.clone()
    };
    let resume_ssl = status == WebsiteStatus::Failed && website.build_progress.completed;

    let mut fsm = StatusFsm::new(status);
    let phase = if resume_ssl {
        fsm.process(StatusEvent::StartSsl).map_err(ProvisionError::Internal)?;
        website.ssl_progress = PhaseProgress::starting(QUEUED);
        Phase::Ssl
    } else {
        fsm.process(StatusEvent::StartBuild).map_err(ProvisionError::Internal)?;
        website.build_progress = PhaseProgress::starting(QUEUED);
        website.ssl_progress = PhaseProgress::default();
        Phase::Build
    };

    website.status = fsm.state().clone();
    website.error_message = None;
    website.connection = descriptor.clone();
    website.lease = Some(lease.clone());
    Ok(phase)
}

fn transition(website: &mut Website, event: StatusEvent) -> Result<(), ProvisionError> {
    let mut fsm = StatusFsm::new(website.status.clone());
    fsm.process(event).map_err(ProvisionError::Internal)?;
    website.status = fsm.state().clone();
    Ok(())
}

fn lease_duration(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(120))
}

/// One provisioning run, executed on its own task
struct RunTask {
    inner: Arc<Inner>,
    website_id: String,
    owner_id: String,
    domain: String,
    descriptor: ConnectionDescriptor,
    phase: Phase,
    recorder: Recorder,
    cancel: CancelHandle,
    signal: CancelSignal,
}

impl RunTask {
    async fn run(self) -> RunReport {
        info!(phase = %self.phase, "Provisioning run started");

        let (stop_tx, stop_rx) = oneshot::channel();
        let heartbeat = tokio::spawn(
            heartbeat(
                self.recorder.clone(),
                self.inner.settings.lease_ttl,
                self.cancel.clone(),
                stop_rx,
            )
            .in_current_span(),
        );

        let mut redactor = Redactor::new()
            .with(self.descriptor.host.clone())
            .with(self.descriptor.credential_ref.clone())
            .with_word(self.descriptor.username.clone());
        let mut phase = self.phase;
        let result = self.execute(&mut phase, &mut redactor).await;

        let _ = stop_tx.send(());
        let _ = heartbeat.await;

        self.finish(phase, result, &redactor).await
    }

    async fn execute(&self, phase: &mut Phase, redactor: &mut Redactor) -> Result<(), ProvisionError> {
        let session = self.connect(redactor).await?;
        if self.signal.is_cancelled() {
            session.close().await;
            return Err(ProvisionError::Cancelled("stopped after connecting".to_string()));
        }
        let result = self.drive(session.as_ref(), phase, redactor).await;
        session.close().await;
        debug!("Session closed");
        result
    }

    async fn connect(&self, redactor: &mut Redactor) -> Result<Box<dyn Session>, ProvisionError> {
        let settings = &self.inner.settings;
        let services = &self.inner.services;
        let mut attempt = 0;

        loop {
            if self.signal.is_cancelled() {
                return Err(ProvisionError::Cancelled("stopped before connecting".to_string()));
            }

            // read fresh for every attempt and handed to the session
            let credential = services
                .credentials
                .resolve(&self.website_id, &self.descriptor.credential_ref)
                .await?;
            *redactor = std::mem::take(redactor).with(credential.secret().to_string());

            debug!(attempt = attempt + 1, kind = credential.kind(), "Opening session");
            let err = match services
                .connector
                .open(&self.descriptor, credential, settings.connect_timeout)
                .await
            {
                Ok(session) => {
                    info!("Session established");
                    return Ok(session);
                }
                Err(e) => ProvisionError::from(e),
            };

            if !matches!(err, ProvisionError::Connection(_)) || attempt >= settings.connect_retries {
                return Err(err);
            }

            let delay = calc_exp_backoff(&settings.connect_backoff, attempt);
            attempt += 1;
            warn!(
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                "Connection failed, retrying: {}",
                redactor.redact(&err.to_string())
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.signal.cancelled() => {}
            }
        }
    }

    async fn drive(
        &self,
        session: &dyn Session,
        phase: &mut Phase,
        redactor: &Redactor,
    ) -> Result<(), ProvisionError> {
        let settings = &self.inner.settings;
        let blueprint = &self.inner.services.blueprint;

        let detection = probe::detect(session, &self.domain, settings.probe_timeout).await;
        self.ensure_not_cancelled("detection")?;
        self.recorder
            .update(|website| {
                website.detection = Some(detection.clone());
                Ok(())
            })
            .await?;
        let ctx = SiteContext::new(&self.website_id, &self.domain, !self.descriptor.is_root(), detection);

        if *phase == Phase::Build {
            self.runner(Phase::Build, session, redactor)
                .run(&blueprint.build_steps(&ctx))
                .await?;
            self.ensure_not_cancelled("build phase")?;
            self.recorder
                .update(|website| {
                    transition(website, StatusEvent::BuildCompleted)?;
                    website.ssl_progress = PhaseProgress::starting(QUEUED);
                    Ok(())
                })
                .await?;
            info!("Build phase complete, provisioning certificate");
            *phase = Phase::Ssl;
        }

        self.runner(Phase::Ssl, session, redactor)
            .run(&blueprint.ssl_steps(&ctx))
            .await
    }

    fn ensure_not_cancelled(&self, stage: &str) -> Result<(), ProvisionError> {
        if self.signal.is_cancelled() {
            return Err(ProvisionError::Cancelled(format!("stopped after {}", stage)));
        }
        Ok(())
    }

    fn runner<'a>(&'a self, phase: Phase, session: &'a dyn Session, redactor: &'a Redactor) -> PhaseRunner<'a> {
        PhaseRunner {
            phase,
            settings: &self.inner.settings.fsm,
            session,
            recorder: &self.recorder,
            cancel: &self.signal,
            redactor,
        }
    }

    async fn finish(&self, phase: Phase, result: Result<(), ProvisionError>, redactor: &Redactor) -> RunReport {
        let (event, message) = match &result {
            Ok(()) => (StatusEvent::SslCompleted, None),
            Err(e) => {
                let message = redactor.redact(&e.to_string());
                if matches!(e, ProvisionError::Cancelled(_)) {
                    warn!(phase = %phase, "Provisioning run cancelled: {}", message);
                } else {
                    error!(phase = %phase, "Provisioning run failed: {}", message);
                }
                (StatusEvent::Fail(message.clone()), Some(message))
            }
        };

        let committed = self
            .recorder
            .update(|website| {
                transition(website, event.clone())?;
                website.error_message = message.clone();
                website.lease = None;
                Ok(())
            })
            .await;

        let status = match committed {
            Ok(website) => {
                if let Some(message) = &message {
                    self.notify(phase, &website, message).await;
                } else {
                    info!("Provisioning run completed, website active");
                }
                website.status
            }
            Err(e) => {
                // another run or the reaper owns the record now
                error!("Failed to record run outcome: {}", redactor.redact(&e.to_string()));
                WebsiteStatus::Failed
            }
        };

        RunReport {
            website_id: self.website_id.clone(),
            run_id: self.recorder_run_id(),
            status,
            error_message: message,
        }
    }

    fn recorder_run_id(&self) -> String {
        self.recorder.run_id().unwrap_or_default().to_string()
    }

    async fn notify(&self, phase: Phase, website: &Website, message: &str) {
        let notice = FailureNotice {
            website_id: self.website_id.clone(),
            owner_id: self.owner_id.clone(),
            domain: website.domain.clone(),
            phase: phase.to_string(),
            error_message: message.to_string(),
            failed_at: Utc::now(),
        };
        let timeout = self.inner.settings.notify_timeout;
        match tokio::time::timeout(timeout, self.inner.services.notifier.phase_failed(&notice)).await {
            Ok(Ok(())) => debug!("Failure notice delivered"),
            Ok(Err(e)) => warn!("Failed to deliver failure notice: {}", e),
            Err(_) => warn!("Failure notice timed out after {}s", timeout.as_secs()),
        }
    }
}

/// Renew the run's lease until stopped; cancels the run if the lease is lost
async fn heartbeat(recorder: Recorder, ttl: Duration, cancel: CancelHandle, mut stop: oneshot::Receiver<()>) {
    let interval = ttl / 3;
    loop {
        tokio::select! {
            _ = &mut stop => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let expires_at = Utc::now() + lease_duration(ttl);
        match recorder
            .update(|website| {
                if let Some(lease) = website.lease.as_mut() {
                    lease.expires_at = expires_at;
                }
                Ok(())
            })
            .await
        {
            Ok(_) => debug!("Lease renewed"),
            Err(ProvisionError::Cancelled(_)) => {
                warn!("Run lease lost, stopping run");
                cancel.cancel();
                return;
            }
            Err(e) => warn!("Failed to renew lease: {}", e),
        }
    }
}
