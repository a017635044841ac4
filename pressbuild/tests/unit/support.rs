//! Shared fakes: a scripted remote host, a recording store and a marker blueprint

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use pressbuild::authn::credentials::{Credential, StaticCredentialResolver};
use pressbuild::deploy::blueprint::{Blueprint, SiteContext};
use pressbuild::deploy::fsm::FsmSettings;
use pressbuild::deploy::orchestrator::{Orchestrator, OrchestratorSettings, Services};
use pressbuild::deploy::step::{ScriptStep, Step};
use pressbuild::errors::ProvisionError;
use pressbuild::models::website::{ConnectionDescriptor, NewWebsite, Website};
use pressbuild::notify::{FailureNotice, Notifier};
use pressbuild::session::{CommandOutput, Connector, OutputLine, OutputStream, Session, SessionError};
use pressbuild::storage::store::{MemoryStore, ProgressStore};
use pressbuild::utils::CooldownOptions;

pub const HOST: &str = "203.0.113.10";
pub const SECRET: &str = "s3cret-pw";
pub const WEBSITE_ID: &str = "site-1";

pub fn descriptor() -> ConnectionDescriptor {
    ConnectionDescriptor {
        host: HOST.to_string(),
        port: 22,
        username: "deploy".to_string(),
        credential_ref: "cred-1".to_string(),
    }
}

/// Pauses the apply command of one step until released
pub struct Gate {
    pub step: String,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

/// Simulated server: step markers survive across sessions
#[derive(Default)]
pub struct FakeRemote {
    markers: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    gate: Mutex<Option<Gate>>,
    open_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    applies: Mutex<Vec<String>>,
    pub commands: AtomicUsize,
    pub auth_fails: AtomicBool,
    pub refused_opens: AtomicU32,
    pub opens: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every apply of `step` exit non-zero
    pub fn fail_step(&self, step: &str) {
        self.failing.lock().unwrap().insert(step.to_string());
    }

    pub fn heal_step(&self, step: &str) {
        self.failing.lock().unwrap().remove(step);
    }

    /// Block the apply of `step`; returns (entered, release)
    pub fn gate_step(&self, step: &str) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Gate {
            step: step.to_string(),
            entered: entered.clone(),
            release: release.clone(),
        });
        (entered, release)
    }

    /// Block the next session open; returns (entered, release)
    pub fn gate_open(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.open_gate.lock().unwrap() = Some((entered.clone(), release.clone()));
        (entered, release)
    }

    pub fn applies(&self) -> Vec<String> {
        self.applies.lock().unwrap().clone()
    }

    pub fn apply_count(&self, step: &str) -> usize {
        self.applies().iter().filter(|s| s.as_str() == step).count()
    }

    async fn run(&self, command: &str, lines: Option<mpsc::UnboundedSender<OutputLine>>) -> CommandOutput {
        self.commands.fetch_add(1, Ordering::SeqCst);

        if let Some(step) = command.strip_prefix("test -e /markers/") {
            let present = self.markers.lock().unwrap().contains(step);
            return CommandOutput {
                exit_code: if present { 0 } else { 1 },
                ..Default::default()
            };
        }

        if let Some(step) = command.strip_prefix("touch /markers/") {
            self.applies.lock().unwrap().push(step.to_string());

            let gate = {
                let mut gate = self.gate.lock().unwrap();
                if gate.as_ref().is_some_and(|g| g.step == step) {
                    gate.take()
                } else {
                    None
                }
            };
            if let Some(gate) = gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }

            if let Some(lines) = &lines {
                let _ = lines.send(OutputLine {
                    stream: OutputStream::Stdout,
                    line: format!("applying {} on {}", step, HOST),
                });
            }

            if self.failing.lock().unwrap().contains(step) {
                return CommandOutput {
                    exit_code: 100,
                    stdout: String::new(),
                    stderr: format!("E: {} failed on {} as deploy", step, HOST),
                };
            }
            self.markers.lock().unwrap().insert(step.to_string());
            return CommandOutput::default();
        }

        // detection probes find nothing
        CommandOutput {
            exit_code: 1,
            ..Default::default()
        }
    }
}

pub struct FakeSession {
    remote: Arc<FakeRemote>,
    closed: AtomicBool,
}

#[async_trait]
impl Session for FakeSession {
    async fn execute_streaming(
        &self,
        command: &str,
        _timeout: Duration,
        lines: Option<mpsc::UnboundedSender<OutputLine>>,
    ) -> Result<CommandOutput, SessionError> {
        if self.is_closed() {
            return Err(SessionError::SessionClosed("closed".to_string()));
        }
        Ok(self.remote.run(command, lines).await)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeConnector {
    pub remote: Arc<FakeRemote>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        credential: Credential,
        _timeout: Duration,
    ) -> Result<Box<dyn Session>, SessionError> {
        self.remote.opens.fetch_add(1, Ordering::SeqCst);

        let gate = self.remote.open_gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }

        if self.remote.auth_fails.load(Ordering::SeqCst) {
            return Err(SessionError::AuthFailure(format!(
                "{}@{} rejected {}",
                descriptor.username,
                descriptor.host,
                credential.secret()
            )));
        }
        let refused = self.remote.refused_opens.load(Ordering::SeqCst);
        if refused > 0 {
            self.remote.refused_opens.store(refused - 1, Ordering::SeqCst);
            return Err(SessionError::ConnectionRefused(format!("{}:{}", descriptor.host, descriptor.port)));
        }

        Ok(Box::new(FakeSession {
            remote: self.remote.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Blueprint of `build` + `ssl` marker steps
pub struct MarkerBlueprint {
    pub build: u32,
    pub ssl: u32,
}

impl MarkerBlueprint {
    fn steps(prefix: &str, count: u32) -> Vec<Box<dyn Step>> {
        (1..=count)
            .map(|n| {
                let name = format!("{}_{}", prefix, n);
                Box::new(
                    ScriptStep::new(&name, &format!("Running {}", name), format!("touch /markers/{}", name))
                        .with_check(format!("test -e /markers/{}", name)),
                ) as Box<dyn Step>
            })
            .collect()
    }
}

impl Blueprint for MarkerBlueprint {
    fn build_steps(&self, _ctx: &SiteContext) -> Vec<Box<dyn Step>> {
        Self::steps("build", self.build)
    }

    fn ssl_steps(&self, _ctx: &SiteContext) -> Vec<Box<dyn Step>> {
        Self::steps("ssl", self.ssl)
    }
}

/// Holds the caller of the first update whose committed record matches
pub struct Pause {
    matches: fn(&Website) -> bool,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

/// Memory store that keeps every committed revision
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    history: Mutex<Vec<Website>>,
    pause: Mutex<Option<Pause>>,
}

impl RecordingStore {
    pub fn history(&self) -> Vec<Website> {
        self.history.lock().unwrap().clone()
    }

    /// Block after committing the first matching revision; returns (entered, release)
    pub fn pause_after(&self, matches: fn(&Website) -> bool) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.pause.lock().unwrap() = Some(Pause {
            matches,
            entered: entered.clone(),
            release: release.clone(),
        });
        (entered, release)
    }
}

#[async_trait]
impl ProgressStore for RecordingStore {
    async fn get(&self, website_id: &str) -> Result<Website, ProvisionError> {
        self.inner.get(website_id).await
    }

    async fn update(
        &self,
        website_id: &str,
        previous_version: u64,
        website: Website,
    ) -> Result<Website, ProvisionError> {
        let committed = self.inner.update(website_id, previous_version, website).await?;
        self.history.lock().unwrap().push(committed.clone());

        let pause = {
            let mut pause = self.pause.lock().unwrap();
            if pause.as_ref().is_some_and(|p| (p.matches)(&committed)) {
                pause.take()
            } else {
                None
            }
        };
        if let Some(pause) = pause {
            pause.entered.notify_one();
            pause.release.notified().await;
        }
        Ok(committed)
    }

    async fn insert(&self, website: Website) -> Result<Website, ProvisionError> {
        self.inner.insert(website).await
    }

    async fn list(&self) -> Result<Vec<Website>, ProvisionError> {
        self.inner.list().await
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    /// (phase, error message) pairs
    pub fn notices(&self) -> Vec<(String, String)> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn phase_failed(&self, notice: &FailureNotice) -> Result<(), ProvisionError> {
        self.notices
            .lock()
            .unwrap()
            .push((notice.phase.clone(), notice.error_message.clone()));
        Ok(())
    }
}

pub fn fast_settings() -> OrchestratorSettings {
    let backoff = CooldownOptions {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
    };
    OrchestratorSettings {
        worker_id: "test-worker".to_string(),
        connect_timeout: Duration::from_secs(1),
        connect_retries: 2,
        connect_backoff: backoff.clone(),
        probe_timeout: Duration::from_secs(1),
        lease_ttl: Duration::from_secs(30),
        notify_timeout: Duration::from_secs(1),
        fsm: FsmSettings {
            step_timeout: Duration::from_secs(5),
            retry_count: 2,
            retry_backoff: backoff,
            phase_timeout: Duration::from_secs(30),
        },
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub remote: Arc<FakeRemote>,
    pub store: Arc<RecordingStore>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_blueprint(MarkerBlueprint { build: 5, ssl: 4 }).await
    }

    pub async fn with_blueprint(blueprint: MarkerBlueprint) -> Self {
        let remote = FakeRemote::new();
        let store = Arc::new(RecordingStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let credentials = StaticCredentialResolver::new();
        credentials.insert("cred-1", "password", SECRET);

        let orchestrator = Orchestrator::new(
            Services {
                store: store.clone(),
                credentials: Arc::new(credentials),
                connector: Arc::new(FakeConnector { remote: remote.clone() }),
                blueprint: Arc::new(blueprint),
                notifier: notifier.clone(),
            },
            fast_settings(),
        );

        orchestrator
            .register(NewWebsite {
                id: Some(WEBSITE_ID.to_string()),
                owner_id: "owner-1".to_string(),
                domain: "Example.com".to_string(),
                connection: descriptor(),
            })
            .await
            .unwrap();

        Self {
            orchestrator,
            remote,
            store,
            notifier,
        }
    }

    pub async fn website(&self) -> Website {
        self.store.get(WEBSITE_ID).await.unwrap()
    }
}
