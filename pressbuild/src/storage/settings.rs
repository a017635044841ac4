//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::deploy::blueprint::BlueprintOptions;
use crate::deploy::fsm::FsmSettings;
use crate::deploy::orchestrator::OrchestratorSettings;
use crate::errors::ProvisionError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::session::ssh::SshOptions;
use crate::utils::CooldownOptions;

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Also write daily log files under the storage logs directory
    #[serde(default)]
    pub log_to_file: bool,

    /// Where website records live
    #[serde(default)]
    pub storage_backend: StorageBackend,

    /// Local control server
    #[serde(default)]
    pub server: ServerSettings,

    /// Run orchestration
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// SSH client
    #[serde(default)]
    pub ssh: SshSettings,

    /// WordPress and certificate options
    #[serde(default)]
    pub wordpress: BlueprintOptions,

    /// Failure notifications
    #[serde(default)]
    pub notifier: NotifierSettings,

    /// Upper bound for graceful shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            storage_backend: StorageBackend::default(),
            server: ServerSettings::default(),
            orchestrator: OrchestratorConfig::default(),
            ssh: SshSettings::default(),
            wordpress: BlueprintOptions::default(),
            notifier: NotifierSettings::default(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Settings {
    /// Load settings from `file`; defaults when the file does not exist
    pub async fn load(file: &File) -> Result<Self, ProvisionError> {
        if !file.exists().await {
            info!("No settings file at {}, using defaults", file.path().display());
            return Ok(Self::default());
        }
        file.read_json().await.map_err(|e| {
            ProvisionError::ConfigError(format!("invalid settings file {}: {}", file.path().display(), e))
        })
    }
}

/// Website record storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// One JSON document per website under the storage directory
    #[default]
    File,
    /// Process memory; records are lost on exit
    Memory,
}

/// Local HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    7420
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Run orchestration knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Worker identity in run leases; generated when absent
    #[serde(default)]
    pub worker_id: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_retries")]
    pub connect_retries: u32,

    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    #[serde(default = "default_retries")]
    pub step_retries: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_secs: u64,

    /// Ceiling for one phase, retries included
    #[serde(default = "default_phase_timeout")]
    pub phase_timeout_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,

    /// How often the lease reaper scans for abandoned runs
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_retries() -> u32 {
    2
}

fn default_step_timeout() -> u64 {
    600
}

fn default_retry_base_delay() -> u64 {
    5
}

fn default_retry_max_delay() -> u64 {
    60
}

fn default_phase_timeout() -> u64 {
    45 * 60
}

fn default_probe_timeout() -> u64 {
    30
}

fn default_lease_ttl() -> u64 {
    120
}

fn default_reaper_interval() -> u64 {
    30
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            connect_timeout_secs: default_connect_timeout(),
            connect_retries: default_retries(),
            step_timeout_secs: default_step_timeout(),
            step_retries: default_retries(),
            retry_base_delay_secs: default_retry_base_delay(),
            retry_max_delay_secs: default_retry_max_delay(),
            phase_timeout_secs: default_phase_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            lease_ttl_secs: default_lease_ttl(),
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

impl OrchestratorConfig {
    pub fn to_settings(&self) -> OrchestratorSettings {
        let defaults = OrchestratorSettings::default();
        let backoff = CooldownOptions {
            base_delay: Duration::from_secs(self.retry_base_delay_secs),
            max_delay: Duration::from_secs(self.retry_max_delay_secs),
            multiplier: 2.0,
        };
        OrchestratorSettings {
            worker_id: self.worker_id.clone().unwrap_or(defaults.worker_id),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            connect_retries: self.connect_retries,
            connect_backoff: defaults.connect_backoff,
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            lease_ttl: Duration::from_secs(self.lease_ttl_secs.max(3)),
            notify_timeout: defaults.notify_timeout,
            fsm: FsmSettings {
                step_timeout: Duration::from_secs(self.step_timeout_secs),
                retry_count: self.step_retries,
                retry_backoff: backoff,
                phase_timeout: Duration::from_secs(self.phase_timeout_secs),
            },
        }
    }
}

/// SSH client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,

    #[serde(default = "default_sshpass_binary")]
    pub sshpass_binary: String,

    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_keepalive_count")]
    pub keepalive_count_max: u32,

    #[serde(default = "default_host_key_checking")]
    pub strict_host_key_checking: String,

    #[serde(default)]
    pub known_hosts_file: Option<PathBuf>,
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_sshpass_binary() -> String {
    "sshpass".to_string()
}

fn default_keepalive_interval() -> u64 {
    15
}

fn default_keepalive_count() -> u32 {
    4
}

fn default_host_key_checking() -> String {
    "accept-new".to_string()
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_binary: default_ssh_binary(),
            sshpass_binary: default_sshpass_binary(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_count_max: default_keepalive_count(),
            strict_host_key_checking: default_host_key_checking(),
            known_hosts_file: None,
        }
    }
}

impl SshSettings {
    pub fn to_options(&self) -> SshOptions {
        SshOptions {
            ssh_binary: self.ssh_binary.clone(),
            sshpass_binary: self.sshpass_binary.clone(),
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            keepalive_count_max: self.keepalive_count_max,
            strict_host_key_checking: self.strict_host_key_checking.clone(),
            known_hosts_file: self.known_hosts_file.clone(),
        }
    }
}

/// Failure notification settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifierSettings {
    /// Webhook receiving failure notices; notifications are off when unset
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: Settings = serde_json::from_value(serde_json::json!({
            "log_level": "debug",
            "server": {"port": 9000},
            "orchestrator": {"step_retries": 5, "worker_id": "worker-a"},
            "wordpress": {"admin_email": "ops@example.com", "certificate_staging": true}
        }))
        .unwrap();

        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.storage_backend, StorageBackend::File);
        assert_eq!(settings.wordpress.admin_user, "admin");
        assert!(settings.wordpress.certificate_staging);

        let orchestrator = settings.orchestrator.to_settings();
        assert_eq!(orchestrator.worker_id, "worker-a");
        assert_eq!(orchestrator.fsm.retry_count, 5);
        assert_eq!(orchestrator.fsm.phase_timeout, Duration::from_secs(2700));
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings::load(&File::new(tmp.path().join("settings.json")))
            .await
            .unwrap();
        assert!(settings.server.enabled);
        assert_eq!(settings.ssh.to_options().keepalive_count_max, 4);
    }

    #[tokio::test]
    async fn test_load_rejects_malformed_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = File::new(tmp.path().join("settings.json"));
        file.write_string("{not json").await.unwrap();
        assert!(matches!(Settings::load(&file).await, Err(ProvisionError::ConfigError(_))));
    }
}
