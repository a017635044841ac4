//! Application configuration options

use std::time::Duration;

use crate::deploy::blueprint::BlueprintOptions;
use crate::deploy::orchestrator::OrchestratorSettings;
use crate::session::ssh::SshOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{Settings, StorageBackend};
use crate::workers::lease_reaper;

/// Main application options
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Enable local HTTP server
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Lease reaper worker options
    pub lease_reaper: lease_reaper::Options,

    /// Run orchestration settings
    pub orchestrator: OrchestratorSettings,

    /// SSH client options
    pub ssh: SshOptions,

    /// WordPress blueprint options
    pub blueprint: BlueprintOptions,

    /// Webhook for failure notices
    pub webhook_url: Option<String>,
}

impl AppOptions {
    /// Build options from a loaded settings file
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        Self {
            lifecycle: LifecycleOptions {
                max_shutdown_delay: Duration::from_secs(settings.shutdown_timeout_secs),
            },
            storage: StorageOptions {
                layout,
                backend: settings.storage_backend,
            },
            enable_server: settings.server.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            lease_reaper: lease_reaper::Options {
                interval: Duration::from_secs(settings.orchestrator.reaper_interval_secs),
            },
            orchestrator: settings.orchestrator.to_settings(),
            ssh: settings.ssh.to_options(),
            blueprint: settings.wordpress.clone(),
            webhook_url: settings.notifier.webhook_url.clone(),
        }
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown, active runs included
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Website record backend
    pub backend: StorageBackend,
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7420,
        }
    }
}
