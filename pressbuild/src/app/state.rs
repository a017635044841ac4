//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::authn::credentials::FileCredentialResolver;
use crate::deploy::blueprint::WordPressBlueprint;
use crate::deploy::orchestrator::{Orchestrator, Services};
use crate::errors::ProvisionError;
use crate::notify::webhook::WebhookNotifier;
use crate::notify::{NoopNotifier, Notifier};
use crate::session::ssh::SshConnector;
use crate::storage::json_store::JsonFileStore;
use crate::storage::settings::StorageBackend;
use crate::storage::store::{MemoryStore, ProgressStore};

/// Main application state
pub struct AppState {
    /// Website records
    pub store: Arc<dyn ProgressStore>,

    /// Run orchestration
    pub orchestrator: Orchestrator,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<Self, ProvisionError> {
        info!("Initializing application state...");

        let layout = &options.storage.layout;
        layout.setup().await?;

        let store: Arc<dyn ProgressStore> = match options.storage.backend {
            StorageBackend::File => Arc::new(JsonFileStore::open(layout.websites_dir()).await?),
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        };

        let notifier: Arc<dyn Notifier> = match &options.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url, options.orchestrator.notify_timeout)?),
            None => Arc::new(NoopNotifier),
        };

        let services = Services {
            store: store.clone(),
            credentials: Arc::new(FileCredentialResolver::new(layout.credentials_dir())),
            connector: Arc::new(SshConnector::new(options.ssh.clone())),
            blueprint: Arc::new(WordPressBlueprint::new(options.blueprint.clone())),
            notifier,
        };

        let orchestrator = Orchestrator::new(services, options.orchestrator.clone());
        info!(worker_id = %options.orchestrator.worker_id, "Orchestrator ready");

        Ok(Self { store, orchestrator })
    }

    /// Cancel active runs and wait for them to record their outcome
    pub async fn shutdown(&self, options: &AppOptions) -> Result<(), ProvisionError> {
        let remaining = self
            .orchestrator
            .shutdown(options.lifecycle.max_shutdown_delay)
            .await;
        if remaining > 0 {
            return Err(ProvisionError::ShutdownError(format!(
                "{} provisioning run(s) did not stop in time",
                remaining
            )));
        }
        Ok(())
    }
}
