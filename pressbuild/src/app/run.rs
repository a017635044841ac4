//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::AppOptions;
use crate::app::state::AppState;
use crate::errors::ProvisionError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::lease_reaper;

/// Slack on top of the run drain delay for stopping the server and workers
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Run the orchestrator until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ProvisionError> {
    info!("Initializing pressbuild...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start pressbuild: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    // Shutdown
    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), ProvisionError> {
    let app_state = Arc::new(AppState::init(options).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    init_lease_reaper(
        options.lease_reaper.clone(),
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )
    .await?;

    if options.enable_server {
        init_server(options, app_state, shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    Ok(())
}

async fn init_lease_reaper(
    options: lease_reaper::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ProvisionError> {
    info!("Initializing lease reaper worker...");

    let store = app_state.store.clone();
    let handle = tokio::spawn(async move {
        lease_reaper::run(
            &options,
            store,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_lease_reaper_handle(handle)?;
    Ok(())
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ProvisionError> {
    info!("Initializing local HTTP server...");

    let server_state = ServerState::new(app_state.orchestrator.clone());
    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    options: AppOptions,
    app_state: Option<Arc<AppState>>,
    server_handle: Option<JoinHandle<Result<(), ProvisionError>>>,
    lease_reaper_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, options: AppOptions) -> Self {
        Self {
            shutdown_tx,
            options,
            app_state: None,
            server_handle: None,
            lease_reaper_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), ProvisionError> {
        if self.app_state.is_some() {
            return Err(ProvisionError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_lease_reaper_handle(&mut self, handle: JoinHandle<()>) -> Result<(), ProvisionError> {
        if self.lease_reaper_handle.is_some() {
            return Err(ProvisionError::ShutdownError("lease_reaper_handle already set".to_string()));
        }
        self.lease_reaper_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), ProvisionError>>,
    ) -> Result<(), ProvisionError> {
        if self.server_handle.is_some() {
            return Err(ProvisionError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProvisionError> {
        let _ = self.shutdown_tx.send(());

        let max_delay = self.options.lifecycle.max_shutdown_delay + SHUTDOWN_GRACE;
        match tokio::time::timeout(max_delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!("Shutdown timed out after {:?}, forcing shutdown...", max_delay);
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), ProvisionError> {
        info!("Shutting down pressbuild...");

        // 1. Server, so no new runs are accepted
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| ProvisionError::ShutdownError(e.to_string()))??;
        }

        // 2. Lease reaper
        if let Some(handle) = self.lease_reaper_handle.take() {
            handle.await.map_err(|e| ProvisionError::ShutdownError(e.to_string()))?;
        }

        // 3. Active runs
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown(&self.options).await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
