//! Compare-and-set writes against the progress store on behalf of one run

use std::sync::Arc;

use tracing::debug;

use crate::errors::ProvisionError;
use crate::models::website::Website;
use crate::storage::store::ProgressStore;

/// Attempts before a write gives up against concurrent writers
const MAX_CAS_ATTEMPTS: u32 = 8;

/// Applies mutations to one website record with optimistic concurrency
#[derive(Clone)]
pub struct Recorder {
    store: Arc<dyn ProgressStore>,
    website_id: String,
    /// When set, every write requires this run to still hold the lease
    run_id: Option<String>,
}

impl Recorder {
    pub fn new(store: Arc<dyn ProgressStore>, website_id: &str) -> Self {
        Self {
            store,
            website_id: website_id.to_string(),
            run_id: None,
        }
    }

    /// Restrict writes to the holder of `run_id`'s lease
    pub fn for_run(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn website_id(&self) -> &str {
        &self.website_id
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub async fn snapshot(&self) -> Result<Website, ProvisionError> {
        self.store.get(&self.website_id).await
    }

    /// Read, mutate, compare-and-set; re-read and re-apply on conflict.
    ///
    /// `mutate` may run several times and must only depend on the record it
    /// is given.
    pub async fn update<F>(&self, mut mutate: F) -> Result<Website, ProvisionError>
    where
        F: FnMut(&mut Website) -> Result<(), ProvisionError> + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.store.get(&self.website_id).await?;
            self.ensure_lease(&current)?;

            let previous_version = current.version;
            let mut next = current;
            mutate(&mut next)?;

            match self.store.update(&self.website_id, previous_version, next).await {
                Ok(committed) => return Ok(committed),
                Err(ProvisionError::Conflict { found, .. }) if attempt < MAX_CAS_ATTEMPTS => {
                    debug!(
                        website_id = %self.website_id,
                        expected = previous_version,
                        found,
                        "Write conflict, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn ensure_lease(&self, website: &Website) -> Result<(), ProvisionError> {
        let Some(run_id) = &self.run_id else {
            return Ok(());
        };
        match &website.lease {
            Some(lease) if &lease.run_id == run_id => Ok(()),
            _ => Err(ProvisionError::Cancelled("run lease lost".to_string())),
        }
    }
}
