//! Progress store
//!
//! The single piece of state shared between provisioning runs and status
//! readers. Every write is a compare-and-set on the record's `version`.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::errors::ProvisionError;
use crate::models::website::Website;

/// Store trait for testability
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Latest committed snapshot of a website
    async fn get(&self, website_id: &str) -> Result<Website, ProvisionError>;

    /// Replace the record if its stored version still equals
    /// `previous_version`. Returns the committed record with its new version.
    async fn update(
        &self,
        website_id: &str,
        previous_version: u64,
        website: Website,
    ) -> Result<Website, ProvisionError>;

    /// Create a record; fails if the id is taken
    async fn insert(&self, website: Website) -> Result<Website, ProvisionError>;

    /// All records, for background maintenance
    async fn list(&self) -> Result<Vec<Website>, ProvisionError>;
}

/// Stamp the next version onto `website`
pub(crate) fn next_revision(mut website: Website, previous_version: u64) -> Website {
    website.version = previous_version + 1;
    website.updated_at = Utc::now();
    website
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    websites: RwLock<HashMap<String, Website>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn get(&self, website_id: &str) -> Result<Website, ProvisionError> {
        let websites = self.websites.read().unwrap_or_else(|e| e.into_inner());
        websites
            .get(website_id)
            .cloned()
            .ok_or_else(|| ProvisionError::NotFound(format!("website {}", website_id)))
    }

    async fn update(
        &self,
        website_id: &str,
        previous_version: u64,
        website: Website,
    ) -> Result<Website, ProvisionError> {
        let mut websites = self.websites.write().unwrap_or_else(|e| e.into_inner());
        let current = websites
            .get(website_id)
            .ok_or_else(|| ProvisionError::NotFound(format!("website {}", website_id)))?;

        if current.version != previous_version {
            return Err(ProvisionError::Conflict {
                website_id: website_id.to_string(),
                expected: previous_version,
                found: current.version,
            });
        }

        let committed = next_revision(website, previous_version);
        websites.insert(website_id.to_string(), committed.clone());
        Ok(committed)
    }

    async fn insert(&self, website: Website) -> Result<Website, ProvisionError> {
        let mut websites = self.websites.write().unwrap_or_else(|e| e.into_inner());
        if websites.contains_key(&website.id) {
            return Err(ProvisionError::AlreadyExists(website.id.clone()));
        }
        websites.insert(website.id.clone(), website.clone());
        Ok(website)
    }

    async fn list(&self) -> Result<Vec<Website>, ProvisionError> {
        let websites = self.websites.read().unwrap_or_else(|e| e.into_inner());
        Ok(websites.values().cloned().collect())
    }
}
