//! Durable progress store: one JSON document per website
//!
//! Writes go through a temporary file and a rename, so readers always see a
//! complete committed snapshot. Compare-and-set is serialized by an
//! in-process lock; workers in separate processes need a shared database
//! store instead.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::ProvisionError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::website::Website;
use crate::storage::store::{next_revision, ProgressStore};

pub struct JsonFileStore {
    dir: Dir,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open a store rooted at `dir`, creating it if needed
    pub async fn open(dir: Dir) -> Result<Self, ProvisionError> {
        dir.create().await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn file_for(&self, website_id: &str) -> Result<File, ProvisionError> {
        let valid = !website_id.is_empty()
            && website_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ProvisionError::NotFound(format!("website {}", website_id)));
        }
        Ok(self.dir.file(&format!("{}.json", website_id)))
    }

    async fn read(&self, file: &File, website_id: &str) -> Result<Website, ProvisionError> {
        if !file.exists().await {
            return Err(ProvisionError::NotFound(format!("website {}", website_id)));
        }
        file.read_json().await.map_err(|e| {
            ProvisionError::StorageError(format!("corrupt record for website {}: {}", website_id, e))
        })
    }
}

#[async_trait]
impl ProgressStore for JsonFileStore {
    async fn get(&self, website_id: &str) -> Result<Website, ProvisionError> {
        let file = self.file_for(website_id)?;
        self.read(&file, website_id).await
    }

    async fn update(
        &self,
        website_id: &str,
        previous_version: u64,
        website: Website,
    ) -> Result<Website, ProvisionError> {
        let file = self.file_for(website_id)?;
        let _guard = self.write_lock.lock().await;

        let current = self.read(&file, website_id).await?;
        if current.version != previous_version {
            return Err(ProvisionError::Conflict {
                website_id: website_id.to_string(),
                expected: previous_version,
                found: current.version,
            });
        }

        let committed = next_revision(website, previous_version);
        file.write_json(&committed).await?;
        debug!(website_id, version = committed.version, "Committed website record");
        Ok(committed)
    }

    async fn insert(&self, website: Website) -> Result<Website, ProvisionError> {
        let file = self.file_for(&website.id)?;
        let _guard = self.write_lock.lock().await;

        if file.exists().await {
            return Err(ProvisionError::AlreadyExists(website.id.clone()));
        }
        file.write_json(&website).await?;
        Ok(website)
    }

    async fn list(&self) -> Result<Vec<Website>, ProvisionError> {
        let mut websites = Vec::new();
        for path in self.dir.list_files().await? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match File::new(&path).read_json::<Website>().await {
                Ok(website) => websites.push(website),
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }
        Ok(websites)
    }
}
