//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::ProvisionError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// On-disk layout of the orchestrator's state
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Website records of the file store
    pub fn websites_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("websites"))
    }

    /// Stored connection credentials, one JSON file per reference
    pub fn credentials_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("credentials"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), ProvisionError> {
        self.websites_dir().create().await?;
        self.logs_dir().create().await?;

        let credentials = self.credentials_dir();
        credentials.create().await?;
        credentials.set_permissions_700().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/var/lib/pressbuild")
    }
}
