//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::StoreError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for the agent
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

    /// Installed stack records
    pub fn stacks_file(&self) -> File {
        File::new(self.base_dir.join("stacks.json"))
    }

    /// Template catalog
    pub fn templates_file(&self) -> File {
        File::new(self.base_dir.join("templates.json"))
    }

    /// Custom app definitions, one JSON file per app
    pub fn custom_templates_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("custom"))
    }

    /// Rendered compose stacks, one directory per app
    pub fn stacks_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("stacks"))
    }

    /// Operation records, one JSON file per operation
    pub fn operations_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("operations"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Durable action log of operation events
    pub fn action_log_file(&self) -> File {
        self.logs_dir().file("actions.jsonl")
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), StoreError> {
        self.custom_templates_dir().create().await?;
        self.stacks_dir().create().await?;
        self.operations_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/stackd");

        #[cfg(not(target_os = "linux"))]
        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stackd");

        Self::new(base_dir)
    }
}

#[cfg(not(target_os = "linux"))]
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}
