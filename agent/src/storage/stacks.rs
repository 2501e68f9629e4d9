//! Installed stack repository

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::StoreError;
use crate::filesys::file::File;
use crate::models::stack::InstalledStack;

/// In-place modification applied under the repository lock
pub type StackUpdate = Box<dyn FnOnce(&mut InstalledStack) + Send>;

/// CRUD over installed stacks, keyed by app id
#[async_trait]
pub trait StackRepository: Send + Sync {
    /// Stack of an app
    async fn find(&self, app_id: &str) -> Result<Option<InstalledStack>, StoreError>;

    /// All stacks, installed or not
    async fn list(&self) -> Result<Vec<InstalledStack>, StoreError>;

    /// Insert or replace a stack.
    ///
    /// Fails with `Conflict` if another active stack holds the same web UI port.
    async fn upsert(&self, stack: InstalledStack) -> Result<(), StoreError>;

    /// Modify an existing stack; `None` if the app has no record
    async fn update(
        &self,
        app_id: &str,
        apply: StackUpdate,
    ) -> Result<Option<InstalledStack>, StoreError>;

    /// Active stack claiming a web UI port, other than `exclude_app_id`
    async fn find_by_web_ui_port(
        &self,
        port: u16,
        exclude_app_id: Option<&str>,
    ) -> Result<Option<InstalledStack>, StoreError>;
}

/// Stack repository persisted as a single JSON file
pub struct JsonStackRepository {
    file: File,
    stacks: Mutex<BTreeMap<String, InstalledStack>>,
}

impl JsonStackRepository {
    /// Load the repository, starting empty if the file does not exist
    pub async fn open(file: File) -> Result<Self, StoreError> {
        let stacks: Vec<InstalledStack> = file.read_json_opt().await?.unwrap_or_default();
        debug!("Loaded {} stack records from {}", stacks.len(), file.path().display());

        Ok(Self {
            file,
            stacks: Mutex::new(stacks.into_iter().map(|s| (s.app_id.clone(), s)).collect()),
        })
    }

    async fn commit(
        &self,
        stacks: &mut BTreeMap<String, InstalledStack>,
        stack: InstalledStack,
    ) -> Result<(), StoreError> {
        if let Some(port) = stack.web_ui_port.filter(|_| stack.status.is_active()) {
            if let Some(holder) = stacks
                .values()
                .find(|s| s.app_id != stack.app_id && s.claims_port(port))
            {
                return Err(StoreError::Conflict(format!(
                    "Port {} is already used by {}",
                    port, holder.app_id
                )));
            }
        }

        let mut next = stacks.clone();
        next.insert(stack.app_id.clone(), stack);

        let rows: Vec<&InstalledStack> = next.values().collect();
        self.file.write_json_atomic(&rows).await?;

        *stacks = next;
        Ok(())
    }
}

#[async_trait]
impl StackRepository for JsonStackRepository {
    async fn find(&self, app_id: &str) -> Result<Option<InstalledStack>, StoreError> {
        Ok(self.stacks.lock().await.get(app_id).cloned())
    }

    async fn list(&self) -> Result<Vec<InstalledStack>, StoreError> {
        Ok(self.stacks.lock().await.values().cloned().collect())
    }

    async fn upsert(&self, stack: InstalledStack) -> Result<(), StoreError> {
        let mut stacks = self.stacks.lock().await;
        self.commit(&mut stacks, stack).await
    }

    async fn update(
        &self,
        app_id: &str,
        apply: StackUpdate,
    ) -> Result<Option<InstalledStack>, StoreError> {
        let mut stacks = self.stacks.lock().await;
        let Some(mut stack) = stacks.get(app_id).cloned() else {
            return Ok(None);
        };

        apply(&mut stack);
        self.commit(&mut stacks, stack.clone()).await?;
        Ok(Some(stack))
    }

    async fn find_by_web_ui_port(
        &self,
        port: u16,
        exclude_app_id: Option<&str>,
    ) -> Result<Option<InstalledStack>, StoreError> {
        let stacks = self.stacks.lock().await;
        Ok(stacks
            .values()
            .find(|s| Some(s.app_id.as_str()) != exclude_app_id && s.claims_port(port))
            .cloned())
    }
}
