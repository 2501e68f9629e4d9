//! Operation record storage

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::errors::StoreError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::operation::Operation;

/// Operation records, kept in memory and persisted one JSON file each.
///
/// Pull progress is applied with [`OperationStore::update_live`] from inside
/// synchronous callbacks; phase boundaries go through [`OperationStore::save`].
pub struct OperationStore {
    dir: Dir,
    operations: RwLock<HashMap<String, Operation>>,
}

impl OperationStore {
    /// Create an empty store persisting under `dir`
    pub fn new(dir: Dir) -> Self {
        Self {
            dir,
            operations: RwLock::new(HashMap::new()),
        }
    }

    /// Load every persisted operation into memory.
    ///
    /// Unreadable records are skipped.
    pub async fn load(dir: Dir) -> Result<Self, StoreError> {
        let store = Self::new(dir);

        let mut loaded = HashMap::new();
        for path in store.dir.list_files().await? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_operation(&path).await {
                Ok(operation) => {
                    loaded.insert(operation.id.clone(), operation);
                }
                Err(e) => warn!("Skipping operation record {}: {}", path.display(), e),
            }
        }
        debug!("Loaded {} operation records", loaded.len());

        *store.operations.write().unwrap_or_else(|e| e.into_inner()) = loaded;
        Ok(store)
    }

    /// Replace the in-memory record without touching disk
    pub fn update_live(&self, operation: &Operation) {
        let mut operations = self.operations.write().unwrap_or_else(|e| e.into_inner());
        operations.insert(operation.id.clone(), operation.clone());
    }

    /// Store the record in memory and on disk
    pub async fn save(&self, operation: &Operation) -> Result<(), StoreError> {
        self.update_live(operation);
        self.dir
            .file(&format!("{}.json", operation.id))
            .write_json_atomic(operation)
            .await
    }

    /// Current record of an operation
    pub fn get(&self, operation_id: &str) -> Option<Operation> {
        let operations = self.operations.read().unwrap_or_else(|e| e.into_inner());
        operations.get(operation_id).cloned()
    }

    /// All records, oldest first
    pub fn list(&self) -> Vec<Operation> {
        let operations = self.operations.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<Operation> = operations.values().cloned().collect();
        list.sort_by_key(|op| op.created_at);
        list
    }
}

async fn read_operation(path: &Path) -> Result<Operation, StoreError> {
    File::new(path).read_json().await
}
