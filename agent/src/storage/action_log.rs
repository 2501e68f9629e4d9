//! Durable log of operation events

use tokio::sync::Mutex;
use tracing::warn;

use crate::errors::StoreError;
use crate::filesys::file::File;
use crate::models::operation::{OperationEvent, OperationEventType};

/// Append-only JSON lines log of lifecycle events.
///
/// `pull.progress` events are high volume and never recorded.
pub struct ActionLog {
    file: File,
    lock: Mutex<()>,
}

impl ActionLog {
    pub fn new(file: File) -> Self {
        Self {
            file,
            lock: Mutex::new(()),
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Append an event unless it is pull progress
    pub async fn record(&self, event: &OperationEvent) -> Result<(), StoreError> {
        if event.event_type == OperationEventType::PullProgress {
            return Ok(());
        }

        let line = serde_json::to_string(event)?;
        let _guard = self.lock.lock().await;
        self.file.append_line(&line).await
    }

    /// Like [`ActionLog::record`], logging instead of returning failures
    pub async fn record_or_warn(&self, event: &OperationEvent) {
        if let Err(e) = self.record(event).await {
            warn!(
                "Failed to record {} event of operation {}: {}",
                event.event_type.as_str(),
                event.operation_id,
                e
            );
        }
    }
}
