//! Server state

use std::sync::Arc;

use crate::deploy::orchestrator::StoreOrchestrator;

/// Server state shared across handlers
pub struct ServerState {
    pub orchestrator: Arc<StoreOrchestrator>,
}

impl ServerState {
    pub fn new(orchestrator: Arc<StoreOrchestrator>) -> Self {
        Self { orchestrator }
    }
}
