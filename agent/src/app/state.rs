//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::deploy::compose::ComposeMaterializer;
use crate::deploy::digest::DigestResolver;
use crate::deploy::engine::{ContainerEngine, DockerEngine};
use crate::deploy::orchestrator::{Components, StoreOrchestrator};
use crate::deploy::runner::OperationRunner;
use crate::errors::StoreError;
use crate::events::bus::EventBus;
use crate::storage::action_log::ActionLog;
use crate::storage::operations::OperationStore;
use crate::storage::stacks::JsonStackRepository;
use crate::templates::FileTemplateResolver;

/// Main application state
pub struct AppState {
    pub orchestrator: Arc<StoreOrchestrator>,
}

impl AppState {
    /// Initialize application state with the docker CLI engine
    pub async fn init(options: &AppOptions) -> Result<Self, StoreError> {
        let engine = Arc::new(DockerEngine::new(&options.engine.docker_bin));
        Self::init_with_engine(options, engine).await
    }

    /// Initialize application state on top of a given engine.
    ///
    /// Operations and stacks left mid-flight by a previous run are failed.
    pub async fn init_with_engine(
        options: &AppOptions,
        engine: Arc<dyn ContainerEngine>,
    ) -> Result<Self, StoreError> {
        info!("Initializing application state...");

        let layout = &options.layout;
        layout.setup().await?;

        let templates = Arc::new(FileTemplateResolver::new(
            layout.templates_file(),
            layout.custom_templates_dir(),
        ));
        let stacks = Arc::new(JsonStackRepository::open(layout.stacks_file()).await?);
        let operations = Arc::new(OperationStore::load(layout.operations_dir()).await?);

        let orchestrator = Arc::new(StoreOrchestrator::new(Components {
            templates,
            stacks,
            engine: engine.clone(),
            operations,
            bus: Arc::new(EventBus::new(options.operations.event_cache_capacity)),
            action_log: Arc::new(ActionLog::new(layout.action_log_file())),
            materializer: ComposeMaterializer::new(layout.stacks_dir())?,
            digests: DigestResolver::with_ttls(
                engine,
                options.engine.local_digest_ttl,
                options.engine.remote_digest_ttl,
            ),
            runner: OperationRunner::new(options.operations.max_concurrent),
        }));

        orchestrator.recover_interrupted().await?;

        Ok(Self { orchestrator })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        info!("Shutting down application state...");
        let running = self.orchestrator.running_operations();
        if running > 0 {
            info!(
                "{} operations still running, they will be marked interrupted on next start",
                running
            );
        }
        Ok(())
    }
}
