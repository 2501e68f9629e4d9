//! Store operation orchestrator
//!
//! Accepts install, redeploy and uninstall requests, runs them detached on the
//! [`OperationRunner`] and reports every phase through the [`EventBus`].
//!
//! Install / redeploy: start, resolve, validate, render (8), pull-images
//! (15 to 80), compose-up (85), finalize (95), complete (100).
//!
//! Uninstall: start, compose-down (35), cleanup (80), complete.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::deploy::compose::{ComposeMaterializer, MaterializeRequest, MaterializedStack};
use crate::deploy::digest::{DigestResolver, ImageDigestState};
use crate::deploy::engine::ContainerEngine;
use crate::deploy::fsm::{clamp_percent, OperationTransition};
use crate::deploy::pull::{pull_images, PullUpdate};
use crate::deploy::runner::OperationRunner;
use crate::errors::StoreError;
use crate::events::bus::{EventBus, Subscription};
use crate::filesys::file::File;
use crate::models::operation::{
    Operation, OperationAction, OperationEvent, OperationEventType, OperationRequest,
    OperationStep,
};
use crate::models::stack::{InstalledStack, StackStatus};
use crate::models::template::AppTemplate;
use crate::storage::action_log::ActionLog;
use crate::storage::operations::OperationStore;
use crate::storage::stacks::StackRepository;
use crate::templates::TemplateResolver;
use crate::utils::{generate_uuid, sanitize_stack_name};

const RESOLVE_PROGRESS: u8 = 3;
const VALIDATE_PROGRESS: u8 = 5;
const RENDER_PROGRESS: u8 = 8;
const PULL_START_PROGRESS: f64 = 15.0;
const PULL_PROGRESS_SPAN: f64 = 65.0;
const COMPOSE_UP_PROGRESS: u8 = 85;
const FINALIZE_PROGRESS: u8 = 95;
const COMPOSE_DOWN_PROGRESS: u8 = 35;
const CLEANUP_PROGRESS: u8 = 80;

/// Message recorded for operations cut short by a restart
pub const INTERRUPTED_MESSAGE: &str = "interrupted by agent restart";

/// Collaborators of the orchestrator
pub struct Components {
    pub templates: Arc<dyn TemplateResolver>,
    pub stacks: Arc<dyn StackRepository>,
    pub engine: Arc<dyn ContainerEngine>,
    pub operations: Arc<OperationStore>,
    pub bus: Arc<EventBus>,
    pub action_log: Arc<ActionLog>,
    pub materializer: ComposeMaterializer,
    pub digests: DigestResolver,
    pub runner: OperationRunner,
}

/// Outcome of an update check
#[derive(Debug, Clone)]
pub struct UpdateCheck {
    pub stack: InstalledStack,
    pub image: Option<ImageDigestState>,
    pub checked_at: DateTime<Utc>,
}

/// Per-run bookkeeping
struct Workflow {
    operation: Operation,

    /// The stack row was moved into a transitional status by this run
    stack_marked: bool,
}

/// Resolved inputs of an install or redeploy
struct DeployPlan {
    template: AppTemplate,
    existing: Option<InstalledStack>,
    env: BTreeMap<String, String>,
    web_ui_port: Option<u16>,
    display_name: Option<String>,
}

/// Store operation orchestrator
pub struct StoreOrchestrator {
    templates: Arc<dyn TemplateResolver>,
    stacks: Arc<dyn StackRepository>,
    engine: Arc<dyn ContainerEngine>,
    operations: Arc<OperationStore>,
    bus: Arc<EventBus>,
    action_log: Arc<ActionLog>,
    materializer: ComposeMaterializer,
    digests: DigestResolver,
    runner: OperationRunner,
}

impl StoreOrchestrator {
    pub fn new(components: Components) -> Self {
        Self {
            templates: components.templates,
            stacks: components.stacks,
            engine: components.engine,
            operations: components.operations,
            bus: components.bus,
            action_log: components.action_log,
            materializer: components.materializer,
            digests: components.digests,
            runner: components.runner,
        }
    }

    /// Accept a lifecycle request and return its operation id.
    ///
    /// The queued record is persisted before returning; the workflow runs in
    /// the background. Validation failures surface as a failed operation.
    pub async fn start_operation(
        self: &Arc<Self>,
        app_id: &str,
        action: OperationAction,
        request: OperationRequest,
    ) -> Result<String, StoreError> {
        let app_id = app_id.trim();
        if app_id.is_empty() {
            return Err(StoreError::ValidationError("App id is required".to_string()));
        }

        let operation = Operation::new(generate_uuid(), app_id, action, &request);
        self.operations.save(&operation).await?;

        let env_keys: Vec<&String> = request.env.keys().collect();
        info!(
            "Queued {} of {} as operation {} (env keys: {:?})",
            action, app_id, operation.id, env_keys
        );

        let id = operation.id.clone();
        let this = Arc::clone(self);
        self.runner.spawn(app_id, async move {
            this.run(operation, request).await;
        });

        Ok(id)
    }

    /// Current record of an operation
    pub fn get_operation(&self, operation_id: &str) -> Option<Operation> {
        self.operations.get(operation_id)
    }

    /// Subscribe to an operation's events, replaying the latest one
    pub fn subscribe<F>(&self, operation_id: &str, on_event: F) -> Subscription
    where
        F: Fn(&OperationEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(operation_id, on_event)
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Workflows currently executing
    pub fn running_operations(&self) -> usize {
        self.runner.running()
    }

    /// All stack records
    pub async fn list_stacks(&self) -> Result<Vec<InstalledStack>, StoreError> {
        self.stacks.list().await
    }

    /// Compare local and registry digests of an installed app and store the result
    pub async fn check_app_update(&self, app_id: &str) -> Result<UpdateCheck, StoreError> {
        let stack = self
            .stacks
            .find(app_id)
            .await?
            .filter(|s| s.status.is_active())
            .ok_or_else(|| StoreError::NotFound(format!("App {} is not installed", app_id)))?;

        let image = self.digests.resolve_store_app_update_state(&stack).await;
        let checked_at = Utc::now();

        let state = image.clone();
        let stack = self
            .stacks
            .update(
                app_id,
                Box::new(move |stack: &mut InstalledStack| {
                    stack.is_up_to_date = state.as_ref().map(|s| !s.update_available);
                    stack.local_digest = state.as_ref().and_then(|s| s.local_digest.clone());
                    stack.remote_digest = state.as_ref().and_then(|s| s.remote_digest.clone());
                    stack.last_update_check = Some(checked_at);
                }),
            )
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("App {} is not installed", app_id)))?;

        debug!(
            "Update check for {}: up to date = {:?}",
            app_id, stack.is_up_to_date
        );

        Ok(UpdateCheck {
            stack,
            image,
            checked_at,
        })
    }

    /// Fail operations and stacks left mid-flight by a previous process.
    ///
    /// Returns the number of operations marked failed.
    pub async fn recover_interrupted(&self) -> Result<usize, StoreError> {
        let mut recovered = 0;
        for mut operation in self.operations.list() {
            if operation.status.is_terminal() {
                continue;
            }
            operation.process(OperationTransition::Fail(INTERRUPTED_MESSAGE.to_string()))?;
            self.operations.save(&operation).await?;
            self.emit(
                OperationEvent::from_operation(OperationEventType::Failed, &operation)
                    .with_message(INTERRUPTED_MESSAGE),
            )
            .await;
            recovered += 1;
        }

        for stack in self.stacks.list().await? {
            if stack.status.is_transitional() {
                warn!(
                    "Stack {} was left {}, marking error",
                    stack.app_id,
                    stack.status.as_str()
                );
                self.set_stack_status(&stack.app_id, StackStatus::Error).await?;
            }
        }

        if recovered > 0 {
            warn!("Marked {} interrupted operations as failed", recovered);
        }
        Ok(recovered)
    }

    async fn run(&self, operation: Operation, request: OperationRequest) {
        let mut workflow = Workflow {
            operation,
            stack_marked: false,
        };

        let result = match self.begin(&mut workflow.operation).await {
            Ok(()) => match workflow.operation.action {
                OperationAction::Install | OperationAction::Redeploy => {
                    self.deploy(&mut workflow, &request).await
                }
                OperationAction::Uninstall => self.uninstall(&mut workflow, &request).await,
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => self.complete(&mut workflow.operation).await,
            Err(e) => self.fail(&mut workflow, e).await,
        }
    }

    async fn begin(&self, operation: &mut Operation) -> Result<(), StoreError> {
        operation.process(OperationTransition::Start)?;
        self.operations.save(operation).await?;
        self.emit(
            OperationEvent::from_operation(OperationEventType::Started, operation).with_message(
                format!("Starting {} of {}", operation.action, operation.app_id),
            ),
        )
        .await;
        Ok(())
    }

    async fn complete(&self, operation: &mut Operation) {
        if let Err(e) = operation.process(OperationTransition::Complete) {
            error!("Failed to complete operation {}: {}", operation.id, e);
            return;
        }
        if let Err(e) = self.operations.save(operation).await {
            error!("Failed to persist operation {}: {}", operation.id, e);
        }

        info!("{} of {} completed", operation.action, operation.app_id);
        self.emit(
            OperationEvent::from_operation(OperationEventType::Completed, operation)
                .with_message(format!("{} completed", operation.action)),
        )
        .await;
    }

    async fn fail(&self, workflow: &mut Workflow, cause: StoreError) {
        let operation = &mut workflow.operation;
        let message = cause.to_string();
        error!(
            "{} of {} failed at {}: {}",
            operation.action, operation.app_id, operation.current_step, message
        );

        if workflow.stack_marked {
            if let Err(e) = self.set_stack_status(&operation.app_id, StackStatus::Error).await {
                error!("Failed to mark stack {} as error: {}", operation.app_id, e);
            }
        }

        if let Err(e) = operation.process(OperationTransition::Fail(message.clone())) {
            error!("Failed to fail operation {}: {}", operation.id, e);
            return;
        }
        if let Err(e) = self.operations.save(operation).await {
            error!("Failed to persist operation {}: {}", operation.id, e);
        }

        self.emit(
            OperationEvent::from_operation(OperationEventType::Failed, operation)
                .with_message(message),
        )
        .await;
    }

    async fn deploy(
        &self,
        workflow: &mut Workflow,
        request: &OperationRequest,
    ) -> Result<(), StoreError> {
        self.advance(&mut workflow.operation, OperationStep::Resolve, RESOLVE_PROGRESS)
            .await?;
        let (template, existing) = self.resolve(&workflow.operation).await?;

        self.advance(&mut workflow.operation, OperationStep::Validate, VALIDATE_PROGRESS)
            .await?;
        let plan = self
            .validate(&workflow.operation, template, existing, request)
            .await?;

        self.advance(&mut workflow.operation, OperationStep::Render, RENDER_PROGRESS)
            .await?;
        let stack = self.render(workflow, &plan).await?;

        self.advance(
            &mut workflow.operation,
            OperationStep::PullImages,
            PULL_START_PROGRESS as u8,
        )
        .await?;
        self.pull(&mut workflow.operation, &stack).await?;

        self.advance(&mut workflow.operation, OperationStep::ComposeUp, COMPOSE_UP_PROGRESS)
            .await?;
        self.engine
            .compose_up(&stack.compose_path, &stack.env_path, &stack.stack_name)
            .await?;

        self.advance(&mut workflow.operation, OperationStep::Finalize, FINALIZE_PROGRESS)
            .await?;
        self.finalize(&workflow.operation, plan, stack).await
    }

    async fn resolve(
        &self,
        operation: &Operation,
    ) -> Result<(AppTemplate, Option<InstalledStack>), StoreError> {
        let template = self
            .templates
            .find_template(&operation.app_id)
            .await?
            .ok_or_else(|| {
                StoreError::NotFound(format!("No template found for app: {}", operation.app_id))
            })?;

        let existing = self.stacks.find(&operation.app_id).await?;

        if operation.action == OperationAction::Redeploy
            && !existing.as_ref().is_some_and(|s| s.status.is_active())
        {
            return Err(StoreError::ValidationError(format!(
                "App {} is not installed",
                operation.app_id
            )));
        }

        Ok((template, existing))
    }

    async fn validate(
        &self,
        operation: &Operation,
        template: AppTemplate,
        existing: Option<InstalledStack>,
        request: &OperationRequest,
    ) -> Result<DeployPlan, StoreError> {
        let declared = template.declared_keys();

        let unknown: Vec<&str> = request
            .env
            .keys()
            .map(String::as_str)
            .filter(|key| !declared.contains(key))
            .collect();
        if !unknown.is_empty() {
            return Err(StoreError::ValidationError(format!(
                "Unknown environment variables: {}",
                unknown.join(", ")
            )));
        }

        if let Some((key, _)) = request
            .env
            .iter()
            .find(|(_, value)| value.contains(['\n', '\r']))
        {
            return Err(StoreError::ValidationError(format!(
                "Environment variable {} contains a line break",
                key
            )));
        }

        let redeploy = operation.action == OperationAction::Redeploy;
        let mut env = template.env_defaults();
        if let Some(stack) = existing.as_ref().filter(|_| redeploy) {
            env.extend(
                stack
                    .env
                    .iter()
                    .filter(|(key, _)| declared.contains(key.as_str()))
                    .map(|(key, value)| (key.clone(), value.clone())),
            );
        }
        env.extend(request.env.clone());

        let requested_port = match request.web_ui_port {
            Some(port) => Some(validate_port(port)?),
            None if redeploy => existing.as_ref().and_then(|s| s.web_ui_port),
            None => None,
        };

        if let Some(port) = requested_port {
            if let Some(holder) = self
                .stacks
                .find_by_web_ui_port(port, Some(&operation.app_id))
                .await?
            {
                return Err(StoreError::Conflict(format!(
                    "Port {} is already used by {}",
                    port, holder.app_id
                )));
            }
        }

        let display_name = request
            .display_name
            .clone()
            .or_else(|| existing.as_ref().and_then(|s| s.display_name.clone()));

        Ok(DeployPlan {
            template,
            existing,
            env,
            web_ui_port: requested_port,
            display_name,
        })
    }

    async fn render(
        &self,
        workflow: &mut Workflow,
        plan: &DeployPlan,
    ) -> Result<MaterializedStack, StoreError> {
        let app_id = workflow.operation.app_id.clone();

        if plan.existing.is_some() {
            let status = match workflow.operation.action {
                OperationAction::Redeploy => StackStatus::Updating,
                _ => StackStatus::Installing,
            };
            let port = plan.web_ui_port;
            self.stacks
                .update(
                    &app_id,
                    Box::new(move |stack: &mut InstalledStack| {
                        stack.status = status;
                        stack.web_ui_port = port;
                        stack.updated_at = Utc::now();
                    }),
                )
                .await?;
            workflow.stack_marked = true;
        }

        let stack_name = plan
            .existing
            .as_ref()
            .map(|s| s.stack_name.clone())
            .unwrap_or_else(|| sanitize_stack_name(&app_id));

        let mut stack = self
            .materializer
            .materialize(MaterializeRequest {
                app_id: &app_id,
                stack_name: &stack_name,
                source: &plan.template.source,
                env: &plan.env,
                web_ui_port: plan.web_ui_port,
                primary_service: plan.template.primary_service.as_deref(),
            })
            .await?;

        // A detected port is only recorded if no other app holds it
        if plan.web_ui_port.is_none() {
            if let Some(port) = stack.web_ui_port {
                if let Some(holder) = self.stacks.find_by_web_ui_port(port, Some(&app_id)).await? {
                    warn!(
                        "Detected port {} of {} is used by {}, not recording it",
                        port, app_id, holder.app_id
                    );
                    stack.web_ui_port = None;
                }
            }
        }

        Ok(stack)
    }

    async fn pull(
        &self,
        operation: &mut Operation,
        stack: &MaterializedStack,
    ) -> Result<(), StoreError> {
        let images = self.engine.resolve_images(&stack.compose_path).await?;
        info!("Pulling {} images for {}", images.len(), operation.app_id);

        let operations = &self.operations;
        let bus = &self.bus;
        pull_images(self.engine.as_ref(), &images, |update: PullUpdate<'_>| {
            let overall = PULL_START_PROGRESS + update.phase_percent * PULL_PROGRESS_SPAN / 100.0;
            if let Err(e) = operation.process(OperationTransition::Progress(clamp_percent(overall))) {
                warn!("Dropping pull progress: {}", e);
                return;
            }
            operations.update_live(operation);

            let event = OperationEvent::from_operation(OperationEventType::PullProgress, operation)
                .with_image(update.image);
            let event = match update.event {
                Some(pull) => event
                    .with_docker_status(pull.status.clone())
                    .with_progress_detail(pull.progress_detail.clone()),
                None => event.with_docker_status("Pull complete"),
            };
            bus.publish(event);
        })
        .await?;

        for image in &images {
            self.digests.invalidate_local(image);
        }
        self.operations.save(operation).await
    }

    async fn finalize(
        &self,
        operation: &Operation,
        plan: DeployPlan,
        stack: MaterializedStack,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let previous = plan.existing.as_ref();

        let installed_at = previous
            .filter(|s| s.status != StackStatus::NotInstalled)
            .and_then(|s| s.installed_at)
            .unwrap_or(now);

        let record = InstalledStack {
            app_id: operation.app_id.clone(),
            template_name: plan.template.name.clone(),
            stack_name: stack.stack_name,
            compose_path: stack.compose_path,
            env_path: stack.env_path,
            status: StackStatus::Installed,
            web_ui_port: stack.web_ui_port,
            env: plan.env,
            display_name: plan.display_name,
            icon_url: previous
                .and_then(|s| s.icon_url.clone())
                .or_else(|| plan.template.icon_url.clone()),
            installed_at: Some(installed_at),
            updated_at: now,
            is_up_to_date: None,
            local_digest: None,
            remote_digest: None,
            last_update_check: None,
        };

        self.stacks.upsert(record).await
    }

    async fn uninstall(
        &self,
        workflow: &mut Workflow,
        request: &OperationRequest,
    ) -> Result<(), StoreError> {
        let app_id = workflow.operation.app_id.clone();

        let Some(stack) = self
            .stacks
            .find(&app_id)
            .await?
            .filter(|s| s.status.is_active())
        else {
            info!("App {} is not installed, nothing to uninstall", app_id);
            return Ok(());
        };

        self.set_stack_status(&app_id, StackStatus::Uninstalling).await?;
        workflow.stack_marked = true;

        self.advance(&mut workflow.operation, OperationStep::ComposeDown, COMPOSE_DOWN_PROGRESS)
            .await?;
        let env_file = File::new(&stack.env_path);
        let env_path = if env_file.exists().await {
            Some(stack.env_path.as_path())
        } else {
            None
        };
        self.engine
            .compose_down(
                &stack.compose_path,
                env_path,
                &stack.stack_name,
                request.remove_volumes,
            )
            .await?;

        self.advance(&mut workflow.operation, OperationStep::Cleanup, CLEANUP_PROGRESS)
            .await?;
        self.set_stack_status(&app_id, StackStatus::NotInstalled).await
    }

    async fn advance(
        &self,
        operation: &mut Operation,
        step: OperationStep,
        progress: u8,
    ) -> Result<(), StoreError> {
        operation.process(OperationTransition::Advance { step, progress })?;
        self.operations.save(operation).await?;

        debug!("Operation {} at {} ({}%)", operation.id, step, operation.progress_percent);
        self.emit(
            OperationEvent::from_operation(OperationEventType::Step, operation)
                .with_message(step_message(step)),
        )
        .await;
        Ok(())
    }

    async fn set_stack_status(&self, app_id: &str, status: StackStatus) -> Result<(), StoreError> {
        self.stacks
            .update(
                app_id,
                Box::new(move |stack: &mut InstalledStack| {
                    stack.status = status;
                    stack.updated_at = Utc::now();
                }),
            )
            .await?;
        Ok(())
    }

    async fn emit(&self, event: OperationEvent) {
        self.action_log.record_or_warn(&event).await;
        self.bus.publish(event);
    }
}

fn validate_port(port: u32) -> Result<u16, StoreError> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| StoreError::ValidationError(format!("Invalid web UI port: {}", port)))
}

fn step_message(step: OperationStep) -> &'static str {
    match step {
        OperationStep::Queued => "Waiting to start",
        OperationStep::Start => "Starting",
        OperationStep::Resolve => "Resolving template",
        OperationStep::Validate => "Validating request",
        OperationStep::Render => "Rendering compose files",
        OperationStep::PullImages => "Pulling images",
        OperationStep::ComposeUp => "Starting containers",
        OperationStep::Finalize => "Saving stack",
        OperationStep::ComposeDown => "Stopping containers",
        OperationStep::Cleanup => "Cleaning up",
        OperationStep::Complete => "Done",
    }
}
