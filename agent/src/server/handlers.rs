//! HTTP request handlers

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, Stream};
use store_api::{
    ErrorResponse, HealthResponse, StackListResponse, StackSummary, StartOperationRequest,
    StartOperationResponse, UpdateCheckResponse, VersionResponse,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::warn;

use crate::errors::StoreError;
use crate::events::bus::Subscription;
use crate::models::operation::{
    Operation, OperationAction, OperationEvent, OperationEventType, OperationRequest,
    OperationStatus,
};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error mapped onto a status code and JSON body
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::ValidationError(_) => StatusCode::BAD_REQUEST,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: version.name,
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        name: version.name,
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Installed stacks
pub async fn list_apps_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, ApiError> {
    let stacks: Vec<StackSummary> = state
        .orchestrator
        .list_stacks()
        .await?
        .into_iter()
        .map(|stack| StackSummary {
            app_id: stack.app_id,
            display_name: stack.display_name,
            status: stack.status.as_str().to_string(),
            web_ui_port: stack.web_ui_port,
            is_up_to_date: stack.is_up_to_date,
            updated_at: stack.updated_at,
        })
        .collect();

    let total = stacks.len();
    Ok(Json(StackListResponse { stacks, total }))
}

/// Start an install, redeploy or uninstall
pub async fn start_operation_handler(
    State(state): State<Arc<ServerState>>,
    Path(app_id): Path<String>,
    Json(body): Json<StartOperationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let action: OperationAction = body.action.parse().map_err(StoreError::ValidationError)?;

    let request = OperationRequest {
        display_name: body.display_name,
        env: body.env.unwrap_or_default(),
        web_ui_port: body.web_ui_port,
        remove_volumes: body.remove_volumes.unwrap_or(false),
    };

    let operation_id = state
        .orchestrator
        .start_operation(&app_id, action, request)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartOperationResponse { operation_id }),
    ))
}

/// Current operation record
pub async fn get_operation_handler(
    State(state): State<Arc<ServerState>>,
    Path(operation_id): Path<String>,
) -> Result<Json<Operation>, ApiError> {
    state
        .orchestrator
        .get_operation(&operation_id)
        .map(Json)
        .ok_or_else(|| StoreError::NotFound(format!("Operation {}", operation_id)).into())
}

/// Server-sent events of an operation, ending after the terminal event
pub async fn operation_events_handler(
    State(state): State<Arc<ServerState>>,
    Path(operation_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let operation = state
        .orchestrator
        .get_operation(&operation_id)
        .ok_or_else(|| StoreError::NotFound(format!("Operation {}", operation_id)))?;

    let bus = state.orchestrator.bus();
    let (subscription, rx) = bus.subscribe_channel(&operation_id);

    // The latest event may have been evicted for long-finished operations
    let backfill = match operation.status {
        OperationStatus::Success if bus.latest(&operation_id).is_none() => Some(
            OperationEvent::from_operation(OperationEventType::Completed, &operation),
        ),
        OperationStatus::Error if bus.latest(&operation_id).is_none() => Some(
            OperationEvent::from_operation(OperationEventType::Failed, &operation)
                .with_message(operation.error_message.clone().unwrap_or_default()),
        ),
        _ => None,
    };

    Ok(Sse::new(event_stream(subscription, rx, backfill)).keep_alive(KeepAlive::default()))
}

struct EventStream {
    _subscription: Subscription,
    rx: UnboundedReceiver<OperationEvent>,
    backfill: Option<OperationEvent>,
    done: bool,
}

fn event_stream(
    subscription: Subscription,
    rx: UnboundedReceiver<OperationEvent>,
    backfill: Option<OperationEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let state = EventStream {
        _subscription: subscription,
        rx,
        backfill,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        let event = match state.backfill.take() {
            Some(event) => event,
            None => state.rx.recv().await?,
        };
        state.done = event.event_type.is_terminal();

        Some((Ok(to_sse(&event)), state))
    })
}

fn to_sse(event: &OperationEvent) -> Event {
    let sse = Event::default().event(event.event_type.as_str());
    match serde_json::to_string(event) {
        Ok(data) => sse.data(data),
        Err(e) => {
            warn!("Failed to encode event of operation {}: {}", event.operation_id, e);
            sse.comment("encoding error")
        }
    }
}

/// Run and store an update check
pub async fn update_check_handler(
    State(state): State<Arc<ServerState>>,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let check = state.orchestrator.check_app_update(&app_id).await?;
    let image = check.image;

    Ok(Json(UpdateCheckResponse {
        app_id: check.stack.app_id,
        image: image.as_ref().map(|s| s.image.clone()),
        local_digest: image.as_ref().and_then(|s| s.local_digest.clone()),
        remote_digest: image.as_ref().and_then(|s| s.remote_digest.clone()),
        update_available: image.as_ref().is_some_and(|s| s.update_available),
        checked_at: check.checked_at,
    }))
}
