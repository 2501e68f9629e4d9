//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::StoreError;
use crate::server::handlers::{
    get_operation_handler, health_handler, list_apps_handler, operation_events_handler,
    start_operation_handler, update_check_handler, version_handler,
};
use crate::server::state::ServerState;

/// Routes of the local API
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Apps
        .route("/apps", get(list_apps_handler))
        .route("/apps/{app_id}/operations", post(start_operation_handler))
        .route("/apps/{app_id}/update-check", post(update_check_handler))
        // Operations
        .route("/operations/{operation_id}", get(get_operation_handler))
        .route("/operations/{operation_id}/events", get(operation_events_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), StoreError>>, StoreError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| StoreError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| StoreError::ServerError(e.to_string()))
    });

    Ok(handle)
}
