//! Error types for the store agent

use thiserror::Error;

/// Main error type for the store agent
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("URL error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Container engine error: {0}")]
    EngineError(String),

    #[error("Template error: {0}")]
    TemplateError(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),
}

impl StoreError {
    /// Whether the error was raised before any side effect was attempted
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StoreError::ValidationError(_) | StoreError::NotFound(_) | StoreError::Conflict(_)
        )
    }
}
