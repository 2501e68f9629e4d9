//! Operation models

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle action requested for an app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationAction {
    Install,
    Redeploy,
    Uninstall,
}

impl OperationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationAction::Install => "install",
            OperationAction::Redeploy => "redeploy",
            OperationAction::Uninstall => "uninstall",
        }
    }
}

impl fmt::Display for OperationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "install" => Ok(OperationAction::Install),
            "redeploy" => Ok(OperationAction::Redeploy),
            "uninstall" => Ok(OperationAction::Uninstall),
            _ => Err(format!("Invalid action: {}", s)),
        }
    }
}

/// Operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Accepted, waiting for the runner
    Queued,

    /// Workflow in progress
    Running,

    /// Terminal, completed
    Success,

    /// Terminal, failed
    Error,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Success | OperationStatus::Error)
    }
}

/// Phase tag of a running operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStep {
    Queued,
    Start,
    Resolve,
    Validate,
    Render,
    PullImages,
    ComposeUp,
    Finalize,
    ComposeDown,
    Cleanup,
    Complete,
}

impl OperationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStep::Queued => "queued",
            OperationStep::Start => "start",
            OperationStep::Resolve => "resolve",
            OperationStep::Validate => "validate",
            OperationStep::Render => "render",
            OperationStep::PullImages => "pull-images",
            OperationStep::ComposeUp => "compose-up",
            OperationStep::Finalize => "finalize",
            OperationStep::ComposeDown => "compose-down",
            OperationStep::Cleanup => "cleanup",
            OperationStep::Complete => "complete",
        }
    }
}

impl fmt::Display for OperationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a lifecycle request
#[derive(Debug, Clone, Default)]
pub struct OperationRequest {
    pub display_name: Option<String>,
    pub env: BTreeMap<String, String>,
    pub web_ui_port: Option<u32>,
    pub remove_volumes: bool,
}

/// One asynchronous lifecycle request, tracked from creation to terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub app_id: String,
    pub action: OperationAction,
    pub status: OperationStatus,
    pub progress_percent: u8,
    pub current_step: OperationStep,
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_ui_port: Option<u32>,

    #[serde(default)]
    pub remove_volumes: bool,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    /// Create a queued operation
    pub fn new(
        id: String,
        app_id: impl Into<String>,
        action: OperationAction,
        request: &OperationRequest,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            app_id: app_id.into(),
            action,
            status: OperationStatus::Queued,
            progress_percent: 0,
            current_step: OperationStep::Queued,
            error_message: None,
            web_ui_port: request.web_ui_port,
            remove_volumes: request.remove_volumes,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }
}

/// Kind of operation event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationEventType {
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "step")]
    Step,
    #[serde(rename = "pull.progress")]
    PullProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl OperationEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationEventType::Started => "started",
            OperationEventType::Step => "step",
            OperationEventType::PullProgress => "pull.progress",
            OperationEventType::Completed => "completed",
            OperationEventType::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationEventType::Completed | OperationEventType::Failed)
    }
}

/// Byte-level progress reported by the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
}

impl ProgressDetail {
    /// Build from byte counts, deriving the percent when the total is known
    pub fn from_bytes(current: u64, total: u64) -> Self {
        let percent = if total > 0 {
            Some((current as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
        } else {
            None
        };
        Self {
            current: Some(current),
            total: Some(total),
            percent,
        }
    }
}

/// Projection of an operation transition, as delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEvent {
    #[serde(rename = "type")]
    pub event_type: OperationEventType,
    pub operation_id: String,
    pub app_id: String,
    pub action: OperationAction,
    pub status: OperationStatus,
    pub progress_percent: u8,
    pub step: OperationStep,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_detail: Option<ProgressDetail>,

    pub timestamp: DateTime<Utc>,
}

impl OperationEvent {
    /// Snapshot an operation into an event
    pub fn from_operation(event_type: OperationEventType, operation: &Operation) -> Self {
        Self {
            event_type,
            operation_id: operation.id.clone(),
            app_id: operation.app_id.clone(),
            action: operation.action,
            status: operation.status,
            progress_percent: operation.progress_percent,
            step: operation.current_step,
            message: None,
            image: None,
            docker_status: None,
            progress_detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_docker_status(mut self, status: impl Into<String>) -> Self {
        self.docker_status = Some(status.into());
        self
    }

    pub fn with_progress_detail(mut self, detail: Option<ProgressDetail>) -> Self {
        self.progress_detail = detail;
        self
    }
}
