//! Store API models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub name: String,
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Request body for starting an install, redeploy or uninstall
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOperationRequest {
    /// One of "install", "redeploy", "uninstall"
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,

    /// Kept wider than u16 so out-of-range values reach validation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_ui_port: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_volumes: Option<bool>,
}

/// Response for an accepted operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOperationResponse {
    pub operation_id: String,
}

/// Installed stack summary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackSummary {
    pub app_id: String,
    pub display_name: Option<String>,
    pub status: String,
    pub web_ui_port: Option<u16>,
    pub is_up_to_date: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

/// Stack list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackListResponse {
    pub stacks: Vec<StackSummary>,
    pub total: usize,
}

/// Result of an update check for one app
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheckResponse {
    pub app_id: String,
    pub image: Option<String>,
    pub local_digest: Option<String>,
    pub remote_digest: Option<String>,
    pub update_available: bool,
    pub checked_at: DateTime<Utc>,
}

/// Error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
