//! Installed stack models

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deployment status of a stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackStatus {
    Installed,
    NotInstalled,
    Installing,
    Updating,
    Uninstalling,
    Error,
}

impl StackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StackStatus::Installed => "installed",
            StackStatus::NotInstalled => "not_installed",
            StackStatus::Installing => "installing",
            StackStatus::Updating => "updating",
            StackStatus::Uninstalling => "uninstalling",
            StackStatus::Error => "error",
        }
    }

    /// Active stacks hold their web UI port
    pub fn is_active(&self) -> bool {
        *self != StackStatus::NotInstalled
    }

    /// Set while an operation is working on the stack
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            StackStatus::Installing | StackStatus::Updating | StackStatus::Uninstalling
        )
    }
}

/// Durable deployment record, one per app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledStack {
    pub app_id: String,
    pub template_name: String,

    /// Compose project name
    pub stack_name: String,
    pub compose_path: PathBuf,
    pub env_path: PathBuf,
    pub status: StackStatus,
    pub web_ui_port: Option<u16>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub icon_url: Option<String>,

    pub installed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    // Update-check cache
    #[serde(default)]
    pub is_up_to_date: Option<bool>,
    #[serde(default)]
    pub local_digest: Option<String>,
    #[serde(default)]
    pub remote_digest: Option<String>,
    #[serde(default)]
    pub last_update_check: Option<DateTime<Utc>>,
}

impl InstalledStack {
    /// Whether this stack claims `port` for its web UI
    pub fn claims_port(&self, port: u16) -> bool {
        self.status.is_active() && self.web_ui_port == Some(port)
    }
}
