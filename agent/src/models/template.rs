//! App template models

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Where the compose document of a template comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemplateSource {
    /// Catalog template, compose file fetched from a repository
    #[serde(rename_all = "camelCase")]
    Catalog {
        repository_url: String,
        stack_file: String,
    },

    /// Operator-defined app with an inline compose document
    Custom { compose: String },
}

/// A variable the template accepts in its environment file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarSpec {
    pub name: String,

    #[serde(default)]
    pub default: Option<String>,
}

/// Installable app definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppTemplate {
    pub app_id: String,
    pub name: String,
    pub source: TemplateSource,

    #[serde(default)]
    pub env: Vec<EnvVarSpec>,

    /// Compose service that serves the web UI
    #[serde(default)]
    pub primary_service: Option<String>,

    #[serde(default)]
    pub icon_url: Option<String>,
}

impl AppTemplate {
    /// Declared variable names
    pub fn declared_keys(&self) -> BTreeSet<&str> {
        self.env.iter().map(|v| v.name.as_str()).collect()
    }

    /// Default values for declared variables
    pub fn env_defaults(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .map(|v| (v.name.clone(), v.default.clone().unwrap_or_default()))
            .collect()
    }
}
