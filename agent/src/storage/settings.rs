//! Settings file management

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Also write a daily rolling log file under the logs directory
    #[serde(default)]
    pub log_to_file: bool,

    /// Local HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Operation runner configuration
    #[serde(default)]
    pub operations: OperationSettings,

    /// Container engine configuration
    #[serde(default)]
    pub engine: EngineSettings,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            server: ServerSettings::default(),
            operations: OperationSettings::default(),
            engine: EngineSettings::default(),
        }
    }
}

/// Local HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Enable the HTTP server
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Host to bind to
    #[serde(default = "default_server_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8090
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Operation runner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSettings {
    /// Workflows allowed to run at once across all apps
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Operations whose latest event is kept for late subscribers
    #[serde(default = "default_event_cache_capacity")]
    pub event_cache_capacity: usize,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_event_cache_capacity() -> usize {
    1000
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            event_cache_capacity: default_event_cache_capacity(),
        }
    }
}

/// Container engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Docker CLI binary
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// Local digest cache TTL in seconds
    #[serde(default = "default_local_digest_ttl")]
    pub local_digest_ttl_secs: u64,

    /// Remote digest cache TTL in seconds
    #[serde(default = "default_remote_digest_ttl")]
    pub remote_digest_ttl_secs: u64,
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_local_digest_ttl() -> u64 {
    30
}

fn default_remote_digest_ttl() -> u64 {
    300
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            docker_bin: default_docker_bin(),
            local_digest_ttl_secs: default_local_digest_ttl(),
            remote_digest_ttl_secs: default_remote_digest_ttl(),
        }
    }
}
