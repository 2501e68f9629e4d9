//! Application configuration options

use std::time::Duration;

use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Enable local HTTP server
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Operation runner configuration
    pub operations: OperationOptions,

    /// Container engine configuration
    pub engine: EngineOptions,

    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl AppOptions {
    /// Assemble options from the settings file
    pub fn from_settings(layout: StorageLayout, settings: &Settings) -> Self {
        Self {
            layout,
            enable_server: settings.server.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            operations: OperationOptions {
                max_concurrent: settings.operations.max_concurrent,
                event_cache_capacity: settings.operations.event_cache_capacity,
            },
            engine: EngineOptions {
                docker_bin: settings.engine.docker_bin.clone(),
                local_digest_ttl: Duration::from_secs(settings.engine.local_digest_ttl_secs),
                remote_digest_ttl: Duration::from_secs(settings.engine.remote_digest_ttl_secs),
            },
            ..Default::default()
        }
    }
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            layout: StorageLayout::default(),
            enable_server: true,
            server: ServerOptions::default(),
            operations: OperationOptions::default(),
            engine: EngineOptions::default(),
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
        }
    }
}

/// Operation runner options
#[derive(Debug, Clone, Copy)]
pub struct OperationOptions {
    pub max_concurrent: usize,
    pub event_cache_capacity: usize,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            event_cache_capacity: 1000,
        }
    }
}

/// Container engine options
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub docker_bin: String,
    pub local_digest_ttl: Duration,
    pub remote_digest_ttl: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            local_digest_ttl: Duration::from_secs(30),
            remote_digest_ttl: Duration::from_secs(300),
        }
    }
}
