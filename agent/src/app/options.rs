//! Application configuration options

use std::time::Duration;

use crate::deploy::executor::SshOptions;
use crate::deploy::orchestrator::OrchestratorOptions;
use crate::models::host::Host;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::plan_reloader;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Deployment targets
    pub hosts: Vec<Host>,

    /// Enable the HTTP API
    pub enable_server: bool,

    /// Enable the plan reload worker
    pub enable_plan_reloader: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// ssh client configuration
    pub ssh: SshOptions,

    /// Orchestrator configuration
    pub orchestrator: OrchestratorOptions,

    /// Plan reloader options
    pub plan_reloader: plan_reloader::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            layout: StorageLayout::default(),
            hosts: Vec::new(),
            enable_server: true,
            enable_plan_reloader: true,
            server: ServerOptions::default(),
            ssh: SshOptions::default(),
            orchestrator: OrchestratorOptions::default(),
            plan_reloader: plan_reloader::Options::default(),
        }
    }
}

impl AppOptions {
    /// Options derived from a settings file
    pub fn from_settings(
        layout: StorageLayout,
        settings: &Settings,
    ) -> Result<Self, crate::errors::DeployError> {
        Ok(Self {
            layout,
            hosts: settings.hosts()?,
            enable_server: settings.server.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            ssh: settings.ssh_options(),
            orchestrator: settings.orchestrator_options(),
            plan_reloader: plan_reloader::Options {
                interval: Duration::from_secs(settings.plan_reload_interval_secs.max(1)),
            },
            ..Default::default()
        })
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum time to wait for in-flight runs to roll back on shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(900),
        }
    }
}

/// HTTP server options
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
            port: 8086,
        }
    }
}
