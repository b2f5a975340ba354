//! Settings file management

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deploy::credentials::{AuthToken, StaticCredentials};
use crate::deploy::executor::SshOptions;
use crate::deploy::orchestrator::{ConcurrencyPolicy, OrchestratorOptions};
use crate::errors::DeployError;
use crate::logs::LogLevel;
use crate::models::host::Host;

/// Orchestrator settings
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

    /// HTTP API configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// ssh client configuration
    #[serde(default)]
    pub ssh: SshSettings,

    /// Command timeout for steps that do not set their own
    #[serde(default = "default_command_timeout")]
    pub default_command_timeout_secs: u64,

    /// Reject or queue a trigger for a host that is already deploying
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,

    /// How often the plans directory is rescanned
    #[serde(default = "default_plan_reload_interval")]
    pub plan_reload_interval_secs: u64,

    /// Deployment targets
    #[serde(default)]
    pub hosts: Vec<HostSettings>,
}

fn default_true() -> bool {
    true
}

fn default_command_timeout() -> u64 {
    600
}

fn default_plan_reload_interval() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            server: ServerSettings::default(),
            ssh: SshSettings::default(),
            default_command_timeout_secs: default_command_timeout(),
            concurrency_policy: ConcurrencyPolicy::Reject,
            plan_reload_interval_secs: default_plan_reload_interval(),
            hosts: Vec::new(),
        }
    }
}

impl Settings {
    /// Validate and convert the host table
    pub fn hosts(&self) -> Result<Vec<Host>, DeployError> {
        let mut hosts: Vec<Host> = Vec::with_capacity(self.hosts.len());
        for entry in &self.hosts {
            if entry.name.trim().is_empty() || entry.address.trim().is_empty() {
                return Err(DeployError::ConfigError(
                    "Every host needs a name and an address".to_string(),
                ));
            }
            if hosts.iter().any(|h| h.name == entry.name) {
                return Err(DeployError::ConfigError(format!(
                    "Duplicate host name '{}'",
                    entry.name
                )));
            }
            hosts.push(entry.to_host());
        }
        Ok(hosts)
    }

    /// Credentials configured inline as identity file paths
    pub fn static_credentials(&self) -> StaticCredentials {
        let mut creds = StaticCredentials::new();
        for entry in &self.hosts {
            if let Some(identity) = &entry.identity_file {
                creds.insert(entry.credential_ref(), AuthToken::new(identity.clone()));
            }
        }
        creds
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            concurrency_policy: self.concurrency_policy,
            default_command_timeout: Duration::from_secs(self.default_command_timeout_secs.max(1)),
        }
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            binary: self.ssh.binary.clone(),
            extra_options: self.ssh.extra_options.clone(),
        }
    }
}

/// HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Serve the trigger and ledger API
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8086
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

/// ssh client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_ssh_binary")]
    pub binary: String,

    /// Extra `-o` options passed to every connection
    #[serde(default)]
    pub extra_options: Vec<String>,
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            binary: default_ssh_binary(),
            extra_options: Vec::new(),
        }
    }
}

/// One deployment target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    pub name: String,

    pub address: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    /// Credential store key; defaults to the host name
    #[serde(default)]
    pub credential_ref: Option<String>,

    /// SSH identity file, when not supplied through the environment
    #[serde(default)]
    pub identity_file: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_user() -> String {
    "deploy".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

impl HostSettings {
    pub fn credential_ref(&self) -> String {
        self.credential_ref
            .clone()
            .unwrap_or_else(|| self.name.clone())
    }

    pub fn to_host(&self) -> Host {
        Host {
            name: self.name.clone(),
            address: self.address.clone(),
            port: self.port,
            user: self.user.clone(),
            credential_ref: self.credential_ref(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}
