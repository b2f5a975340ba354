//! Error types for pushdeploy

use thiserror::Error;

/// Main error type for the deployment orchestrator
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// The remote channel could not be established
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The host rejected the credential, or none could be resolved
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// The remote command did not complete within its timeout
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// The remote command exited with a non-zero status
    #[error("Command failed with exit code {exit_code}: {detail}")]
    CommandFailure { exit_code: i32, detail: String },

    #[error("Plan error: {0}")]
    PlanError(String),

    #[error("Deployment already in progress for host {host} (run {run_id})")]
    ConcurrentDeployment { host: String, run_id: String },

    #[error("Rollback failed for run {run_id}: {detail}")]
    RollbackFailure { run_id: String, detail: String },

    #[error("Ledger error: {0}")]
    LedgerError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Transport errors worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeployError::ConnectionError(_) | DeployError::TimeoutError(_)
        )
    }
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}
