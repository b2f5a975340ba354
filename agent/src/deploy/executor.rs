//! Remote command execution

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::deploy::credentials::CredentialResolver;
use crate::errors::DeployError;
use crate::models::host::Host;

/// Exit status the OpenSSH client reserves for its own failures
const SSH_CLIENT_ERROR: i32 = 255;

const AUTH_FAILURE_MARKERS: [&str; 3] = [
    "Permission denied",
    "Host key verification failed",
    "Too many authentication failures",
];

const CONNECTION_FAILURE_MARKERS: [&str; 6] = [
    "ssh: ",
    "Connection closed by",
    "Connection reset by",
    "Connection timed out",
    "kex_exchange_identification",
    "Could not resolve hostname",
];

/// Captured result of a remote command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs one command on a remote host
///
/// Implementations never retry: a transport error is returned as
/// `ConnectionError`, `AuthError` or `TimeoutError` and the caller decides.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(
        &self,
        host: &Host,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, DeployError>;
}

/// ssh client options
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Path or name of the ssh binary
    pub binary: String,

    /// Extra `-o` options, e.g. `StrictHostKeyChecking=accept-new`
    pub extra_options: Vec<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            extra_options: Vec::new(),
        }
    }
}

/// [`RemoteExecutor`] backed by the system OpenSSH client
pub struct SshExecutor {
    options: SshOptions,
    credentials: Arc<dyn CredentialResolver>,
}

impl SshExecutor {
    pub fn new(options: SshOptions, credentials: Arc<dyn CredentialResolver>) -> Self {
        Self {
            options,
            credentials,
        }
    }

    fn build_command(&self, host: &Host, identity: &str, command: &str) -> Command {
        let connect_timeout = host.connect_timeout.as_secs().max(1);

        let mut cmd = Command::new(&self.options.binary);
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", connect_timeout))
            .arg("-o")
            .arg("IdentitiesOnly=yes");
        for opt in &self.options.extra_options {
            cmd.arg("-o").arg(opt);
        }
        cmd.arg("-p")
            .arg(host.port.to_string())
            .arg("-i")
            .arg(identity)
            .arg(host.destination())
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        host: &Host,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, DeployError> {
        let token = self.credentials.resolve(host).await?;
        let mut cmd = self.build_command(host, token.expose_identity(), command);

        debug!("Executing on {}: {}", host.name, command);

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(DeployError::ConnectionError(format!(
                    "Failed to run {}: {}",
                    self.options.binary, e
                )));
            }
            Err(_) => {
                return Err(DeployError::TimeoutError(format!(
                    "No completion on {} within {:?}",
                    host.name, timeout
                )));
            }
        };

        classify_exit(
            host,
            output.status.code(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        )
    }
}

/// Separate ssh client failures from the remote command's own exit status
///
/// A remote command may itself exit 255, so that code only counts as an ssh
/// failure when the client's own diagnostic is the last line on stderr.
/// Anything else is returned as the command's status and never retried.
pub fn classify_exit(
    host: &Host,
    code: Option<i32>,
    stdout: String,
    stderr: String,
) -> Result<CommandOutput, DeployError> {
    match code {
        Some(SSH_CLIENT_ERROR) => {
            let last_line = stderr
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or_default()
                .to_string();
            if AUTH_FAILURE_MARKERS.iter().any(|m| last_line.contains(m)) {
                Err(DeployError::AuthError(format!("{}: {}", host.name, last_line)))
            } else if CONNECTION_FAILURE_MARKERS
                .iter()
                .any(|m| last_line.contains(m))
            {
                Err(DeployError::ConnectionError(format!(
                    "{}: {}",
                    host.name, last_line
                )))
            } else {
                Ok(CommandOutput {
                    exit_code: SSH_CLIENT_ERROR,
                    stdout,
                    stderr,
                })
            }
        }
        Some(exit_code) => Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        }),
        None => Err(DeployError::ConnectionError(format!(
            "ssh client for {} terminated by signal",
            host.name
        ))),
    }
}
