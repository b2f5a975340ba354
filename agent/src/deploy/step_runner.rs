//! Step execution with retries

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::deploy::cancel::CancelSignal;
use crate::deploy::executor::RemoteExecutor;
use crate::deploy::plan::Step;
use crate::errors::DeployError;
use crate::models::host::Host;
use crate::models::run::{StepOutcome, StepPhase, StepStatus};
use crate::utils::truncate_tail;

/// Bytes of stdout/stderr kept per outcome
pub const DEFAULT_OUTPUT_LIMIT: usize = 16 * 1024;

/// Runs one action of a step against a host, applying the step's retry policy
///
/// Only `ConnectionError` and `TimeoutError` are retried. A non-zero exit or an
/// `AuthError` is a hard failure and ends the step after that attempt.
pub struct StepRunner {
    executor: Arc<dyn RemoteExecutor>,
    default_timeout: Duration,
    output_limit: usize,
}

impl StepRunner {
    pub fn new(executor: Arc<dyn RemoteExecutor>, default_timeout: Duration) -> Self {
        Self {
            executor,
            default_timeout,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// Run `command` as the given phase of `step`
    ///
    /// `None` as the command means the step has no action for this phase; the
    /// outcome is a skipped success. Cancellation stops further attempts but
    /// never interrupts a command in flight.
    pub async fn run(
        &self,
        step: &Step,
        phase: StepPhase,
        command: Option<&str>,
        host: &Host,
        cancel: &CancelSignal,
    ) -> StepOutcome {
        let Some(command) = command else {
            info!("Step {} has no {:?} action, skipping", step.name, phase);
            return StepOutcome::skipped(&step.name, phase);
        };

        let policy = match phase {
            StepPhase::Forward => &step.retry_policy,
            StepPhase::Rollback => &step.rollback_retry_policy,
        };
        let timeout = step.timeout().unwrap_or(self.default_timeout);
        let started_at = Utc::now();
        let mut attempts = 0;

        let failed = |attempts: u32, error: String| StepOutcome {
            step_name: step.name.clone(),
            phase,
            status: StepStatus::Failed,
            attempts,
            started_at,
            finished_at: Utc::now(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error),
            skipped: false,
        };

        loop {
            if cancel.is_cancelled() {
                warn!("Step {} cancelled after {} attempt(s)", step.name, attempts);
                return failed(attempts, "cancelled".to_string());
            }

            attempts += 1;
            debug!(
                "Step {} ({:?}) attempt {}/{} on {}",
                step.name, phase, attempts, policy.max_attempts, host.name
            );

            match self.executor.execute(host, command, timeout).await {
                Ok(output) => {
                    let succeeded = output.success();
                    let error = (!succeeded).then(|| {
                        DeployError::CommandFailure {
                            exit_code: output.exit_code,
                            detail: truncate_tail(output.stderr.trim(), 512),
                        }
                        .to_string()
                    });
                    if succeeded {
                        info!("Step {} ({:?}) succeeded on {}", step.name, phase, host.name);
                    } else {
                        error!(
                            "Step {} ({:?}) exited with {} on {}",
                            step.name, phase, output.exit_code, host.name
                        );
                    }
                    return StepOutcome {
                        step_name: step.name.clone(),
                        phase,
                        status: if succeeded {
                            StepStatus::Succeeded
                        } else {
                            StepStatus::Failed
                        },
                        attempts,
                        started_at,
                        finished_at: Utc::now(),
                        exit_code: Some(output.exit_code),
                        stdout: truncate_tail(&output.stdout, self.output_limit),
                        stderr: truncate_tail(&output.stderr, self.output_limit),
                        error,
                        skipped: false,
                    };
                }
                Err(e) if e.is_transient() && attempts < policy.max_attempts => {
                    let delay = policy.backoff(attempts);
                    warn!(
                        "Step {} attempt {} failed: {}; retrying in {:?}",
                        step.name, attempts, e, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            warn!("Step {} cancelled during backoff", step.name);
                            return failed(attempts, format!("cancelled after: {}", e));
                        }
                    }
                }
                Err(e) => {
                    error!(
                        "Step {} ({:?}) failed after {} attempt(s): {}",
                        step.name, phase, attempts, e
                    );
                    return failed(attempts, e.to_string());
                }
            }
        }
    }
}
