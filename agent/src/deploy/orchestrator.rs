//! Deployment orchestrator
//!
//! Drives a plan against one host per run: forward steps in order, rollback in
//! reverse on the first hard failure. Each run owns its host's lock from
//! `Idle -> Running` until it reaches a terminal status, and every outcome is
//! in the ledger before the next action begins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::plans::PlanRegistry;
use crate::deploy::cancel::{cancel_pair, CancelHandle, CancelSignal};
use crate::deploy::executor::RemoteExecutor;
use crate::deploy::fsm::{RunEvent, RunFsm};
use crate::deploy::ledger::RunLedger;
use crate::deploy::plan::{DeploymentPlan, RenderedCommands};
use crate::deploy::step_runner::StepRunner;
use crate::deploy::template::RenderContext;
use crate::errors::DeployError;
use crate::models::host::Host;
use crate::models::run::{
    DeployContext, RunRecord, RunStatus, RunSummary, StepOutcome, StepPhase, StepStatus,
};
use crate::utils::{generate_uuid, sha256_hash};

/// What to do when a host already has an active run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyPolicy {
    /// Fail the new trigger with `ConcurrentDeployment`
    #[default]
    Reject,

    /// Accept the trigger; the run waits `idle` for the host lock
    Queue,
}

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub concurrency_policy: ConcurrencyPolicy,

    /// Command timeout for steps that do not set their own
    pub default_command_timeout: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            concurrency_policy: ConcurrencyPolicy::Reject,
            default_command_timeout: Duration::from_secs(600),
        }
    }
}

/// A deployment trigger, as received from CI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub host: String,
    pub plan: String,
    #[serde(flatten)]
    pub context: DeployContext,
}

struct ActiveRun {
    host: String,
    cancel: CancelHandle,
    done: watch::Receiver<bool>,
    handle: Option<JoinHandle<()>>,
}

pub struct DeploymentOrchestrator {
    hosts: HashMap<String, Arc<Host>>,
    plans: Arc<PlanRegistry>,
    runner: StepRunner,
    ledger: Arc<RunLedger>,
    options: OrchestratorOptions,
    host_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    active: Mutex<HashMap<String, ActiveRun>>,
}

impl DeploymentOrchestrator {
    pub fn new(
        hosts: Vec<Host>,
        plans: Arc<PlanRegistry>,
        executor: Arc<dyn RemoteExecutor>,
        ledger: Arc<RunLedger>,
        options: OrchestratorOptions,
    ) -> Self {
        let hosts = hosts
            .into_iter()
            .map(|h| (h.name.clone(), Arc::new(h)))
            .collect();
        Self {
            hosts,
            plans,
            runner: StepRunner::new(executor, options.default_command_timeout),
            ledger,
            options,
            host_locks: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn host(&self, name: &str) -> Option<Arc<Host>> {
        self.hosts.get(name).cloned()
    }

    /// Names of the configured hosts, sorted
    pub fn host_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hosts.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn plans(&self) -> &Arc<PlanRegistry> {
        &self.plans
    }

    /// Start a deployment and return its run id
    ///
    /// With a trigger key the run id is derived from host, plan and key, and a
    /// repeated trigger returns the existing id without starting anything.
    pub async fn trigger_deployment(
        self: &Arc<Self>,
        request: DeploymentRequest,
    ) -> Result<String, DeployError> {
        let host = self
            .host(&request.host)
            .ok_or_else(|| DeployError::NotFound(format!("Host {}", request.host)))?;
        let plan = self
            .plans
            .get(&request.plan)
            .ok_or_else(|| DeployError::NotFound(format!("Plan {}", request.plan)))?;

        let run_id = match &request.context.trigger_key {
            Some(key) => derive_run_id(&host.name, plan.name(), key),
            None => generate_uuid(),
        };
        if self.ledger.contains(&run_id).await {
            info!("Duplicate trigger for run {}, ignoring", run_id);
            return Ok(run_id);
        }

        let commands = plan.render_commands(&RenderContext {
            run_id: &run_id,
            host: &host.name,
            plan: plan.name(),
            context: &request.context,
        })?;

        let host_lock = self.host_lock(&host.name);
        let guard = match self.options.concurrency_policy {
            ConcurrencyPolicy::Reject => Some(host_lock.clone().try_lock_owned().map_err(|_| {
                warn!("Rejecting trigger for {}: deployment in progress", host.name);
                DeployError::ConcurrentDeployment {
                    host: host.name.clone(),
                    run_id: self.active_run_for(&host.name).unwrap_or_default(),
                }
            })?),
            ConcurrencyPolicy::Queue => None,
        };

        let record = RunRecord::new(&run_id, &host.name, plan.name(), request.context);
        if !self.ledger.create(record).await? {
            info!("Duplicate trigger for run {}, ignoring", run_id);
            return Ok(run_id);
        }

        let (cancel, cancel_signal) = cancel_pair();
        let (done_tx, done) = watch::channel(false);
        self.lock_active().insert(
            run_id.clone(),
            ActiveRun {
                host: host.name.clone(),
                cancel,
                done,
                handle: None,
            },
        );

        info!("Triggered run {}: plan {} on host {}", run_id, plan.name(), host.name);

        let this = Arc::clone(self);
        let task_run_id = run_id.clone();
        let handle = tokio::spawn(async move {
            this.drive(task_run_id, host, plan, commands, host_lock, guard, cancel_signal)
                .await;
            let _ = done_tx.send(true);
        });
        if let Some(active) = self.lock_active().get_mut(&run_id) {
            active.handle = Some(handle);
        }

        Ok(run_id)
    }

    /// Read-only snapshot of a run
    pub async fn get_run_record(&self, run_id: &str) -> Result<RunRecord, DeployError> {
        self.ledger
            .get(run_id)
            .await
            .ok_or_else(|| DeployError::NotFound(format!("Run {}", run_id)))
    }

    pub async fn list_runs(&self) -> Vec<RunSummary> {
        self.ledger.list().await
    }

    /// Ids of runs not yet terminal
    pub fn active_runs(&self) -> Vec<String> {
        self.lock_active().keys().cloned().collect()
    }

    /// Request cancellation of a run; it rolls back as if the current step
    /// hard-failed
    pub async fn cancel(&self, run_id: &str) -> Result<(), DeployError> {
        let handle = self.lock_active().get(run_id).map(|run| run.cancel.clone());
        if let Some(handle) = handle {
            info!("Cancellation requested for run {}", run_id);
            handle.cancel();
            return Ok(());
        }
        match self.ledger.get(run_id).await {
            Some(record) => Err(DeployError::LedgerError(format!(
                "Run {} is already {:?}",
                run_id, record.status
            ))),
            None => Err(DeployError::NotFound(format!("Run {}", run_id))),
        }
    }

    /// Wait until a run is terminal and return its record
    ///
    /// Any number of callers may wait on the same run.
    pub async fn wait(&self, run_id: &str) -> Result<RunRecord, DeployError> {
        let done = self
            .lock_active()
            .get(run_id)
            .map(|active| active.done.clone());
        if let Some(mut done) = done {
            // A closed channel means the run task is gone; the ledger has the rest
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.get_run_record(run_id).await
    }

    /// Cancel every active run and wait for all of them to finish rolling back
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut active = self.lock_active();
            active
                .values_mut()
                .filter_map(|run| {
                    run.cancel.cancel();
                    run.handle.take()
                })
                .collect()
        };
        if handles.is_empty() {
            return;
        }
        info!("Waiting for {} active run(s) to finish", handles.len());
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Run task failed during shutdown: {}", e);
            }
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn host_lock(&self, host: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.host_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn active_run_for(&self, host: &str) -> Option<String> {
        self.lock_active()
            .iter()
            .find(|(_, run)| run.host == host)
            .map(|(id, _)| id.clone())
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        self: Arc<Self>,
        run_id: String,
        host: Arc<Host>,
        plan: Arc<DeploymentPlan>,
        commands: RenderedCommands,
        host_lock: Arc<AsyncMutex<()>>,
        guard: Option<OwnedMutexGuard<()>>,
        cancel: CancelSignal,
    ) {
        let guard = match guard {
            Some(guard) => guard,
            None => {
                info!("Run {} waiting for host {}", run_id, host.name);
                host_lock.lock_owned().await
            }
        };

        if let Err(e) = self
            .execute_run(&run_id, &host, &plan, &commands, &cancel)
            .await
        {
            error!("Run {} aborted: {}", run_id, e);
            let _ = self.ledger.record_rollback_error(&run_id, &e.to_string()).await;
            let _ = self.ledger.set_status(&run_id, RunStatus::RollbackFailed).await;
        }

        // Release the host before waiters are woken
        drop(guard);
        self.lock_active().remove(&run_id);
    }

    async fn execute_run(
        &self,
        run_id: &str,
        host: &Host,
        plan: &DeploymentPlan,
        commands: &RenderedCommands,
        cancel: &CancelSignal,
    ) -> Result<(), DeployError> {
        let mut fsm = RunFsm::new();
        self.transition(&mut fsm, run_id, RunEvent::Start).await?;
        info!("Run {} running plan {} on {}", run_id, plan.name(), host.name);

        let mut failure: Option<StepOutcome> = None;
        for step in plan.forward_steps() {
            self.ledger.set_current_step(run_id, Some(&step.name)).await?;
            let mut outcome = self
                .runner
                .run(step, StepPhase::Forward, commands.forward(&step.name), host, cancel)
                .await;
            if outcome.is_success() && cancel.is_cancelled() {
                outcome.status = StepStatus::Failed;
                outcome.error = Some("cancelled".to_string());
            }
            let succeeded = outcome.is_success();
            self.ledger.append_outcome(run_id, outcome.clone()).await?;
            self.ledger.set_current_step(run_id, None).await?;

            if !succeeded {
                failure = Some(outcome);
                break;
            }
        }

        let Some(failed) = failure else {
            self.transition(&mut fsm, run_id, RunEvent::AllStepsSucceeded)
                .await?;
            info!("Run {} succeeded", run_id);
            return Ok(());
        };

        let reason = failed
            .error
            .clone()
            .unwrap_or_else(|| "step failed".to_string());
        self.ledger
            .record_failure(run_id, &failed.step_name, &reason)
            .await?;
        self.transition(&mut fsm, run_id, RunEvent::StepFailed(reason.clone()))
            .await?;
        warn!(
            "Run {} failed at step {} ({}); rolling back",
            run_id, failed.step_name, reason
        );

        // Rollback runs to completion even when the run was cancelled
        let never = CancelSignal::never();
        let mut rollback_failures = Vec::new();
        for step in plan.rollback_for(&failed.step_name)? {
            if step.name == failed.step_name && failed.attempts == 0 {
                info!("Step {} never ran, nothing to roll back", step.name);
                continue;
            }
            self.ledger.set_current_step(run_id, Some(&step.name)).await?;
            let outcome = self
                .runner
                .run(step, StepPhase::Rollback, commands.rollback(&step.name), host, &never)
                .await;
            let succeeded = outcome.is_success();
            self.ledger.append_outcome(run_id, outcome).await?;
            self.ledger.set_current_step(run_id, None).await?;

            if !succeeded {
                warn!("Rollback of step {} failed in run {}, continuing", step.name, run_id);
                rollback_failures.push(step.name.clone());
            }
        }

        if rollback_failures.is_empty() {
            self.transition(&mut fsm, run_id, RunEvent::RollbackCompleted)
                .await?;
            info!("Run {} rolled back", run_id);
        } else {
            let err = DeployError::RollbackFailure {
                run_id: run_id.to_string(),
                detail: format!("failed step(s): {}", rollback_failures.join(", ")),
            };
            error!("{}; manual intervention required", err);
            self.ledger
                .record_rollback_error(run_id, &err.to_string())
                .await?;
            self.transition(&mut fsm, run_id, RunEvent::RollbackFailed(err.to_string()))
                .await?;
        }
        Ok(())
    }

    async fn transition(
        &self,
        fsm: &mut RunFsm,
        run_id: &str,
        event: RunEvent,
    ) -> Result<RunStatus, DeployError> {
        let status = fsm.process(event).map_err(DeployError::Internal)?;
        self.ledger.set_status(run_id, status).await?;
        Ok(status)
    }
}

/// Stable run id for a trigger key
pub fn derive_run_id(host: &str, plan: &str, trigger_key: &str) -> String {
    let digest = sha256_hash(format!("{}\n{}\n{}", host, plan, trigger_key).as_bytes());
    format!("run-{}", &digest[..32])
}
