//! Run ledger models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall status of a deployment run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    /// Created, waiting for the host lock
    Idle,

    /// Forward steps in progress
    Running,

    /// All forward steps succeeded
    Succeeded,

    /// A forward step failed, rollback actions in progress
    RollingBack,

    /// Every rollback action succeeded or was skipped
    RolledBack,

    /// At least one rollback action failed; needs manual intervention
    RollbackFailed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::RolledBack | RunStatus::RollbackFailed
        )
    }

    /// Holding the host lock
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::RollingBack)
    }
}

/// Which action of a step an outcome belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepPhase {
    Forward,
    Rollback,
}

/// Status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

/// Result of running one action of one step. Immutable once appended to a
/// [`RunRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_name: String,
    pub phase: StepPhase,
    pub status: StepStatus,

    /// Number of times the command was sent to the host
    pub attempts: u32,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(default)]
    pub stdout: String,

    #[serde(default)]
    pub stderr: String,

    /// Last error seen, for failed outcomes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Set when no remote action was taken (idempotent step without rollback)
    #[serde(default)]
    pub skipped: bool,
}

impl StepOutcome {
    /// An outcome for an action that was deliberately not executed
    pub fn skipped(step_name: impl Into<String>, phase: StepPhase) -> Self {
        let now = Utc::now();
        Self {
            step_name: step_name.into(),
            phase,
            status: StepStatus::Succeeded,
            attempts: 0,
            started_at: now,
            finished_at: now,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            skipped: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Caller-supplied context of a deployment trigger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployContext {
    /// Branch, tag or commit to deploy
    pub git_ref: String,

    /// Deterministic key for duplicate trigger detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_key: Option<String>,

    /// Extra template variables, available as `{{var.<name>}}`
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl DeployContext {
    pub fn new(git_ref: impl Into<String>) -> Self {
        Self {
            git_ref: git_ref.into(),
            ..Default::default()
        }
    }

    pub fn with_trigger_key(mut self, key: impl Into<String>) -> Self {
        self.trigger_key = Some(key.into());
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

/// Audit record of one deployment run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub host: String,
    pub plan: String,
    pub context: DeployContext,
    pub status: RunStatus,

    /// Step whose action is executing right now
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<String>,

    /// Append-only
    pub outcomes: Vec<StepOutcome>,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(
        run_id: impl Into<String>,
        host: impl Into<String>,
        plan: impl Into<String>,
        context: DeployContext,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            host: host.into(),
            plan: plan.into(),
            context,
            status: RunStatus::Idle,
            current_step: None,
            failed_step: None,
            failure_reason: None,
            rollback_error: None,
            outcomes: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn forward_outcome(&self, step_name: &str) -> Option<&StepOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.phase == StepPhase::Forward && o.step_name == step_name)
    }

    pub fn rollback_outcome(&self, step_name: &str) -> Option<&StepOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.phase == StepPhase::Rollback && o.step_name == step_name)
    }

    /// Names of the steps rolled back, in execution order
    pub fn rollback_order(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.phase == StepPhase::Rollback)
            .map(|o| o.step_name.as_str())
            .collect()
    }

    /// Effective status of a step, derived from the appended outcomes
    pub fn step_status(&self, step_name: &str) -> StepStatus {
        if self.current_step.as_deref() == Some(step_name) {
            return StepStatus::Running;
        }
        if let Some(rollback) = self.rollback_outcome(step_name) {
            if rollback.is_success() && !rollback.skipped {
                return StepStatus::RolledBack;
            }
        }
        match self.forward_outcome(step_name) {
            Some(outcome) => outcome.status,
            None => StepStatus::Pending,
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            host: self.host.clone(),
            plan: self.plan.clone(),
            git_ref: self.context.git_ref.clone(),
            status: self.status,
            failed_step: self.failed_step.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

/// Compact view of a run for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub host: String,
    pub plan: String,
    pub git_ref: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}
