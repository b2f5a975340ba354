//! Deployment plans
//!
//! A plan is data, not code: an ordered list of steps, each with a forward
//! command, an optional rollback command and its own retry policies. Plans are
//! validated once when built and are immutable afterwards.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deploy::template::{self, RenderContext};
use crate::errors::DeployError;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Retry policy for one action of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: initial_backoff.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Policy used for rollback actions unless a step overrides it
    pub fn lenient() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
            multiplier: 2.0,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let options = CooldownOptions {
            base_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
        };
        calc_exp_backoff(&options, attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// One logical deployment action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,

    pub forward_command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_command: Option<String>,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    #[serde(default = "RetryPolicy::lenient")]
    pub rollback_retry_policy: RetryPolicy,

    /// Safe to re-run; a step without a rollback command must set this
    #[serde(default)]
    pub idempotent: bool,

    /// Earlier steps this one needs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Per-command timeout, overriding the orchestrator default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Step {
    pub fn new(name: impl Into<String>, forward_command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            forward_command: forward_command.into(),
            rollback_command: None,
            retry_policy: RetryPolicy::default(),
            rollback_retry_policy: RetryPolicy::lenient(),
            idempotent: false,
            depends_on: Vec::new(),
            timeout_secs: None,
        }
    }

    pub fn with_rollback(mut self, command: impl Into<String>) -> Self {
        self.rollback_command = Some(command.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_rollback_retry(mut self, policy: RetryPolicy) -> Self {
        self.rollback_retry_policy = policy;
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// No rollback command; rollback is reported as skipped
    pub fn is_forward_only(&self) -> bool {
        self.rollback_command.is_none()
    }
}

/// On-disk plan definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    pub name: String,
    pub steps: Vec<Step>,
}

/// A validated, ordered sequence of steps
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    name: String,
    steps: Vec<Step>,
}

impl DeploymentPlan {
    /// Build and validate a plan
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Result<Self, DeployError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DeployError::PlanError("Plan name is empty".to_string()));
        }
        if steps.is_empty() {
            return Err(DeployError::PlanError(format!("Plan '{}' has no steps", name)));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for step in &steps {
            validate_step(step)?;

            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(DeployError::PlanError(format!(
                        "Step '{}' depends on '{}', which is not an earlier step",
                        step.name, dep
                    )));
                }
            }

            if !seen.insert(step.name.as_str()) {
                return Err(DeployError::PlanError(format!(
                    "Duplicate step name '{}'",
                    step.name
                )));
            }
        }

        Ok(Self { name, steps })
    }

    pub fn from_spec(spec: PlanSpec) -> Result<Self, DeployError> {
        Self::new(spec.name, spec.steps)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in execution order
    pub fn forward_steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Rollback sequence for a run that failed at `step_name`: the steps
    /// completed before it, most recent first, then the failing step itself.
    pub fn rollback_for(&self, step_name: &str) -> Result<Vec<&Step>, DeployError> {
        let idx = self
            .steps
            .iter()
            .position(|s| s.name == step_name)
            .ok_or_else(|| {
                DeployError::PlanError(format!(
                    "Step '{}' is not part of plan '{}'",
                    step_name, self.name
                ))
            })?;

        let mut sequence: Vec<&Step> = self.steps[..idx].iter().rev().collect();
        sequence.push(&self.steps[idx]);
        Ok(sequence)
    }

    /// Resolve every command template for a run
    pub fn render_commands(&self, ctx: &RenderContext<'_>) -> Result<RenderedCommands, DeployError> {
        let mut forward = HashMap::new();
        let mut rollback = HashMap::new();
        for step in &self.steps {
            forward.insert(step.name.clone(), template::render(&step.forward_command, ctx)?);
            if let Some(cmd) = &step.rollback_command {
                rollback.insert(step.name.clone(), template::render(cmd, ctx)?);
            }
        }
        Ok(RenderedCommands { forward, rollback })
    }
}

fn validate_step(step: &Step) -> Result<(), DeployError> {
    if step.name.trim().is_empty() {
        return Err(DeployError::PlanError("Step name is empty".to_string()));
    }
    if step.forward_command.trim().is_empty() {
        return Err(DeployError::PlanError(format!(
            "Step '{}' has an empty forward command",
            step.name
        )));
    }
    if step.retry_policy.max_attempts == 0 || step.rollback_retry_policy.max_attempts == 0 {
        return Err(DeployError::PlanError(format!(
            "Step '{}' must allow at least one attempt",
            step.name
        )));
    }
    if step.is_forward_only() && !step.idempotent {
        return Err(DeployError::PlanError(format!(
            "Step '{}' has no rollback command and is not marked idempotent",
            step.name
        )));
    }

    template::validate(&step.forward_command)?;
    if let Some(cmd) = &step.rollback_command {
        if cmd.trim().is_empty() {
            return Err(DeployError::PlanError(format!(
                "Step '{}' has an empty rollback command",
                step.name
            )));
        }
        template::validate(cmd)?;
    }
    Ok(())
}

/// Commands of a plan with every placeholder resolved
#[derive(Debug, Clone, Default)]
pub struct RenderedCommands {
    forward: HashMap<String, String>,
    rollback: HashMap<String, String>,
}

impl RenderedCommands {
    pub fn forward(&self, step_name: &str) -> Option<&str> {
        self.forward.get(step_name).map(String::as_str)
    }

    pub fn rollback(&self, step_name: &str) -> Option<&str> {
        self.rollback.get(step_name).map(String::as_str)
    }
}
