//! Run ledger persistence tests

use pushdeploy::deploy::ledger::RunLedger;
use pushdeploy::errors::DeployError;
use pushdeploy::filesys::dir::Dir;
use pushdeploy::models::run::{DeployContext, RunRecord, RunStatus, StepOutcome, StepPhase};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = Dir::create_temp_dir("pushdeploy-ledger").await.unwrap();

    {
        let ledger = RunLedger::open(dir.clone()).await.unwrap();
        let record = RunRecord::new("run-1", "web-1", "api", DeployContext::new("v1"));
        assert_ok!(ledger.create(record).await);
        assert_ok!(ledger.set_status("run-1", RunStatus::Running).await);
        assert_ok!(
            ledger
                .append_outcome("run-1", StepOutcome::skipped("fetch", StepPhase::Forward))
                .await
        );
        assert_ok!(ledger.set_status("run-1", RunStatus::Succeeded).await);
    }

    assert!(dir.file("run-1.json").exists().await);

    let reopened = RunLedger::open(dir.clone()).await.unwrap();
    let record = reopened.get("run-1").await.unwrap();
    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.context.git_ref, "v1");
    assert_eq!(record.outcomes.len(), 1);
    assert!(record.rollback_error.is_none());

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_interrupted_run_is_closed_on_open() {
    let dir = Dir::create_temp_dir("pushdeploy-ledger").await.unwrap();

    {
        let ledger = RunLedger::open(dir.clone()).await.unwrap();
        let record = RunRecord::new("run-2", "web-1", "api", DeployContext::new("v2"));
        ledger.create(record).await.unwrap();
        ledger.set_status("run-2", RunStatus::Running).await.unwrap();
        ledger.set_current_step("run-2", Some("migrate")).await.unwrap();
    }

    let reopened = RunLedger::open(dir.clone()).await.unwrap();
    let record = reopened.get("run-2").await.unwrap();
    assert_eq!(record.status, RunStatus::RollbackFailed);
    assert!(record.current_step.is_none());
    assert!(record.rollback_error.is_some());
    assert!(record.finished_at.is_some());

    // Closed records are frozen
    assert!(matches!(
        reopened.set_status("run-2", RunStatus::RolledBack).await,
        Err(DeployError::LedgerError(_))
    ));

    // And the closure itself was persisted
    let again = RunLedger::open(dir.clone()).await.unwrap();
    assert_eq!(
        again.get("run-2").await.unwrap().status,
        RunStatus::RollbackFailed
    );

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_unreadable_record_is_skipped() {
    let dir = Dir::create_temp_dir("pushdeploy-ledger").await.unwrap();
    dir.file("garbage.json")
        .write_atomic(b"{not json")
        .await
        .unwrap();

    let ledger = RunLedger::open(dir.clone()).await.unwrap();
    assert!(ledger.list().await.is_empty());

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let ledger = RunLedger::in_memory();
    let err = assert_err!(ledger.set_status("run-x", RunStatus::Running).await);
    assert!(matches!(err, DeployError::NotFound(_)));
    assert!(ledger.get("run-x").await.is_none());
}

#[tokio::test]
async fn test_list_is_newest_first() {
    let ledger = RunLedger::in_memory();
    ledger
        .create(RunRecord::new("run-a", "web-1", "api", DeployContext::new("v1")))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    ledger
        .create(RunRecord::new("run-b", "web-1", "api", DeployContext::new("v2")))
        .await
        .unwrap();

    let ids: Vec<String> = ledger.list().await.into_iter().map(|s| s.run_id).collect();
    assert_eq!(ids, vec!["run-b", "run-a"]);
}
