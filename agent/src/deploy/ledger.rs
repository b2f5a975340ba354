//! Run ledger
//!
//! Append-only record of every deployment run. Outcomes are only ever
//! appended, and a record that reached a terminal status refuses further
//! writes. With a directory attached, each record is mirrored to
//! `<dir>/<run_id>.json` after every change.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::models::run::{RunRecord, RunStatus, RunSummary, StepOutcome};

const INTERRUPTED_REASON: &str = "orchestrator stopped mid-run; remote state unknown";

pub struct RunLedger {
    records: RwLock<HashMap<String, RunRecord>>,
    dir: Option<Dir>,
}

impl RunLedger {
    /// Ledger without persistence
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            dir: None,
        }
    }

    /// Load the records found in `dir` and persist future changes there
    ///
    /// Records left non-terminal by a previous process are closed as
    /// `rollback-failed`: nothing is driving them any more and the host may be
    /// half-deployed.
    pub async fn open(dir: Dir) -> Result<Self, DeployError> {
        dir.create().await?;

        let mut records = HashMap::new();
        let mut interrupted = Vec::new();
        for path in dir.list_files_with_ext("json").await? {
            let file = crate::filesys::file::File::new(&path);
            let mut record: RunRecord = match file.read_json().await {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping unreadable run record {}: {}", path.display(), e);
                    continue;
                }
            };
            if !record.status.is_terminal() {
                warn!(
                    "Run {} was {:?} when the orchestrator stopped; marking rollback-failed",
                    record.run_id, record.status
                );
                record.status = RunStatus::RollbackFailed;
                record.current_step = None;
                record.rollback_error = Some(INTERRUPTED_REASON.to_string());
                record.finished_at = Some(Utc::now());
                interrupted.push(record.clone());
            }
            records.insert(record.run_id.clone(), record);
        }

        info!("Loaded {} run record(s) from {}", records.len(), dir.path().display());

        let ledger = Self {
            records: RwLock::new(records),
            dir: Some(dir),
        };
        for record in &interrupted {
            ledger.persist(record).await;
        }
        Ok(ledger)
    }

    /// Insert a new record; returns `false` if the run id already exists
    pub async fn create(&self, record: RunRecord) -> Result<bool, DeployError> {
        {
            let mut records = self.records.write().await;
            if records.contains_key(&record.run_id) {
                return Ok(false);
            }
            records.insert(record.run_id.clone(), record.clone());
        }
        self.persist(&record).await;
        Ok(true)
    }

    pub async fn contains(&self, run_id: &str) -> bool {
        self.records.read().await.contains_key(run_id)
    }

    /// Snapshot of a run record
    pub async fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.records.read().await.get(run_id).cloned()
    }

    /// Summaries of all runs, newest first
    pub async fn list(&self) -> Vec<RunSummary> {
        let records = self.records.read().await;
        let mut summaries: Vec<RunSummary> = records.values().map(RunRecord::summary).collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    pub async fn append_outcome(&self, run_id: &str, outcome: StepOutcome) -> Result<(), DeployError> {
        self.mutate(run_id, |record| record.outcomes.push(outcome))
            .await
    }

    pub async fn set_status(&self, run_id: &str, status: RunStatus) -> Result<(), DeployError> {
        self.mutate(run_id, |record| {
            record.status = status;
            match status {
                RunStatus::Running => record.started_at = Some(Utc::now()),
                s if s.is_terminal() => {
                    record.current_step = None;
                    record.finished_at = Some(Utc::now());
                }
                _ => {}
            }
        })
        .await
    }

    pub async fn set_current_step(&self, run_id: &str, step: Option<&str>) -> Result<(), DeployError> {
        let step = step.map(str::to_string);
        self.mutate(run_id, |record| record.current_step = step)
            .await
    }

    pub async fn record_failure(&self, run_id: &str, step: &str, reason: &str) -> Result<(), DeployError> {
        self.mutate(run_id, |record| {
            record.failed_step = Some(step.to_string());
            record.failure_reason = Some(reason.to_string());
        })
        .await
    }

    pub async fn record_rollback_error(&self, run_id: &str, detail: &str) -> Result<(), DeployError> {
        self.mutate(run_id, |record| record.rollback_error = Some(detail.to_string()))
            .await
    }

    async fn mutate<F>(&self, run_id: &str, f: F) -> Result<(), DeployError>
    where
        F: FnOnce(&mut RunRecord),
    {
        let snapshot = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(run_id)
                .ok_or_else(|| DeployError::NotFound(format!("Run {}", run_id)))?;
            if record.status.is_terminal() {
                return Err(DeployError::LedgerError(format!(
                    "Run {} is {:?} and can no longer change",
                    run_id, record.status
                )));
            }
            f(record);
            record.clone()
        };
        self.persist(&snapshot).await;
        Ok(())
    }

    async fn persist(&self, record: &RunRecord) {
        let Some(dir) = &self.dir else {
            return;
        };
        let file = dir.file(&format!("{}.json", record.run_id));
        match file.write_json(record).await {
            Ok(()) => debug!("Persisted run {}", record.run_id),
            Err(e) => warn!("Failed to persist run {}: {}", record.run_id, e),
        }
    }
}
