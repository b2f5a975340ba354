//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::cache::plans::PlanRegistry;
use crate::deploy::credentials::{ChainedCredentials, CredentialResolver, EnvCredentials};
use crate::deploy::executor::{RemoteExecutor, SshExecutor};
use crate::deploy::ledger::RunLedger;
use crate::deploy::orchestrator::DeploymentOrchestrator;
use crate::errors::DeployError;
use crate::storage::layout::StorageLayout;

use super::options::AppOptions;

/// Main application state
pub struct AppState {
    /// Validated plans
    pub plans: Arc<PlanRegistry>,

    /// Run ledger
    pub ledger: Arc<RunLedger>,

    /// Deployment orchestrator
    pub orchestrator: Arc<DeploymentOrchestrator>,
}

impl AppState {
    /// Initialize application state with the ssh executor
    pub async fn init(
        options: &AppOptions,
        credentials: Arc<dyn CredentialResolver>,
    ) -> Result<Self, DeployError> {
        let credentials: Arc<dyn CredentialResolver> = Arc::new(ChainedCredentials::new(vec![
            credentials,
            Arc::new(EnvCredentials::default()),
        ]));
        let executor = Arc::new(SshExecutor::new(options.ssh.clone(), credentials));
        Self::init_with_executor(options, executor).await
    }

    /// Initialize application state around any executor
    pub async fn init_with_executor(
        options: &AppOptions,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Result<Self, DeployError> {
        info!("Initializing application state...");
        let layout: &StorageLayout = &options.layout;
        layout.setup().await?;

        let plans = Arc::new(PlanRegistry::new());
        let report = plans.load_dir(&layout.plans_dir()).await?;
        info!(
            "Loaded {} plan(s), {} rejected",
            report.loaded.len(),
            report.rejected.len()
        );

        let ledger = Arc::new(RunLedger::open(layout.runs_dir()).await?);

        let orchestrator = Arc::new(DeploymentOrchestrator::new(
            options.hosts.clone(),
            plans.clone(),
            executor,
            ledger.clone(),
            options.orchestrator.clone(),
        ));

        Ok(Self {
            plans,
            ledger,
            orchestrator,
        })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), DeployError> {
        info!("Shutting down application state...");
        self.orchestrator.shutdown().await;
        Ok(())
    }
}
