//! Server state

use std::sync::Arc;

use crate::deploy::orchestrator::DeploymentOrchestrator;

/// Server state shared across handlers
pub struct ServerState {
    pub orchestrator: Arc<DeploymentOrchestrator>,
}

impl ServerState {
    pub fn new(orchestrator: Arc<DeploymentOrchestrator>) -> Self {
        Self { orchestrator }
    }
}
