//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::deploy::orchestrator::DeploymentRequest;
use crate::errors::DeployError;
use crate::models::run::{RunRecord, RunSummary, StepStatus};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// [`DeployError`] rendered as an HTTP response
pub struct ApiError(pub DeployError);

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DeployError::NotFound(_) => StatusCode::NOT_FOUND,
            DeployError::PlanError(_) => StatusCode::BAD_REQUEST,
            DeployError::ConcurrentDeployment { .. } | DeployError::LedgerError(_) => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "pushdeploy".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// Trigger response
#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub run_id: String,
}

/// Trigger a deployment
pub async fn trigger_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<DeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = state.orchestrator.trigger_deployment(request).await?;
    Ok((StatusCode::ACCEPTED, Json(TriggerResponse { run_id })))
}

/// Run listing response
#[derive(Debug, Serialize, Deserialize)]
pub struct RunsResponse {
    pub runs: Vec<RunSummary>,
    pub total: usize,
}

pub async fn list_runs_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let runs = state.orchestrator.list_runs().await;
    let total = runs.len();
    Json(RunsResponse { runs, total })
}

/// Per-step progress of a run
#[derive(Debug, Serialize, Deserialize)]
pub struct StepView {
    pub name: String,
    pub status: StepStatus,
}

/// A run record with its per-step view
#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    #[serde(flatten)]
    pub record: RunRecord,
    pub steps: Vec<StepView>,
}

pub async fn get_run_handler(
    State(state): State<Arc<ServerState>>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.orchestrator.get_run_record(&run_id).await?;

    // Plan order when the plan is still registered, ledger order otherwise
    let names: Vec<String> = match state.orchestrator.plans().get(&record.plan) {
        Some(plan) => plan
            .forward_steps()
            .iter()
            .map(|s| s.name.clone())
            .collect(),
        None => {
            let mut names: Vec<String> = Vec::new();
            for outcome in &record.outcomes {
                if !names.contains(&outcome.step_name) {
                    names.push(outcome.step_name.clone());
                }
            }
            names
        }
    };
    let steps = names
        .into_iter()
        .map(|name| StepView {
            status: record.step_status(&name),
            name,
        })
        .collect();

    Ok(Json(RunResponse { record, steps }))
}

pub async fn cancel_handler(
    State(state): State<Arc<ServerState>>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.cancel(&run_id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Names response
#[derive(Debug, Serialize, Deserialize)]
pub struct NamesResponse {
    pub names: Vec<String>,
}

pub async fn hosts_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(NamesResponse {
        names: state.orchestrator.host_names(),
    })
}

pub async fn plans_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(NamesResponse {
        names: state.orchestrator.plans().names(),
    })
}
