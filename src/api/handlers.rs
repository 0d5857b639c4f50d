use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};

use crate::context::WorkflowContext;
use crate::model::WorkflowRun;
use crate::operator;

use super::AppState;
use super::errors::AppError;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /runs
pub async fn list_runs(State(state): State<Arc<AppState>>) -> Result<Json<Vec<WorkflowRun>>, AppError> {
    Ok(Json(state.run_store.list(None).await?))
}

/// GET /runs/{namespace}/{name}
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<WorkflowRun>, AppError> {
    state
        .run_store
        .get(&namespace, &name)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("run '{namespace}/{name}' not found")))
}

async fn load_run(state: &AppState, namespace: &str, name: &str) -> Result<WorkflowRun, AppError> {
    state
        .run_store
        .get(namespace, name)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("run '{namespace}/{name}' not found")))
}

/// POST /runs/{namespace}/{name}/suspend
pub async fn suspend_run(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<WorkflowRun>, AppError> {
    let mut run = load_run(&state, &namespace, &name).await?;
    operator::suspend(&mut run)?;
    state.run_store.put(&run).await?;
    Ok(Json(run))
}

/// POST /runs/{namespace}/{name}/resume
pub async fn resume_run(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<WorkflowRun>, AppError> {
    let mut run = load_run(&state, &namespace, &name).await?;
    operator::resume(&mut run)?;
    state.run_store.put(&run).await?;
    Ok(Json(run))
}

/// POST /runs/{namespace}/{name}/terminate
pub async fn terminate_run(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<WorkflowRun>, AppError> {
    let mut run = load_run(&state, &namespace, &name).await?;
    operator::terminate(&mut run)?;
    state.run_store.put(&run).await?;
    Ok(Json(run))
}

#[derive(Deserialize, Default)]
pub struct RestartRequest {
    /// Restart from this failed step; omit for a full restart.
    #[serde(default)]
    pub step: Option<String>,
}

/// POST /runs/{namespace}/{name}/restart
pub async fn restart_run(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
    body: Option<Json<RestartRequest>>,
) -> Result<Json<WorkflowRun>, AppError> {
    let mut run = load_run(&state, &namespace, &name).await?;
    let step = body.and_then(|Json(req)| req.step);

    match step {
        Some(step_name) => {
            let mut ctx = WorkflowContext::load(&run, state.context_backend.clone()).await?;
            operator::restart_partial(&mut run, &step_name, &mut ctx).await?;
            ctx.commit().await?;
        }
        None => {
            operator::restart_full(&mut run, state.context_backend.clone()).await?;
        }
    }

    state.run_store.put(&run).await?;
    Ok(Json(run))
}

/// DELETE /runs/{namespace}/{name}
pub async fn delete_run(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    load_run(&state, &namespace, &name).await?;
    state.run_store.delete(&namespace, &name).await?;
    Ok(Json(serde_json::json!({ "deleted": format!("{namespace}/{name}") })))
}
