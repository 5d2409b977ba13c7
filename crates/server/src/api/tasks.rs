//! # Task API
//!
//! Spawn, inspect, drive and cancel tasks.

use axum::{
    extract::{Path, State},
    routing::{get, patch, post},
    Json, Router,
};
use kata_core::{Task, TaskResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ApiResult, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub kata_name: String,
    pub kata_version: u32,
    #[serde(default)]
    pub variables: Option<Map<String, Value>>,
}

/// Result of a manual execution; `executed` is false when the task could
/// not be claimed
#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub executed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    pub task: Task,
}

pub fn task_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(spawn_task))
        .route("/:id", get(get_task))
        .route("/:id/children", get(list_children))
        .route("/:id/execute", post(execute_task))
        .route("/:id/cancel", post(cancel_task))
        .route("/:id/variables", patch(update_variables))
}

async fn spawn_task(State(state): State<AppState>, Json(req): Json<SpawnRequest>) -> ApiResult<Task> {
    let task = state
        .engine
        .spawn(&req.kata_name, req.kata_version, req.variables)
        .await?;
    Ok(Json(task))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Task> {
    Ok(Json(state.engine.get(&id)?))
}

async fn list_children(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<Task>> {
    state.engine.get(&id)?;
    Ok(Json(state.engine.tasks().list_children(&id)?))
}

async fn execute_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ExecuteResponse> {
    let result = state.executor.execute_phase(&id).await?;
    let task = state.engine.get(&id)?;
    Ok(Json(ExecuteResponse {
        executed: result.is_some(),
        result,
        task,
    }))
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Task> {
    Ok(Json(state.engine.cancel(&id).await?))
}

async fn update_variables(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(partial): Json<Map<String, Value>>,
) -> ApiResult<Task> {
    Ok(Json(state.engine.update_variables(&id, partial).await?))
}
