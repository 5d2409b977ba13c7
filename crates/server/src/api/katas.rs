//! # Kata API
//!
//! Register DSL sources, list what is registered and read it back.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use kata_core::{CompiledKata, KataKey};

use super::{ApiError, ApiResult, AppState};

pub fn kata_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_katas).post(register_kata))
        .route("/:name/:version", get(get_kata))
        .route("/:name/:version/source", get(get_kata_source))
}

/// Body is the raw DSL text
async fn register_kata(State(state): State<AppState>, source: String) -> ApiResult<CompiledKata> {
    Ok(Json(state.registry.register(&source)?))
}

async fn list_katas(State(state): State<AppState>) -> ApiResult<Vec<KataKey>> {
    Ok(Json(state.registry.list()?))
}

async fn get_kata(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, u32)>,
) -> ApiResult<CompiledKata> {
    state
        .registry
        .lookup(&name, version)?
        .map(Json)
        .ok_or_else(|| not_found(name, version))
}

/// Plain-text DSL the kata was registered from
async fn get_kata_source(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, u32)>,
) -> Result<String, ApiError> {
    state
        .registry
        .source(&name, version)?
        .ok_or_else(|| not_found(name, version))
}

fn not_found(name: String, version: u32) -> ApiError {
    ApiError::new(
        StatusCode::NOT_FOUND,
        format!("kata {} not found", KataKey::new(name, version)),
    )
}
