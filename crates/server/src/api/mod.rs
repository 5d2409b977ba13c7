//! # JSON API
//!
//! Thin axum layer over the registry, engine and executor. Everything is
//! mounted under `/api/v1`.

pub mod events;
pub mod katas;
pub mod tasks;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use kata_core::{EngineError, KataRegistry, RegistryError, TaskEngine, TaskExecutor};
use serde_json::json;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub registry: KataRegistry,
    pub engine: TaskEngine,
    pub executor: TaskExecutor,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/katas", katas::kata_routes())
        .nest("/api/v1/tasks", tasks::task_routes())
        .nest("/api/v1/events", events::event_routes())
        .with_state(state)
}

/// Error body: `{"error": "..."}` with a status derived from the error kind
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, "{}", self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::KataNotFound(_) | EngineError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::TaskTerminal { .. } | EngineError::TaskBusy { .. } => StatusCode::CONFLICT,
            EngineError::InvalidTransition { .. } | EngineError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let status = match &err {
            RegistryError::Compile(_) | RegistryError::MissingSkills { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            RegistryError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;
