//! # Event API
//!
//! External event delivery. Publishing goes through the bus, so the
//! executor's listener wakes the tasks waiting on the topic.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use kata_core::{BusEvent, TaskEventKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ApiError, ApiResult, AppState};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
    /// Only wake this task
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub topic: String,
    pub accepted: bool,
}

pub fn event_routes() -> Router<AppState> {
    Router::new().route("/:topic", post(publish_event))
}

async fn publish_event(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    body: Option<Json<EventRequest>>,
) -> ApiResult<EventResponse> {
    if TaskEventKind::is_engine_topic(&topic) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("topic '{}' is reserved for engine events", topic),
        ));
    }

    let req = body.map(|Json(req)| req).unwrap_or_default();
    let mut event = BusEvent::external(topic.clone(), req.payload);
    if let Some(task_id) = req.task_id {
        event = event.for_task(task_id);
    }

    state.engine.bus().publish(event).await?;
    Ok(Json(EventResponse {
        topic,
        accepted: true,
    }))
}
