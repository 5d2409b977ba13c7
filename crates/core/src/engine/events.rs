//! # Task Events
//!
//! Lifecycle events published by the engine, and the bus they travel on.
//! The same bus carries host-supplied external events that wake tasks
//! blocked in `waiting_for_event`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::state::{Task, TaskState};

/// Kind of task event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskEventKind {
    #[serde(rename = "task.created")]
    Created,
    #[serde(rename = "task.state_changed")]
    StateChanged,
    #[serde(rename = "task.completed")]
    Completed,
    #[serde(rename = "task.failed")]
    Failed,
    #[serde(rename = "kata.task_spawned")]
    KataTaskSpawned,
    #[serde(rename = "kata.task_executed")]
    KataTaskExecuted,
}

impl TaskEventKind {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Created => "task.created",
            Self::StateChanged => "task.state_changed",
            Self::Completed => "task.completed",
            Self::Failed => "task.failed",
            Self::KataTaskSpawned => "kata.task_spawned",
            Self::KataTaskExecuted => "kata.task_executed",
        }
    }

    /// Topics the engine itself publishes
    pub fn is_engine_topic(topic: &str) -> bool {
        topic.starts_with("task.") || topic.starts_with("kata.")
    }
}

/// Observer-facing lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub kind: TaskEventKind,
    pub task_id: String,
    pub kata_name: String,
    pub kata_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<TaskState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(kind: TaskEventKind, task: &Task) -> Self {
        Self {
            kind,
            task_id: task.id.clone(),
            kata_name: task.kata_name.clone(),
            kata_version: task.kata_version,
            state: Some(task.state),
            previous_state: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn state_changed(task: &Task, previous: TaskState) -> Self {
        Self {
            previous_state: Some(previous),
            ..Self::new(TaskEventKind::StateChanged, task)
        }
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn to_bus_event(&self) -> BusEvent {
        BusEvent {
            topic: self.kind.topic().to_string(),
            task_id: Some(self.task_id.clone()),
            payload: serde_json::to_value(self).unwrap_or(Value::Null),
            timestamp: self.timestamp,
        }
    }
}

/// A message on the bus: engine lifecycle event or external event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub topic: String,
    /// Narrows an external event to one task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl BusEvent {
    pub fn external(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            task_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Parse the payload back into a lifecycle event, for engine topics
    pub fn task_event(&self) -> Option<TaskEvent> {
        if !TaskEventKind::is_engine_topic(&self.topic) {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Publish/subscribe seam supplied by the host
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: BusEvent) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<BusEvent>;
}

/// In-process bus on a tokio broadcast channel
pub struct BroadcastEventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: BusEvent) -> Result<()> {
        // No subscribers is fine
        let _ = self.tx.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}
