//! Engine errors surfaced by the spawn/execute/cancel API.

use thiserror::Error;

use crate::kata::KataKey;
use crate::state::TaskState;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("kata {0} not found")]
    KataNotFound(KataKey),

    #[error("task '{0}' not found")]
    TaskNotFound(String),

    #[error("task '{task_id}' is {state} and can no longer change")]
    TaskTerminal { task_id: String, state: TaskState },

    #[error("task '{task_id}' is executing a phase, try again later")]
    TaskBusy { task_id: String },

    /// A programming error: the engine attempted an edge the state machine forbids
    #[error("illegal transition {from} -> {to} for task '{task_id}'")]
    InvalidTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
