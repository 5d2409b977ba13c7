pub mod db;
pub mod kata_state;
pub mod resumption;
pub mod task_state;

pub use db::KataDb;

pub use kata_state::KataStore;
pub use resumption::{Resumption, ResumptionKind, ResumptionOutcome};
pub use task_state::{Task, TaskState, TaskStore, VariablesUpdate};
