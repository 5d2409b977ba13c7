//! # Task Engine
//!
//! Spawning, state transitions, phase execution, child coordination and
//! event delivery.

pub mod coordinator;
pub mod events;
pub mod executor;
pub mod machine;
pub mod retry;
pub mod skill;

pub use coordinator::ChildCoordinator;
pub use events::{BroadcastEventBus, BusEvent, EventBus, TaskEvent, TaskEventKind};
pub use executor::{PollReport, TaskExecutor};
pub use machine::{StateChange, TaskEngine, TaskResult};
pub use retry::{Backoff, DefaultRetryPolicies, RetryDecision, RetryPolicy};
pub use skill::{FnSkill, Skill, SkillContext, SkillInvoker, SkillRegistry};
