//! # Kata Core
//!
//! A durable workflow engine. A kata is a named, versioned phase graph
//! written in a small DSL; a task is one execution of a kata. Tasks are
//! persisted in SQLite and advanced one phase at a time by a poll loop, so
//! they survive restarts and can be driven by several executors at once.
//!
//! ## Architecture
//!
//! - `kata/` - DSL compiler, compiled phase graph and the registry
//! - `state/` - SQLite stores for katas, tasks and the resumption queue
//! - `engine/` - State machine, executor, child coordination, retry and events
//! - `config` - Engine tunables
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kata_core::{EngineConfig, KataDb, KataRegistry, KataStore, SkillRegistry, TaskEngine, TaskExecutor};
//!
//! let db = KataDb::open_in_memory()?;
//! KataRegistry::new(KataStore::new(&db)).register(SOURCE)?;
//!
//! let config = EngineConfig::default();
//! let engine = TaskEngine::new(&db, Arc::new(BroadcastEventBus::default()), &config);
//! let executor = TaskExecutor::new(engine.clone(), Arc::new(skills), config);
//!
//! let task = engine.spawn("finance-audit", 1, None).await?;
//! executor.poll_and_execute().await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod kata;
pub mod state;

pub use config::EngineConfig;
pub use engine::{
    BroadcastEventBus, BusEvent, EventBus, PollReport, SkillContext, SkillInvoker, SkillRegistry,
    TaskEngine, TaskEvent, TaskEventKind, TaskExecutor, TaskResult,
};
pub use error::EngineError;
pub use kata::{compile, CompiledKata, CompileError, KataKey, KataRegistry, RegistryError};
pub use state::{KataDb, KataStore, Task, TaskState};
