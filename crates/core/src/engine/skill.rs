//! # Skill Invocation
//!
//! The engine never implements skills itself. The host supplies a
//! [`SkillInvoker`]; [`SkillRegistry`] is the stock in-process invoker that
//! maps skill ids to handlers.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::state::Task;

/// Everything a skill gets to see about the task invoking it
#[derive(Debug, Clone, Serialize)]
pub struct SkillContext {
    pub task_id: String,
    pub kata_name: String,
    pub kata_version: u32,
    pub phase: String,
    /// Failed attempts so far for this phase
    pub attempt: u32,
    pub variables: Map<String, Value>,
}

impl SkillContext {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            kata_name: task.kata_name.clone(),
            kata_version: task.kata_version,
            phase: task.current_phase.clone(),
            attempt: task.attempt,
            variables: task.variables.clone(),
        }
    }
}

/// Executes a named skill; output is opaque to the engine
#[async_trait]
pub trait SkillInvoker: Send + Sync {
    async fn invoke(&self, skill_id: &str, context: SkillContext) -> Result<Value>;

    /// Used for registration pre-flight checks
    fn has_skill(&self, _skill_id: &str) -> bool {
        true
    }
}

/// A single skill handler
#[async_trait]
pub trait Skill: Send + Sync {
    async fn run(&self, context: SkillContext) -> Result<Value>;
}

/// Adapts an async closure into a [`Skill`]
pub struct FnSkill<F> {
    f: F,
}

impl<F> FnSkill<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Skill for FnSkill<F>
where
    F: Fn(SkillContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn run(&self, context: SkillContext) -> Result<Value> {
        (self.f)(context).await
    }
}

/// In-process skill table
#[derive(Clone, Default)]
pub struct SkillRegistry {
    skills: HashMap<String, Arc<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, skill: Arc<dyn Skill>) {
        self.skills.insert(id.into(), skill);
    }

    /// Builder-style registration of an async closure
    pub fn with_fn<F, Fut>(mut self, id: impl Into<String>, f: F) -> Self
    where
        F: Fn(SkillContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(id, Arc::new(FnSkill::new(f)));
        self
    }
}

#[async_trait]
impl SkillInvoker for SkillRegistry {
    async fn invoke(&self, skill_id: &str, context: SkillContext) -> Result<Value> {
        let skill = self
            .skills
            .get(skill_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown skill '{}'", skill_id))?;
        skill.run(context).await
    }

    fn has_skill(&self, skill_id: &str) -> bool {
        self.skills.contains_key(skill_id)
    }
}
