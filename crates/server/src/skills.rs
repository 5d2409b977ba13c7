//! Builtin skills shipped with the host, so katas can run without any
//! external integration wired in.

use async_trait::async_trait;
use kata_core::engine::Skill;
use kata_core::{SkillContext, SkillRegistry};
use serde_json::Value;
use std::sync::Arc;

/// Returns the variables it was invoked with
pub struct EchoSkill;

#[async_trait]
impl Skill for EchoSkill {
    async fn run(&self, context: SkillContext) -> anyhow::Result<Value> {
        tracing::debug!(task_id = %context.task_id, phase = %context.phase, "echo");
        Ok(Value::Object(context.variables))
    }
}

/// Does nothing and returns `null`
pub struct NoopSkill;

#[async_trait]
impl Skill for NoopSkill {
    async fn run(&self, _context: SkillContext) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }
}

pub fn builtin_skills() -> SkillRegistry {
    let mut registry = SkillRegistry::new();
    registry.register("echo", Arc::new(EchoSkill));
    registry.register("noop", Arc::new(NoopSkill));
    registry
}
