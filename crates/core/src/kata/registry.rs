//! # Kata Registry
//!
//! The only write path into the kata store: compile, pre-flight, persist.

use std::sync::Arc;
use thiserror::Error;

use super::error::CompileError;
use super::model::{CompiledKata, KataKey};
use super::parser::compile;
use crate::engine::skill::SkillInvoker;
use crate::state::KataStore;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("kata does not compile: {0}")]
    Compile(#[from] CompileError),

    #[error("kata {kata} requires unknown skills: {skills:?}")]
    MissingSkills { kata: KataKey, skills: Vec<String> },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Public entry point for registering katas
#[derive(Clone)]
pub struct KataRegistry {
    store: KataStore,
    skills: Option<Arc<dyn SkillInvoker>>,
}

impl KataRegistry {
    pub fn new(store: KataStore) -> Self {
        Self {
            store,
            skills: None,
        }
    }

    /// Reject katas whose required skills the invoker does not know
    pub fn with_skill_check(mut self, skills: Arc<dyn SkillInvoker>) -> Self {
        self.skills = Some(skills);
        self
    }

    /// Compile and persist, overwriting any kata with the same name and version
    pub fn register(&self, source: &str) -> Result<CompiledKata, RegistryError> {
        let kata = compile(source)?;

        if let Some(skills) = &self.skills {
            let missing: Vec<String> = kata
                .required_skills
                .iter()
                .filter(|id| !skills.has_skill(id))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(RegistryError::MissingSkills {
                    kata: kata.key(),
                    skills: missing,
                });
            }
        }

        self.store.save(&kata, Some(source))?;

        let children = kata.child_katas();
        for child in &children {
            if self.store.load(&child.name, child.version)?.is_none() {
                tracing::warn!(kata = %kata.key(), child = %child, "Registered kata spawns a kata that is not registered yet");
            }
        }

        tracing::info!(
            kata = %kata.key(),
            phases = kata.phases.len(),
            skills = kata.required_skills.len(),
            "Kata registered"
        );
        Ok(kata)
    }

    pub fn lookup(&self, name: &str, version: u32) -> anyhow::Result<Option<CompiledKata>> {
        self.store.load(name, version)
    }

    /// DSL text a kata was registered from
    pub fn source(&self, name: &str, version: u32) -> anyhow::Result<Option<String>> {
        self.store.source(name, version)
    }

    pub fn list(&self) -> anyhow::Result<Vec<KataKey>> {
        self.store.list()
    }
}
