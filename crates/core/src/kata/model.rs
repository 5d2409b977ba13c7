//! # Compiled Kata
//!
//! The immutable phase graph produced by the compiler. Every `next` target
//! is known to exist once a `CompiledKata` has been built, so the engine
//! never has to handle an unknown phase as a recoverable condition.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::engine::retry::RetryPolicy;

/// Identity of a kata: name plus version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KataKey {
    pub name: String,
    pub version: u32,
}

impl KataKey {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl std::fmt::Display for KataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}

/// What a phase does before following its transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseAction {
    /// Invoke one skill with the task's accumulated variables
    RunSkill { skill: String },
    /// Spawn a child task and block until it finishes
    SpawnKata { kata: String, version: u32 },
    /// Block until the named external event is delivered
    AwaitEvent { event: String },
}

/// The single outgoing edge of a phase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "phase", rename_all = "snake_case")]
pub enum Transition {
    Next(String),
    Complete,
}

/// A retry setting as written in the source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrySetting {
    /// An explicit policy (`retry none`, `retry 3 exponential 1s`)
    Policy(RetryPolicy),
    /// `retry default`: defer to the engine configuration
    EngineDefault,
}

/// One node of the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Phase {
    pub name: String,
    #[serde(default)]
    pub action: Option<PhaseAction>,
    pub transition: Transition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySetting>,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self.transition, Transition::Complete)
    }

    pub fn next_phase(&self) -> Option<&str> {
        match &self.transition {
            Transition::Next(phase) => Some(phase),
            Transition::Complete => None,
        }
    }
}

/// A validated, immutable workflow definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompiledKata {
    pub name: String,
    pub version: u32,
    pub required_skills: BTreeSet<String>,
    pub phases: BTreeMap<String, Phase>,
    pub initial_phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_retry: Option<RetrySetting>,
}

impl CompiledKata {
    pub fn key(&self) -> KataKey {
        KataKey::new(self.name.clone(), self.version)
    }

    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.get(name)
    }

    /// Child katas this kata may spawn
    pub fn child_katas(&self) -> Vec<KataKey> {
        self.phases
            .values()
            .filter_map(|p| match &p.action {
                Some(PhaseAction::SpawnKata { kata, version }) => {
                    Some(KataKey::new(kata.clone(), *version))
                }
                _ => None,
            })
            .collect()
    }
}
