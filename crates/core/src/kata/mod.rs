//! # Kata Definitions
//!
//! The workflow language: source text is compiled into an immutable phase
//! graph, which the registry validates and persists.
//!
//! ```text
//! DSL text → compile() → CompiledKata → KataRegistry::register → KataStore
//! ```

pub mod error;
pub mod model;
pub mod parser;
pub mod registry;

pub use error::CompileError;
pub use model::{CompiledKata, KataKey, Phase, PhaseAction, RetrySetting, Transition};
pub use parser::compile;
pub use registry::{KataRegistry, RegistryError};
