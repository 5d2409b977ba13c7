//! Compile errors for kata source text.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("empty kata source")]
    EmptySource,

    #[error("line {line}: expected `kata <name> v<version>` header")]
    MissingHeader { line: usize },

    #[error("line {line}: invalid kata header: {reason}")]
    InvalidHeader { line: usize, reason: String },

    #[error("line {line}: invalid version '{value}', expected v<number>")]
    InvalidVersion { line: usize, value: String },

    #[error("line {line}: unknown directive '{directive}'")]
    UnknownDirective { line: usize, directive: String },

    #[error("line {line}: malformed '{directive}' directive, expected `{expected}`")]
    MalformedDirective {
        line: usize,
        directive: String,
        expected: &'static str,
    },

    #[error("line {line}: '{directive}' must appear inside a phase block")]
    DirectiveOutsidePhase { line: usize, directive: String },

    #[error("line {line}: '{directive}' must appear before the first phase")]
    HeaderDirectiveInPhase { line: usize, directive: String },

    #[error("line {line}: duplicate phase name '{phase}' (first declared on line {first})")]
    DuplicatePhase {
        line: usize,
        phase: String,
        first: usize,
    },

    #[error("line {line}: initial phase declared more than once")]
    DuplicateInitial { line: usize },

    #[error("missing `initial <phase>` declaration")]
    MissingInitialPhase,

    #[error("line {line}: initial phase '{phase}' is not defined")]
    UnknownInitialPhase { line: usize, phase: String },

    #[error("line {line}: phase '{phase}' references unknown phase '{target}'")]
    UnknownPhaseReference {
        line: usize,
        phase: String,
        target: String,
    },

    #[error("line {line}: phase '{phase}' already has an action")]
    MultipleActions { line: usize, phase: String },

    #[error("line {line}: phase '{phase}' already has a terminal directive")]
    MultipleTerminals { line: usize, phase: String },

    #[error("line {line}: phase '{phase}' has no terminal directive (`next <phase>` or `complete`)")]
    MissingTerminal { line: usize, phase: String },

    #[error("line {line}: invalid identifier '{value}'")]
    InvalidIdentifier { line: usize, value: String },

    #[error("line {line}: invalid retry policy: {reason}")]
    InvalidRetryPolicy { line: usize, reason: String },

    #[error("kata '{kata}' defines no phases")]
    NoPhases { kata: String },
}

impl CompileError {
    /// Source line the error points at, when it has one
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::EmptySource | Self::MissingInitialPhase | Self::NoPhases { .. } => None,
            Self::MissingHeader { line }
            | Self::InvalidHeader { line, .. }
            | Self::InvalidVersion { line, .. }
            | Self::UnknownDirective { line, .. }
            | Self::MalformedDirective { line, .. }
            | Self::DirectiveOutsidePhase { line, .. }
            | Self::HeaderDirectiveInPhase { line, .. }
            | Self::DuplicatePhase { line, .. }
            | Self::DuplicateInitial { line }
            | Self::UnknownInitialPhase { line, .. }
            | Self::UnknownPhaseReference { line, .. }
            | Self::MultipleActions { line, .. }
            | Self::MultipleTerminals { line, .. }
            | Self::MissingTerminal { line, .. }
            | Self::InvalidIdentifier { line, .. }
            | Self::InvalidRetryPolicy { line, .. } => Some(*line),
        }
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;
