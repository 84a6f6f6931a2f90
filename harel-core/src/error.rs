//! Core error types.

use thiserror::Error;

/// Errors from machine compilation and the transition engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid machine definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("duplicate state id: {id}")]
    DuplicateStateId { id: String },

    #[error("unresolvable transition target '{target}' from state '{state}'")]
    UnresolvableTarget { target: String, state: String },

    #[error("invalid expression: {reason}")]
    InvalidExpr { reason: String },

    #[error("missing guard implementation: {name}")]
    MissingGuard { name: String },

    #[error("missing action implementation: {name}")]
    MissingAction { name: String },

    #[error("missing delay implementation: {name}")]
    MissingDelay { name: String },

    #[error("missing actor logic: {src}")]
    MissingActorLogic { src: String },

    #[error("action '{action}' failed: {reason}")]
    ActionFailed { action: String, reason: String },

    #[error("eventless transition limit exceeded: {limit} microsteps in one macrostep")]
    TransitionLoop { limit: usize },

    #[error("computed context cycle involving field '{field}'")]
    ContextCycle { field: String },

    #[error("invalid snapshot: {reason}")]
    InvalidSnapshot { reason: String },

    #[error("effect failed: {reason}")]
    EffectFailed { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CoreError {
    /// Returns an error code suitable for programmatic matching.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            CoreError::DuplicateStateId { .. } => "DUPLICATE_STATE_ID",
            CoreError::UnresolvableTarget { .. } => "UNRESOLVABLE_TARGET",
            CoreError::InvalidExpr { .. } => "INVALID_EXPR",
            CoreError::MissingGuard { .. } => "MISSING_GUARD",
            CoreError::MissingAction { .. } => "MISSING_ACTION",
            CoreError::MissingDelay { .. } => "MISSING_DELAY",
            CoreError::MissingActorLogic { .. } => "MISSING_ACTOR_LOGIC",
            CoreError::ActionFailed { .. } => "ACTION_FAILED",
            CoreError::TransitionLoop { .. } => "TRANSITION_LOOP",
            CoreError::ContextCycle { .. } => "CONTEXT_CYCLE",
            CoreError::InvalidSnapshot { .. } => "INVALID_SNAPSHOT",
            CoreError::EffectFailed { .. } => "EFFECT_FAILED",
            CoreError::Json(_) => "BAD_DEFINITION_JSON",
            CoreError::Yaml(_) => "BAD_DEFINITION_YAML",
        }
    }

    /// Returns whether this error indicates a problem in the machine
    /// definition itself rather than in runtime input.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidDefinition { .. }
                | CoreError::DuplicateStateId { .. }
                | CoreError::UnresolvableTarget { .. }
                | CoreError::InvalidExpr { .. }
                | CoreError::ContextCycle { .. }
                | CoreError::Json(_)
                | CoreError::Yaml(_)
        )
    }
}
