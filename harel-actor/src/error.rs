//! Error types for the actor runtime.

use serde_json::Value;
use thiserror::Error;

use harel_core::CoreError;

/// Errors surfaced by the actor runtime.
///
/// Failures that happen while an actor processes an event do not bubble out
/// of [`send`](crate::ActorRef::send); they move the actor into the error
/// status and notify its parent and subscribers. This type covers the
/// operations that return results directly, such as spawning and restoring.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Interpreter error from the state machine core.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Snapshot payload could not be serialized or deserialized.
    #[error("snapshot JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("actor '{id}' already started")]
    AlreadyStarted { id: String },

    #[error("actor id '{id}' already exists")]
    DuplicateActor { id: String },

    #[error("no actor logic registered under '{src}'")]
    UnknownLogic { src: String },

    #[error("logic '{src}' does not support restore")]
    RestoreUnsupported { src: String },

    #[error("actor system has shut down")]
    SystemShutDown,

    /// Structured failure raised by an actor logic, such as a rejected
    /// promise. The payload is preserved so parents and subscribers see the
    /// original value rather than a stringified message.
    #[error("actor failed: {error}")]
    Rejected { error: Value },
}

impl ActorError {
    /// Returns an error code suitable for programmatic matching.
    pub fn error_code(&self) -> &'static str {
        match self {
            ActorError::Core(e) => e.error_code(),
            ActorError::Json(_) => "BAD_SNAPSHOT_JSON",
            ActorError::AlreadyStarted { .. } => "ALREADY_STARTED",
            ActorError::DuplicateActor { .. } => "DUPLICATE_ACTOR",
            ActorError::UnknownLogic { .. } => "UNKNOWN_LOGIC",
            ActorError::RestoreUnsupported { .. } => "RESTORE_UNSUPPORTED",
            ActorError::SystemShutDown => "SYSTEM_SHUT_DOWN",
            ActorError::Rejected { .. } => "ACTOR_REJECTED",
        }
    }

    /// Failure payload delivered to `error.platform` handlers and error
    /// subscribers. Structured rejections keep their value; everything else
    /// is reported as a message string.
    pub fn to_error_value(&self) -> Value {
        match self {
            ActorError::Rejected { error } => error.clone(),
            other => Value::String(other.to_string()),
        }
    }
}
