//! # harel-core
//!
//! Statechart engine for harel.
//!
//! This crate provides:
//! - Machine definition parsing and validation (JSON and YAML)
//! - Compilation to an indexed state tree with stable checksums
//! - Guard expressions and named guard/action/delay implementations
//! - The microstep/macrostep transition algorithm with entry/exit
//!   ordering, history, and done events
//! - State values, initial context resolution, and snapshot restore

pub mod action;
pub mod context;
pub mod definition;
pub mod error;
pub mod event;
pub mod expr;
pub mod guard;
pub mod machine;
pub mod macrostep;
mod microstep;
pub mod state_value;
pub mod value;

pub use action::{Action, AssignSpec, Delay, EventTemplate, SendDest};
pub use context::resolve_initial_context;
pub use definition::{ActionDef, InvokeDef, MachineDef, StateDef, TransitionDef};
pub use error::CoreError;
pub use event::{descriptor_matches, Event};
pub use guard::{Guard, GuardFn};
pub use machine::{
    Configuration, Implementations, Machine, NodeId, StateKind, StateNode, Transition,
    DEFAULT_EVENTLESS_LIMIT,
};
pub use macrostep::{
    initialize, macrostep, EffectRunner, MachineState, MachineStatus, NoopRunner,
};
pub use state_value::StateValue;
pub use value::DynValue;
