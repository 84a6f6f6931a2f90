//! # harel-actor
//!
//! Actor runtime for `harel-core` state machines.
//!
//! A machine interpreted by `harel-core` is a pure value; this crate gives
//! it a life: mailboxes, parent-child trees, timers, subscriptions, and
//! persistence. Actors process events run-to-completion and publish one
//! snapshot per settled event.
//!
//! This crate provides:
//! - [`ActorSystem`]: logic registry, actor registry, timers, inspection
//! - [`ActorRef`]: start, stop, send, subscribe, snapshot access
//! - [`MachineLogic`] plus promise, callback, observable, and reducer
//!   behaviors behind the [`ActorLogic`] trait
//! - [`PersistedSnapshot`]: durable actor trees and [`ActorSystem::restore`]
//! - [`TimerDriver`]: injectable clock, with [`TokioTimers`] for production
//!   and [`ManualClock`] for deterministic tests
//!
//! ```no_run
//! use harel_actor::ActorSystem;
//! use harel_core::{Event, Machine};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let system = ActorSystem::new();
//! system.register_machine(
//!     "light",
//!     Machine::from_json(&json!({
//!         "id": "light",
//!         "initial": "green",
//!         "states": {
//!             "green": {"on": {"TIMER": {"target": "yellow"}}},
//!             "yellow": {"on": {"TIMER": {"target": "red"}}},
//!             "red": {"on": {"TIMER": {"target": "green"}}}
//!         }
//!     }))?,
//! );
//!
//! let light = system.spawn("light")?;
//! light.start()?;
//! light.send(Event::new("TIMER"));
//! assert_eq!(light.get_snapshot().value, json!("yellow"));
//! # Ok(())
//! # }
//! ```

pub mod actors;
pub mod cell;
pub mod error;
pub mod inspect;
pub mod logic;
pub mod persist;
pub mod snapshot;
pub mod system;
pub mod timers;

pub use actors::{
    CallbackHandle, CallbackLogic, ObservableEmitter, ObservableLogic, PromiseLogic, ReducerLogic,
    Teardown,
};
pub use cell::{ActorRef, Observer, Subscription};
pub use error::ActorError;
pub use inspect::{InspectionEvent, InspectionObserver, Inspector};
pub use logic::{ActorLogic, ActorScope, MachineLogic};
pub use persist::PersistedSnapshot;
pub use snapshot::{ActorStatus, Snapshot};
pub use system::{ActorLogicFactory, ActorSystem, MachineFactory, SpawnOptions, SystemOptions};
pub use timers::{ManualClock, TimerDriver, TokioTimers};
