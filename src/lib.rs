//! # harel
//!
//! Statecharts for Rust: hierarchical and parallel states, guarded,
//! delayed, and eventless transitions, history, and a mailbox-based actor
//! runtime with invoked children, subscriptions, and persistence.
//!
//! This crate is a facade. The interpreter lives in `harel-core` and steps
//! machines as pure values; the runtime lives in `harel-actor` and gives
//! them mailboxes, timers, and supervision. Everything public from both is
//! re-exported here.
//!
//! ```no_run
//! use harel::{ActorSystem, Event, Machine};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let machine = Machine::from_json(&json!({
//!     "id": "toggle",
//!     "initial": "inactive",
//!     "context": {"count": 0},
//!     "states": {
//!         "inactive": {"on": {"TOGGLE": {"target": "active"}}},
//!         "active": {
//!             "entry": [{
//!                 "type": "assign",
//!                 "set": {"count": {"$expr": "ctx.count + 1"}}
//!             }],
//!             "on": {"TOGGLE": {"target": "inactive"}}
//!         }
//!     }
//! }))?;
//!
//! let system = ActorSystem::new();
//! system.register_machine("toggle", machine);
//!
//! let toggle = system.spawn("toggle")?;
//! toggle.start()?;
//! toggle.send(Event::new("TOGGLE"));
//! assert_eq!(toggle.get_snapshot().context, json!({"count": 1}));
//! # Ok(())
//! # }
//! ```

pub use harel_core::{
    descriptor_matches, initialize, macrostep, resolve_initial_context, Action, ActionDef,
    AssignSpec, Configuration, CoreError, Delay, DynValue, EffectRunner, Event, EventTemplate,
    Guard, GuardFn, Implementations, InvokeDef, Machine, MachineDef, MachineState, MachineStatus,
    NodeId, NoopRunner, SendDest, StateDef, StateKind, StateNode, StateValue, Transition,
    TransitionDef, DEFAULT_EVENTLESS_LIMIT,
};

pub use harel_actor::{
    ActorError, ActorLogic, ActorLogicFactory, ActorRef, ActorScope, ActorStatus, ActorSystem,
    CallbackHandle, CallbackLogic, InspectionEvent, InspectionObserver, Inspector, MachineFactory,
    MachineLogic, ManualClock, ObservableEmitter, ObservableLogic, Observer, PersistedSnapshot,
    PromiseLogic, ReducerLogic, Snapshot, SpawnOptions, Subscription, SystemOptions, Teardown,
    TimerDriver, TokioTimers,
};
