//! Built-in actor logics.
//!
//! Machines are not the only behavior an actor can run. This module provides
//! the other shapes an invoked service commonly takes:
//!
//! - [`PromiseLogic`] runs one future to completion and becomes done with
//!   its output, or fails with its rejection.
//! - [`CallbackLogic`] bridges an external event source: it can push events
//!   to its parent and handle events the parent sends it.
//! - [`ObservableLogic`] publishes a snapshot per emitted value and
//!   completes when the source does.
//! - [`ReducerLogic`] folds received events into a state value.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};

use harel_core::Event;

use crate::cell::ActorRef;
use crate::error::ActorError;
use crate::logic::{ActorLogic, ActorScope};
use crate::snapshot::{ActorStatus, Snapshot};

const PROMISE_RESOLVED: &str = "$promise.resolve";
const PROMISE_REJECTED: &str = "$promise.reject";
const OBSERVABLE_NEXT: &str = "$observable.next";
const OBSERVABLE_COMPLETE: &str = "$observable.complete";
const OBSERVABLE_ERROR: &str = "$observable.error";

/// Cleanup hook returned by callback and observable setups, invoked once
/// when the actor stops.
pub type Teardown = Box<dyn FnOnce() + Send>;

type PromiseFuture = Pin<Box<dyn Future<Output = Result<Value, Value>> + Send>>;

fn field_event(event_type: &str, field: &str, value: Value) -> Event {
    let mut payload = Map::new();
    payload.insert(field.to_string(), value);
    Event {
        event_type: event_type.to_string(),
        payload,
    }
}

/// Runs a future as an actor. Requires a tokio runtime; the future is
/// spawned on start and aborted if the actor stops first.
///
/// Resolution makes the actor done with the resolved value as output;
/// rejection fails it, delivering `error.platform.<id>` to the parent with
/// the rejection value.
pub struct PromiseLogic {
    future: Option<PromiseFuture>,
    task: Option<tokio::task::JoinHandle<()>>,
    output: Option<Value>,
    settled: bool,
}

impl PromiseLogic {
    pub fn new(future: impl Future<Output = Result<Value, Value>> + Send + 'static) -> Self {
        Self {
            future: Some(Box::pin(future)),
            task: None,
            output: None,
            settled: false,
        }
    }
}

impl ActorLogic for PromiseLogic {
    fn start(&mut self, scope: &mut ActorScope<'_>) -> Result<(), ActorError> {
        let Some(future) = self.future.take() else {
            return Ok(());
        };
        let actor = scope.self_ref();
        self.task = Some(tokio::spawn(async move {
            let event = match future.await {
                Ok(output) => field_event(PROMISE_RESOLVED, "output", output),
                Err(error) => field_event(PROMISE_REJECTED, "error", error),
            };
            actor.send(event);
        }));
        Ok(())
    }

    fn receive(&mut self, event: Event, scope: &mut ActorScope<'_>) -> Result<(), ActorError> {
        match event.event_type.as_str() {
            PROMISE_RESOLVED => {
                self.output = event.get("output").cloned();
                self.settled = true;
                Ok(())
            }
            PROMISE_REJECTED => {
                let error = event.get("error").cloned().unwrap_or(Value::Null);
                Err(ActorError::Rejected { error })
            }
            other => {
                tracing::debug!(actor = %scope.id(), event = %other, "promise actor ignores event");
                Ok(())
            }
        }
    }

    fn stop(&mut self, _scope: &mut ActorScope<'_>) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn snapshot(&self) -> Snapshot {
        let status = if self.future.is_some() {
            ActorStatus::NotStarted
        } else if self.settled {
            ActorStatus::Done
        } else {
            ActorStatus::Active
        };
        Snapshot {
            value: Value::Null,
            context: Value::Null,
            status,
            output: self.output.clone(),
            error: None,
            children: Vec::new(),
        }
    }
}

type Receiver = Arc<dyn Fn(&Event) + Send + Sync>;

/// Capabilities handed to a callback setup.
#[derive(Clone)]
pub struct CallbackHandle {
    actor_id: String,
    parent: Option<ActorRef>,
    receiver: Arc<Mutex<Option<Receiver>>>,
}

impl CallbackHandle {
    /// Sends an event up to the invoking parent.
    pub fn send_back(&self, event: Event) {
        match &self.parent {
            Some(parent) => parent.send(event),
            None => tracing::warn!(
                actor = %self.actor_id,
                event = %event.event_type,
                "callback send with no parent, dropping"
            ),
        }
    }

    /// Registers the handler for events sent to this actor. The last
    /// registration wins.
    pub fn on_receive(&self, f: impl Fn(&Event) + Send + Sync + 'static) {
        *self.receiver.lock() = Some(Arc::new(f));
    }
}

/// Bridges an external event source into the actor tree.
///
/// The setup closure runs on start; it typically wires a subscription or
/// spawns a task, registers a receive handler, and returns a teardown that
/// undoes the wiring when the actor stops. Callback actors never complete on
/// their own.
pub struct CallbackLogic {
    setup: Option<Box<dyn FnOnce(CallbackHandle) -> Option<Teardown> + Send>>,
    teardown: Option<Teardown>,
    receiver: Arc<Mutex<Option<Receiver>>>,
}

impl CallbackLogic {
    pub fn new(setup: impl FnOnce(CallbackHandle) -> Option<Teardown> + Send + 'static) -> Self {
        Self {
            setup: Some(Box::new(setup)),
            teardown: None,
            receiver: Arc::new(Mutex::new(None)),
        }
    }
}

impl ActorLogic for CallbackLogic {
    fn start(&mut self, scope: &mut ActorScope<'_>) -> Result<(), ActorError> {
        let Some(setup) = self.setup.take() else {
            return Ok(());
        };
        let handle = CallbackHandle {
            actor_id: scope.id().to_string(),
            parent: scope.parent(),
            receiver: Arc::clone(&self.receiver),
        };
        self.teardown = setup(handle);
        Ok(())
    }

    fn receive(&mut self, event: Event, _scope: &mut ActorScope<'_>) -> Result<(), ActorError> {
        // Clone out so a handler that re-registers does not deadlock.
        let receiver = self.receiver.lock().clone();
        if let Some(receiver) = receiver {
            receiver(&event);
        }
        Ok(())
    }

    fn stop(&mut self, _scope: &mut ActorScope<'_>) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }

    fn snapshot(&self) -> Snapshot {
        if self.setup.is_some() {
            Snapshot::not_started()
        } else {
            Snapshot::active()
        }
    }
}

/// Emission side of an observable actor, cloneable into tasks and
/// subscriptions.
#[derive(Clone)]
pub struct ObservableEmitter {
    actor: ActorRef,
}

impl ObservableEmitter {
    pub fn next(&self, value: Value) {
        self.actor.send(field_event(OBSERVABLE_NEXT, "value", value));
    }

    pub fn complete(&self) {
        self.actor.send(Event::new(OBSERVABLE_COMPLETE));
    }

    pub fn error(&self, error: Value) {
        self.actor.send(field_event(OBSERVABLE_ERROR, "error", error));
    }
}

/// Publishes one snapshot per emitted value.
///
/// The setup closure receives an [`ObservableEmitter`] and returns an
/// optional teardown. Each `next` value lands in the snapshot context;
/// `complete` makes the actor done, `error` fails it.
pub struct ObservableLogic {
    setup: Option<Box<dyn FnOnce(ObservableEmitter) -> Option<Teardown> + Send>>,
    teardown: Option<Teardown>,
    last: Value,
    done: bool,
}

impl ObservableLogic {
    pub fn new(setup: impl FnOnce(ObservableEmitter) -> Option<Teardown> + Send + 'static) -> Self {
        Self {
            setup: Some(Box::new(setup)),
            teardown: None,
            last: Value::Null,
            done: false,
        }
    }
}

impl ActorLogic for ObservableLogic {
    fn start(&mut self, scope: &mut ActorScope<'_>) -> Result<(), ActorError> {
        let Some(setup) = self.setup.take() else {
            return Ok(());
        };
        let emitter = ObservableEmitter {
            actor: scope.self_ref(),
        };
        self.teardown = setup(emitter);
        Ok(())
    }

    fn receive(&mut self, event: Event, scope: &mut ActorScope<'_>) -> Result<(), ActorError> {
        match event.event_type.as_str() {
            OBSERVABLE_NEXT => {
                self.last = event.get("value").cloned().unwrap_or(Value::Null);
                Ok(())
            }
            OBSERVABLE_COMPLETE => {
                self.done = true;
                Ok(())
            }
            OBSERVABLE_ERROR => {
                let error = event.get("error").cloned().unwrap_or(Value::Null);
                Err(ActorError::Rejected { error })
            }
            other => {
                tracing::debug!(actor = %scope.id(), event = %other, "observable actor ignores event");
                Ok(())
            }
        }
    }

    fn stop(&mut self, _scope: &mut ActorScope<'_>) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }

    fn snapshot(&self) -> Snapshot {
        let status = if self.setup.is_some() {
            ActorStatus::NotStarted
        } else if self.done {
            ActorStatus::Done
        } else {
            ActorStatus::Active
        };
        Snapshot {
            value: Value::Null,
            context: self.last.clone(),
            status,
            output: None,
            error: None,
            children: Vec::new(),
        }
    }
}

/// Folds received events into a state value. Never completes on its own;
/// useful as an event sink or a tiny store.
pub struct ReducerLogic {
    state: Value,
    reduce: Box<dyn Fn(&Value, &Event) -> Value + Send>,
    started: bool,
}

impl ReducerLogic {
    pub fn new(initial: Value, reduce: impl Fn(&Value, &Event) -> Value + Send + 'static) -> Self {
        Self {
            state: initial,
            reduce: Box::new(reduce),
            started: false,
        }
    }
}

impl ActorLogic for ReducerLogic {
    fn start(&mut self, _scope: &mut ActorScope<'_>) -> Result<(), ActorError> {
        self.started = true;
        Ok(())
    }

    fn receive(&mut self, event: Event, _scope: &mut ActorScope<'_>) -> Result<(), ActorError> {
        self.state = (self.reduce)(&self.state, &event);
        Ok(())
    }

    fn stop(&mut self, _scope: &mut ActorScope<'_>) {}

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            value: Value::Null,
            context: self.state.clone(),
            status: if self.started {
                ActorStatus::Active
            } else {
                ActorStatus::NotStarted
            },
            output: None,
            error: None,
            children: Vec::new(),
        }
    }
}
