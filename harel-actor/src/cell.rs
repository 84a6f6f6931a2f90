//! Actor cells and references.
//!
//! An [`ActorCell`] owns everything runtime-side about one actor: the
//! mailbox, lifecycle status, behavior, children, subscribers, and the last
//! published snapshot. [`ActorRef`] is the cheap cloneable handle handed to
//! callers and relatives.
//!
//! Delivery is run-to-completion. Whichever thread enqueues into an idle
//! actor takes ownership of its mailbox and drains it; sends that arrive
//! while the actor is mid-event are queued and picked up by the draining
//! thread. Subscribers are notified once per processed event, after the
//! behavior has settled, never between microsteps.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use harel_core::Event;

use crate::error::ActorError;
use crate::inspect::InspectionEvent;
use crate::logic::{ActorLogic, ActorScope};
use crate::persist::PersistedSnapshot;
use crate::snapshot::{ActorStatus, Snapshot};
use crate::system::{ActorSystem, SystemInner};

/// Subscriber callbacks. All fields are optional; a bare `next` observer is
/// the common case and [`ActorRef::subscribe`] builds one directly.
#[derive(Clone, Default)]
pub struct Observer {
    /// Called with every published snapshot.
    pub next: Option<Arc<dyn Fn(&Snapshot) + Send + Sync>>,
    /// Called once if the actor fails, with the failure payload.
    pub error: Option<Arc<dyn Fn(&Value) + Send + Sync>>,
    /// Called once when the actor completes or is stopped.
    pub complete: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Observer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_next(mut self, f: impl Fn(&Snapshot) + Send + Sync + 'static) -> Self {
        self.next = Some(Arc::new(f));
        self
    }

    pub fn with_error(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    pub fn with_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Some(Arc::new(f));
        self
    }
}

/// Handle to an active subscription. Dropping the handle does not
/// unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    id: String,
    cell: Weak<ActorCell>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn unsubscribe(&self) {
        if let Some(cell) = self.cell.upgrade() {
            cell.observers.lock().remove(&self.id);
        }
    }
}

/// Child lifecycle work requested while an event is being processed,
/// applied once the behavior returns.
pub(crate) enum Deferred {
    StartChild(ActorRef),
    StopChild(ActorRef),
}

pub(crate) struct CellBody {
    pub(crate) logic: Box<dyn ActorLogic>,
    pub(crate) children: BTreeMap<String, ActorRef>,
}

pub(crate) struct ActorCell {
    /// Unique actor id within its system.
    id: String,
    /// Logic registration name this actor was spawned from.
    src: String,
    /// Spawning parent, absent for root actors.
    parent: Option<Weak<ActorCell>>,
    /// Owning system, weak so actor trees do not keep it alive.
    system: Weak<SystemInner>,
    /// Pending events in arrival order.
    mailbox: Mutex<VecDeque<Event>>,
    /// Held by the one thread currently draining the mailbox.
    processing: AtomicBool,
    /// Set when `start` is first called; later calls fail.
    started: AtomicBool,
    /// Set once the initial snapshot is out; gates mailbox draining so
    /// sends racing with `start` cannot observe a half-initialized actor.
    live: AtomicBool,
    /// Lifecycle status, authoritative over the logic's own view.
    status: Mutex<ActorStatus>,
    /// Behavior and live children. Locked while the logic runs.
    body: Mutex<CellBody>,
    /// Deferred child starts and stops for the current event.
    deferred: Mutex<Vec<Deferred>>,
    /// Last published snapshot.
    snapshot: Mutex<Arc<Snapshot>>,
    /// Subscribers keyed by subscription id.
    observers: Mutex<HashMap<String, Observer>>,
}

impl ActorCell {
    pub(crate) fn new(
        id: String,
        src: String,
        logic: Box<dyn ActorLogic>,
        parent: Option<Weak<ActorCell>>,
        system: Weak<SystemInner>,
    ) -> Arc<Self> {
        let snapshot = Arc::new(logic.snapshot());
        Arc::new(Self {
            id,
            src,
            parent,
            system,
            mailbox: Mutex::new(VecDeque::new()),
            processing: AtomicBool::new(false),
            started: AtomicBool::new(false),
            live: AtomicBool::new(false),
            status: Mutex::new(ActorStatus::NotStarted),
            body: Mutex::new(CellBody {
                logic,
                children: BTreeMap::new(),
            }),
            deferred: Mutex::new(Vec::new()),
            snapshot: Mutex::new(snapshot),
            observers: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn src(&self) -> &str {
        &self.src
    }

    pub(crate) fn status(&self) -> ActorStatus {
        *self.status.lock()
    }

    fn is_terminal(&self) -> bool {
        self.status.lock().is_terminal()
    }

    pub(crate) fn system(&self) -> Option<ActorSystem> {
        self.system.upgrade().map(ActorSystem::from_inner)
    }

    pub(crate) fn parent_ref(&self) -> Option<ActorRef> {
        self.parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(ActorRef::from_cell)
    }

    pub(crate) fn defer(&self, op: Deferred) {
        self.deferred.lock().push(op);
    }

    /// Queues an event without attempting to drain. Used for events raised
    /// from inside the actor's own processing.
    pub(crate) fn enqueue(&self, event: Event) {
        self.mailbox.lock().push_back(event);
    }

    pub(crate) fn send(self: &Arc<Self>, event: Event) {
        if self.is_terminal() {
            tracing::warn!(
                actor = %self.id,
                event = %event.event_type,
                "event for terminated actor, dropping"
            );
            return;
        }
        self.mailbox.lock().push_back(event);
        if self.live.load(Ordering::Acquire) {
            self.drain();
        }
    }

    pub(crate) fn start(self: &Arc<Self>) -> Result<(), ActorError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ActorError::AlreadyStarted {
                id: self.id.clone(),
            });
        }
        *self.status.lock() = ActorStatus::Active;
        tracing::debug!(actor = %self.id, src = %self.src, "actor starting");
        let result = {
            let mut body = self.body.lock();
            let CellBody { logic, children } = &mut *body;
            let mut scope = ActorScope {
                cell: self,
                children,
            };
            logic.start(&mut scope)
        };
        if let Err(e) = result {
            self.fail(e.to_error_value(), false);
            return Err(e);
        }
        self.run_deferred();
        self.publish();
        self.settle();
        self.live.store(true, Ordering::Release);
        self.drain();
        Ok(())
    }

    /// Marks a restored actor as already started in its persisted status.
    /// The initial transition does not run again and timers are not
    /// re-armed.
    pub(crate) fn adopt_persisted(self: &Arc<Self>, persisted: &PersistedSnapshot) {
        if persisted.status == ActorStatus::NotStarted {
            return;
        }
        self.started.store(true, Ordering::Release);
        *self.status.lock() = persisted.status;
        let snap = {
            let body = self.body.lock();
            let mut snap = body.logic.snapshot();
            snap.status = persisted.status;
            snap.error = persisted.error.clone();
            snap.children = body.children.keys().cloned().collect();
            Arc::new(snap)
        };
        *self.snapshot.lock() = Arc::clone(&snap);
        self.inspect(|| InspectionEvent::SnapshotPublished {
            id: self.id.clone(),
            snapshot: (*snap).clone(),
        });
        self.live.store(true, Ordering::Release);
        self.drain();
    }

    pub(crate) fn stop(self: &Arc<Self>) {
        {
            let mut status = self.status.lock();
            if status.is_terminal() {
                drop(status);
                // Already done or failed; stopping just retires the
                // registration.
                if let Some(system) = self.system() {
                    system.deregister(&self.id);
                }
                return;
            }
            *status = ActorStatus::Stopped;
        }
        tracing::debug!(actor = %self.id, "actor stopping");
        self.mailbox.lock().clear();
        self.cancel_timers();
        {
            let mut body = self.body.lock();
            let CellBody { logic, children } = &mut *body;
            let mut scope = ActorScope {
                cell: self,
                children,
            };
            logic.stop(&mut scope);
        }
        self.deferred.lock().clear();
        self.stop_children();
        let snap = {
            let body = self.body.lock();
            let mut snap = body.logic.snapshot();
            snap.status = ActorStatus::Stopped;
            snap.children = Vec::new();
            Arc::new(snap)
        };
        *self.snapshot.lock() = snap;
        self.notify_complete();
        self.inspect(|| InspectionEvent::ActorStopped {
            id: self.id.clone(),
        });
        if let Some(system) = self.system() {
            system.deregister(&self.id);
        }
    }

    pub(crate) fn subscribe(self: &Arc<Self>, observer: Observer) -> Subscription {
        let id = format!("sub-{}", Uuid::new_v4());
        self.observers.lock().insert(id.clone(), observer);
        Subscription {
            id,
            cell: Arc::downgrade(self),
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        (**self.snapshot.lock()).clone()
    }

    pub(crate) fn persisted(self: &Arc<Self>) -> PersistedSnapshot {
        let (snap, history, children) = {
            let body = self.body.lock();
            (
                body.logic.snapshot(),
                body.logic.history(),
                body.children
                    .iter()
                    .map(|(id, child)| (id.clone(), child.clone()))
                    .collect::<Vec<_>>(),
            )
        };
        let status = match *self.status.lock() {
            // The logic may already report done for an event still being
            // settled; trust it over the transient cell status.
            ActorStatus::Active => snap.status,
            other => other,
        };
        let error = match status {
            ActorStatus::Error => self.snapshot.lock().error.clone(),
            _ => None,
        };
        let children = children
            .into_iter()
            .map(|(id, child)| (id, child.get_persisted_snapshot()))
            .collect();
        PersistedSnapshot {
            src: self.src.clone(),
            status,
            value: snap.value,
            context: snap.context,
            output: snap.output,
            error,
            history,
            children,
        }
    }

    pub(crate) fn child(&self, id: &str) -> Option<ActorRef> {
        self.body.lock().children.get(id).cloned()
    }

    pub(crate) fn child_ids(&self) -> Vec<String> {
        self.body.lock().children.keys().cloned().collect()
    }

    pub(crate) fn attach_child(&self, id: String, child: ActorRef) {
        self.body.lock().children.insert(id, child);
    }

    /// Drains the mailbox if no other thread is already doing so.
    fn drain(self: &Arc<Self>) {
        loop {
            if self
                .processing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            loop {
                if self.is_terminal() {
                    break;
                }
                let next = self.mailbox.lock().pop_front();
                let Some(event) = next else { break };
                self.process_one(event);
            }
            self.processing.store(false, Ordering::Release);
            // A sender may have enqueued between the last pop and the flag
            // release; re-check so no event is stranded.
            if self.is_terminal() || self.mailbox.lock().is_empty() {
                return;
            }
        }
    }

    fn process_one(self: &Arc<Self>, event: Event) {
        self.inspect(|| InspectionEvent::EventReceived {
            id: self.id.clone(),
            event: event.clone(),
        });
        let result = {
            let mut body = self.body.lock();
            let CellBody { logic, children } = &mut *body;
            let mut scope = ActorScope {
                cell: self,
                children,
            };
            logic.receive(event, &mut scope)
        };
        match result {
            Ok(()) => {
                self.run_deferred();
                self.publish();
                self.settle();
            }
            Err(e) => {
                self.fail(e.to_error_value(), true);
            }
        }
    }

    /// Applies child starts and stops requested by the event just
    /// processed. Runs without the body lock, so child behaviors are free
    /// to call back into this actor.
    fn run_deferred(self: &Arc<Self>) {
        loop {
            let ops: Vec<Deferred> = std::mem::take(&mut *self.deferred.lock());
            if ops.is_empty() {
                return;
            }
            for op in ops {
                match op {
                    Deferred::StartChild(child) => {
                        if let Err(e) = child.start() {
                            tracing::warn!(
                                actor = %self.id,
                                child = %child.id(),
                                error = %e,
                                "invoked child failed to start"
                            );
                            self.enqueue(Event::error_platform(child.id(), e.to_error_value()));
                        }
                    }
                    Deferred::StopChild(child) => child.stop(),
                }
            }
        }
    }

    /// Composes and publishes a snapshot from the logic's current state.
    fn publish(self: &Arc<Self>) {
        let snap = {
            let body = self.body.lock();
            let mut snap = body.logic.snapshot();
            snap.children = body.children.keys().cloned().collect();
            snap
        };
        let snap = {
            let status = *self.status.lock();
            let mut snap = snap;
            if matches!(status, ActorStatus::Stopped | ActorStatus::Error) {
                snap.status = status;
            }
            Arc::new(snap)
        };
        *self.snapshot.lock() = Arc::clone(&snap);
        self.inspect(|| InspectionEvent::SnapshotPublished {
            id: self.id.clone(),
            snapshot: (*snap).clone(),
        });
        let observers: Vec<Observer> = self.observers.lock().values().cloned().collect();
        for observer in &observers {
            if let Some(next) = &observer.next {
                next(&snap);
            }
        }
    }

    /// Completes the actor when its last published snapshot reports done:
    /// timers are cancelled, children stopped, subscribers completed, and
    /// the parent receives `done.invoke.<id>`.
    fn settle(self: &Arc<Self>) {
        let output = {
            let snap = self.snapshot.lock();
            if snap.status != ActorStatus::Done {
                return;
            }
            snap.output.clone()
        };
        {
            let mut status = self.status.lock();
            if status.is_terminal() {
                return;
            }
            *status = ActorStatus::Done;
        }
        tracing::debug!(actor = %self.id, "actor done");
        self.mailbox.lock().clear();
        self.cancel_timers();
        self.stop_children();
        self.notify_complete();
        if let Some(parent) = self.parent_ref() {
            parent.send(Event::done_invoke(&self.id, output));
        }
    }

    /// Moves the actor into the error status and notifies error observers
    /// and, when requested, the parent via `error.platform.<id>`.
    fn fail(self: &Arc<Self>, error: Value, notify_parent: bool) {
        {
            let mut status = self.status.lock();
            if status.is_terminal() {
                return;
            }
            *status = ActorStatus::Error;
        }
        tracing::warn!(actor = %self.id, error = %error, "actor failed");
        self.deferred.lock().clear();
        self.mailbox.lock().clear();
        self.cancel_timers();
        self.stop_children();
        let snap = {
            let body = self.body.lock();
            let mut snap = body.logic.snapshot();
            snap.status = ActorStatus::Error;
            snap.error = Some(error.clone());
            snap.children = Vec::new();
            Arc::new(snap)
        };
        *self.snapshot.lock() = Arc::clone(&snap);
        self.inspect(|| InspectionEvent::SnapshotPublished {
            id: self.id.clone(),
            snapshot: (*snap).clone(),
        });
        let observers: Vec<Observer> = self.observers.lock().values().cloned().collect();
        for observer in &observers {
            if let Some(on_error) = &observer.error {
                on_error(&error);
            }
        }
        if notify_parent {
            if let Some(parent) = self.parent_ref() {
                parent.send(Event::error_platform(&self.id, error));
            }
        }
    }

    fn stop_children(self: &Arc<Self>) {
        let children: Vec<ActorRef> = {
            let mut body = self.body.lock();
            std::mem::take(&mut body.children).into_values().collect()
        };
        for child in children {
            child.stop();
        }
    }

    fn notify_complete(&self) {
        let observers: Vec<Observer> = self.observers.lock().values().cloned().collect();
        for observer in &observers {
            if let Some(complete) = &observer.complete {
                complete();
            }
        }
    }

    fn cancel_timers(&self) {
        if let Some(system) = self.system() {
            system.timers().cancel_all(&self.id);
        }
    }

    fn inspect(&self, make: impl FnOnce() -> InspectionEvent) {
        if let Some(system) = self.system() {
            let inspector = system.inspector();
            if !inspector.is_empty() {
                inspector.emit(&make());
            }
        }
    }
}

/// Cloneable handle to an actor.
#[derive(Clone)]
pub struct ActorRef {
    cell: Arc<ActorCell>,
}

impl ActorRef {
    pub(crate) fn from_cell(cell: Arc<ActorCell>) -> Self {
        Self { cell }
    }

    pub fn id(&self) -> &str {
        self.cell.id()
    }

    /// Logic registration name this actor was spawned from.
    pub fn src(&self) -> &str {
        self.cell.src()
    }

    pub fn status(&self) -> ActorStatus {
        self.cell.status()
    }

    /// Starts the actor: runs the behavior's initial step, publishes the
    /// first snapshot, then drains any events queued before the start.
    pub fn start(&self) -> Result<(), ActorError> {
        self.cell.start()
    }

    /// Enqueues an event. Events for terminated actors are logged and
    /// dropped; events for actors that are not started yet are queued until
    /// `start`.
    pub fn send(&self, event: Event) {
        self.cell.send(event);
    }

    /// Stops this actor and, recursively, its children. Idempotent.
    pub fn stop(&self) {
        self.cell.stop();
    }

    /// Subscribes to published snapshots.
    pub fn subscribe(&self, on_next: impl Fn(&Snapshot) + Send + Sync + 'static) -> Subscription {
        self.cell.subscribe(Observer::new().with_next(on_next))
    }

    /// Subscribes with explicit next, error, and completion callbacks.
    pub fn subscribe_observer(&self, observer: Observer) -> Subscription {
        self.cell.subscribe(observer)
    }

    /// Last published snapshot.
    pub fn get_snapshot(&self) -> Snapshot {
        self.cell.snapshot()
    }

    /// Durable snapshot of this actor and its children, suitable for
    /// [`ActorSystem::restore`](crate::ActorSystem::restore).
    pub fn get_persisted_snapshot(&self) -> PersistedSnapshot {
        self.cell.persisted()
    }

    /// Ids of live children.
    pub fn children(&self) -> Vec<String> {
        self.cell.child_ids()
    }

    pub fn child(&self, id: &str) -> Option<ActorRef> {
        self.cell.child(id)
    }

    pub fn parent(&self) -> Option<ActorRef> {
        self.cell.parent_ref()
    }

    pub(crate) fn cell(&self) -> &Arc<ActorCell> {
        &self.cell
    }
}

impl fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("id", &self.id())
            .field("src", &self.src())
            .field("status", &self.status())
            .finish()
    }
}
