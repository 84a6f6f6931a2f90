//! Actor system.
//!
//! An [`ActorSystem`] owns the logic registry, the actor registry, the timer
//! driver, and the inspection observers. Systems are cheap cloneable handles;
//! everything lives behind one shared inner state, and two systems in a
//! process are fully isolated from each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use harel_core::Machine;

use crate::cell::{ActorCell, ActorRef};
use crate::error::ActorError;
use crate::inspect::{InspectionEvent, InspectionObserver, Inspector};
use crate::logic::{ActorLogic, MachineLogic};
use crate::persist::PersistedSnapshot;
use crate::timers::{TimerDriver, TokioTimers};

/// Builds actor logics on demand.
///
/// Factories are registered under a `src` name and invoked for every spawn
/// of that name. Closures of type
/// `Fn(Option<Value>) -> Result<Box<dyn ActorLogic>, ActorError>` implement
/// this trait directly.
pub trait ActorLogicFactory: Send + Sync {
    /// Builds a fresh logic. `input` carries the spawn or invoke input.
    fn create(&self, input: Option<Value>) -> Result<Box<dyn ActorLogic>, ActorError>;

    /// Rebuilds a logic from a persisted snapshot.
    fn restore(&self, persisted: &PersistedSnapshot) -> Result<Box<dyn ActorLogic>, ActorError> {
        Err(ActorError::RestoreUnsupported {
            src: persisted.src.clone(),
        })
    }

    /// Definition checksum carried in `ActorCreated` inspection events.
    fn checksum(&self) -> Option<String> {
        None
    }
}

impl<F> ActorLogicFactory for F
where
    F: Fn(Option<Value>) -> Result<Box<dyn ActorLogic>, ActorError> + Send + Sync,
{
    fn create(&self, input: Option<Value>) -> Result<Box<dyn ActorLogic>, ActorError> {
        self(input)
    }
}

/// Factory for machine actors. Spawns share one compiled [`Machine`].
pub struct MachineFactory {
    machine: Arc<Machine>,
}

impl MachineFactory {
    pub fn new(machine: Machine) -> Self {
        Self {
            machine: Arc::new(machine),
        }
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }
}

impl ActorLogicFactory for MachineFactory {
    fn create(&self, input: Option<Value>) -> Result<Box<dyn ActorLogic>, ActorError> {
        Ok(Box::new(MachineLogic::new(
            Arc::clone(&self.machine),
            input,
        )))
    }

    fn restore(&self, persisted: &PersistedSnapshot) -> Result<Box<dyn ActorLogic>, ActorError> {
        Ok(Box::new(MachineLogic::restored(
            Arc::clone(&self.machine),
            persisted,
        )?))
    }

    fn checksum(&self) -> Option<String> {
        Some(self.machine.checksum().to_string())
    }
}

/// Configuration for building an [`ActorSystem`].
#[derive(Default)]
pub struct SystemOptions {
    timers: Option<Arc<dyn TimerDriver>>,
    inspectors: Vec<InspectionObserver>,
}

impl SystemOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the default tokio timer driver, typically with a
    /// [`ManualClock`](crate::ManualClock) in tests.
    pub fn with_timer_driver(mut self, driver: Arc<dyn TimerDriver>) -> Self {
        self.timers = Some(driver);
        self
    }

    /// Adds an inspection observer. Observers see every actor creation,
    /// received event, published snapshot, and stop in this system.
    pub fn with_inspector(
        mut self,
        observer: impl Fn(&InspectionEvent) + Send + Sync + 'static,
    ) -> Self {
        self.inspectors.push(Arc::new(observer));
        self
    }
}

/// Options for a single spawn.
#[derive(Default)]
pub struct SpawnOptions {
    id: Option<String>,
    input: Option<Value>,
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit actor id. Defaults to `<src>:<n>` with a system-wide
    /// counter.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Input delivered to the logic, exposed to machines on the init event.
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

pub(crate) struct SystemInner {
    /// Logic factories by `src` name.
    pub(crate) logics: DashMap<String, Arc<dyn ActorLogicFactory>>,
    /// Every live actor by id, roots and children alike.
    pub(crate) actors: DashMap<String, ActorRef>,
    pub(crate) timers: Arc<dyn TimerDriver>,
    pub(crate) inspector: Inspector,
    /// Feeds generated actor ids.
    pub(crate) seq: AtomicU64,
}

/// Handle to a running actor system.
#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<SystemInner>,
}

impl Default for ActorSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorSystem {
    pub fn new() -> Self {
        Self::with_options(SystemOptions::default())
    }

    pub fn with_options(options: SystemOptions) -> Self {
        let timers = options
            .timers
            .unwrap_or_else(|| Arc::new(TokioTimers::new()));
        Self {
            inner: Arc::new(SystemInner {
                logics: DashMap::new(),
                actors: DashMap::new(),
                timers,
                inspector: Inspector::new(options.inspectors),
                seq: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<SystemInner>) -> Self {
        Self { inner }
    }

    /// Registers a machine under `src`. Invoke and spawn declarations in
    /// other machines resolve their `src` against this registry.
    pub fn register_machine(&self, src: impl Into<String>, machine: Machine) {
        self.register_logic(src, MachineFactory::new(machine));
    }

    /// Registers an arbitrary logic factory under `src`.
    pub fn register_logic(&self, src: impl Into<String>, factory: impl ActorLogicFactory + 'static) {
        let src = src.into();
        tracing::debug!(src = %src, "logic registered");
        self.inner.logics.insert(src, Arc::new(factory));
    }

    /// Creates a root actor from a registered logic. The actor is idle
    /// until [`ActorRef::start`] is called.
    pub fn spawn(&self, src: &str) -> Result<ActorRef, ActorError> {
        self.spawn_with(src, SpawnOptions::default())
    }

    pub fn spawn_with(&self, src: &str, options: SpawnOptions) -> Result<ActorRef, ActorError> {
        let id = options.id.unwrap_or_else(|| self.next_actor_id(src));
        self.create_actor(src, &id, options.input, None)
    }

    /// Rebuilds an actor tree from a persisted snapshot. Restored actors
    /// resume in their persisted status: an actor persisted while active is
    /// live as soon as this returns, without re-running entry actions, and
    /// pending `after` timers are not re-armed.
    pub fn restore(&self, persisted: &PersistedSnapshot) -> Result<ActorRef, ActorError> {
        self.restore_with(persisted, SpawnOptions::default())
    }

    pub fn restore_with(
        &self,
        persisted: &PersistedSnapshot,
        options: SpawnOptions,
    ) -> Result<ActorRef, ActorError> {
        let id = options
            .id
            .unwrap_or_else(|| self.next_actor_id(&persisted.src));
        self.restore_node(persisted, &id, None)
    }

    /// Looks up a live actor by id.
    pub fn actor(&self, id: &str) -> Option<ActorRef> {
        self.inner.actors.get(id).map(|entry| entry.value().clone())
    }

    /// Number of live actors.
    pub fn actor_count(&self) -> usize {
        self.inner.actors.len()
    }

    /// Stops every actor in the system.
    pub fn stop_all(&self) {
        let actors: Vec<ActorRef> = self
            .inner
            .actors
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for actor in actors {
            actor.stop();
        }
    }

    pub(crate) fn timers(&self) -> &Arc<dyn TimerDriver> {
        &self.inner.timers
    }

    pub(crate) fn inspector(&self) -> &Inspector {
        &self.inner.inspector
    }

    pub(crate) fn next_actor_id(&self, src: &str) -> String {
        format!("{}:{}", src, self.inner.seq.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn deregister(&self, id: &str) {
        self.inner.actors.remove(id);
    }

    pub(crate) fn create_actor(
        &self,
        src: &str,
        id: &str,
        input: Option<Value>,
        parent: Option<ActorRef>,
    ) -> Result<ActorRef, ActorError> {
        let factory = self.factory(src)?;
        let logic = factory.create(input)?;
        self.register_cell(src, id, logic, parent, factory.checksum())
    }

    fn restore_node(
        &self,
        persisted: &PersistedSnapshot,
        id: &str,
        parent: Option<ActorRef>,
    ) -> Result<ActorRef, ActorError> {
        let factory = self.factory(&persisted.src)?;
        let logic = factory.restore(persisted)?;
        let actor = self.register_cell(&persisted.src, id, logic, parent, factory.checksum())?;
        for (child_id, child_snap) in &persisted.children {
            match self.restore_node(child_snap, child_id, Some(actor.clone())) {
                Ok(child) => actor.cell().attach_child(child_id.clone(), child),
                Err(e) => {
                    actor.stop();
                    return Err(e);
                }
            }
        }
        actor.cell().adopt_persisted(persisted);
        Ok(actor)
    }

    fn factory(&self, src: &str) -> Result<Arc<dyn ActorLogicFactory>, ActorError> {
        self.inner
            .logics
            .get(src)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ActorError::UnknownLogic {
                src: src.to_string(),
            })
    }

    fn register_cell(
        &self,
        src: &str,
        id: &str,
        logic: Box<dyn ActorLogic>,
        parent: Option<ActorRef>,
        checksum: Option<String>,
    ) -> Result<ActorRef, ActorError> {
        let parent_id = parent.as_ref().map(|p| p.id().to_string());
        let cell = ActorCell::new(
            id.to_string(),
            src.to_string(),
            logic,
            parent.as_ref().map(|p| Arc::downgrade(p.cell())),
            Arc::downgrade(&self.inner),
        );
        let actor = ActorRef::from_cell(cell);
        // The duplicate check and the insert must be one registry
        // operation, or two spawns racing on the same id both pass.
        match self.inner.actors.entry(id.to_string()) {
            Entry::Occupied(_) => {
                return Err(ActorError::DuplicateActor { id: id.to_string() });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(actor.clone());
            }
        }
        tracing::debug!(actor = %id, src = %src, "actor created");
        if !self.inner.inspector.is_empty() {
            self.inner.inspector.emit(&InspectionEvent::ActorCreated {
                id: id.to_string(),
                src: src.to_string(),
                parent: parent_id,
                checksum,
            });
        }
        Ok(actor)
    }
}
