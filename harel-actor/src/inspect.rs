//! Runtime inspection.
//!
//! An [`Inspector`] fans structured lifecycle events out to observers that
//! were registered when the system was built. Observers are plain callbacks
//! scoped to their system, so two systems in one process never see each
//! other's traffic.

use std::sync::Arc;

use harel_core::Event;

use crate::snapshot::Snapshot;

/// Observer callback for inspection events.
pub type InspectionObserver = Arc<dyn Fn(&InspectionEvent) + Send + Sync>;

/// Lifecycle event emitted by the actor runtime.
#[derive(Debug, Clone)]
pub enum InspectionEvent {
    /// An actor was created (not necessarily started yet).
    ActorCreated {
        id: String,
        src: String,
        /// Id of the spawning parent, absent for root actors.
        parent: Option<String>,
        /// Definition checksum for machine actors, used to correlate
        /// persisted snapshots with the definition that produced them.
        checksum: Option<String>,
    },
    /// An actor pulled an event from its mailbox for processing.
    EventReceived { id: String, event: Event },
    /// An actor published a new snapshot after settling a macrostep.
    SnapshotPublished { id: String, snapshot: Snapshot },
    /// An actor was stopped.
    ActorStopped { id: String },
}

impl InspectionEvent {
    /// Id of the actor this event concerns.
    pub fn actor_id(&self) -> &str {
        match self {
            InspectionEvent::ActorCreated { id, .. } => id,
            InspectionEvent::EventReceived { id, .. } => id,
            InspectionEvent::SnapshotPublished { id, .. } => id,
            InspectionEvent::ActorStopped { id } => id,
        }
    }
}

/// Set of inspection observers attached to one actor system.
#[derive(Clone, Default)]
pub struct Inspector {
    observers: Vec<InspectionObserver>,
}

impl Inspector {
    pub fn new(observers: Vec<InspectionObserver>) -> Self {
        Self { observers }
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Delivers an event to every observer in registration order.
    pub fn emit(&self, event: &InspectionEvent) {
        for observer in &self.observers {
            observer(event);
        }
    }
}
