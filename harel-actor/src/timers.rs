//! Timer drivers.
//!
//! Delayed sends and `after` transitions go through a [`TimerDriver`] so the
//! clock is injectable. Production systems use [`TokioTimers`]; tests use
//! [`ManualClock`] and advance virtual time explicitly, which makes delayed
//! behavior deterministic without sleeping.
//!
//! Timers are keyed by `(owner, key)`. Scheduling an existing key replaces
//! the pending timer, cancelling a missing key is a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use harel_core::Event;

use crate::cell::ActorRef;

/// Clock abstraction behind delayed event delivery.
pub trait TimerDriver: Send + Sync {
    /// Schedules `event` to be sent to `target` after `delay_ms`. The timer
    /// belongs to `owner` (the scheduling actor) and can be cancelled via
    /// `key` until it fires.
    fn schedule(&self, owner: &str, target: ActorRef, key: &str, event: Event, delay_ms: u64);

    /// Cancels a single pending timer.
    fn cancel(&self, owner: &str, key: &str);

    /// Cancels every pending timer owned by `owner`. Called when the owner
    /// stops or terminates.
    fn cancel_all(&self, owner: &str);
}

/// Timer driver backed by `tokio::time`. Each timer is a spawned task that
/// sleeps and then sends; cancellation aborts the task.
#[derive(Default)]
pub struct TokioTimers {
    tasks: Arc<DashMap<(String, String), tokio::task::JoinHandle<()>>>,
}

impl TokioTimers {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimerDriver for TokioTimers {
    fn schedule(&self, owner: &str, target: ActorRef, key: &str, event: Event, delay_ms: u64) {
        let entry = (owner.to_string(), key.to_string());
        if let Some((_, old)) = self.tasks.remove(&entry) {
            old.abort();
        }
        let tasks = Arc::clone(&self.tasks);
        let task_entry = entry.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            tasks.remove(&task_entry);
            target.send(event);
        });
        self.tasks.insert(entry, handle);
    }

    fn cancel(&self, owner: &str, key: &str) {
        if let Some((_, handle)) = self.tasks.remove(&(owner.to_string(), key.to_string())) {
            handle.abort();
        }
    }

    fn cancel_all(&self, owner: &str) {
        self.tasks.retain(|entry, handle| {
            if entry.0 == owner {
                handle.abort();
                false
            } else {
                true
            }
        });
    }
}

struct PendingTimer {
    owner: String,
    key: String,
    target: ActorRef,
    event: Event,
    fire_at: u64,
    seq: u64,
}

/// Virtual clock for tests. Nothing fires until [`advance`](ManualClock::advance)
/// moves time forward; due timers are then delivered synchronously in
/// deadline order, ties broken by scheduling order.
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<u64>,
    pending: Mutex<Vec<PendingTimer>>,
    seq: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time in milliseconds.
    pub fn now(&self) -> u64 {
        *self.now.lock()
    }

    /// Number of timers that have not fired or been cancelled.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Moves virtual time forward and delivers every timer that becomes due,
    /// including timers scheduled by the deliveries themselves when their
    /// deadline is within the new time.
    pub fn advance(&self, ms: u64) {
        let deadline = {
            let mut now = self.now.lock();
            *now += ms;
            *now
        };
        loop {
            // Pull one due timer at a time so delivery runs without the lock
            // and can safely schedule or cancel more timers.
            let next = {
                let mut pending = self.pending.lock();
                let due = pending
                    .iter()
                    .enumerate()
                    .filter(|(_, timer)| timer.fire_at <= deadline)
                    .min_by_key(|(_, timer)| (timer.fire_at, timer.seq))
                    .map(|(index, _)| index);
                due.map(|index| pending.remove(index))
            };
            match next {
                Some(timer) => timer.target.send(timer.event),
                None => break,
            }
        }
    }
}

impl TimerDriver for ManualClock {
    fn schedule(&self, owner: &str, target: ActorRef, key: &str, event: Event, delay_ms: u64) {
        let fire_at = *self.now.lock() + delay_ms;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock();
        pending.retain(|timer| !(timer.owner == owner && timer.key == key));
        pending.push(PendingTimer {
            owner: owner.to_string(),
            key: key.to_string(),
            target,
            event,
            fire_at,
            seq,
        });
    }

    fn cancel(&self, owner: &str, key: &str) {
        self.pending
            .lock()
            .retain(|timer| !(timer.owner == owner && timer.key == key));
    }

    fn cancel_all(&self, owner: &str) {
        self.pending.lock().retain(|timer| timer.owner != owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    use crate::actors::ReducerLogic;
    use crate::logic::ActorLogic;
    use crate::system::{ActorSystem, SystemOptions};

    /// Actor that records every received event type in its context.
    fn sink_system(driver: Arc<dyn TimerDriver>) -> (ActorSystem, ActorRef) {
        let system =
            ActorSystem::with_options(SystemOptions::new().with_timer_driver(driver));
        system.register_logic("sink", |_input| {
            Ok(Box::new(ReducerLogic::new(json!([]), |state, event| {
                let mut seen = state.as_array().cloned().unwrap_or_default();
                seen.push(Value::String(event.event_type.clone()));
                Value::Array(seen)
            })) as Box<dyn ActorLogic>)
        });
        let sink = system.spawn("sink").unwrap();
        sink.start().unwrap();
        (system, sink)
    }

    fn seen(sink: &ActorRef) -> Value {
        sink.get_snapshot().context
    }

    #[test]
    fn test_manual_clock_fires_in_deadline_order() {
        let clock = Arc::new(ManualClock::new());
        let (_system, sink) = sink_system(Arc::clone(&clock) as Arc<dyn TimerDriver>);

        clock.schedule("t", sink.clone(), "slow", Event::new("SLOW"), 100);
        clock.schedule("t", sink.clone(), "fast", Event::new("FAST"), 40);

        clock.advance(39);
        assert_eq!(seen(&sink), json!([]));

        clock.advance(1);
        assert_eq!(seen(&sink), json!(["FAST"]));

        clock.advance(60);
        assert_eq!(seen(&sink), json!(["FAST", "SLOW"]));
        assert_eq!(clock.pending_count(), 0);
        assert_eq!(clock.now(), 100);
    }

    #[test]
    fn test_manual_clock_ties_fire_in_schedule_order() {
        let clock = Arc::new(ManualClock::new());
        let (_system, sink) = sink_system(Arc::clone(&clock) as Arc<dyn TimerDriver>);

        clock.schedule("t", sink.clone(), "a", Event::new("A"), 10);
        clock.schedule("t", sink.clone(), "b", Event::new("B"), 10);
        clock.advance(10);
        assert_eq!(seen(&sink), json!(["A", "B"]));
    }

    #[test]
    fn test_manual_clock_cancel_and_reschedule() {
        let clock = Arc::new(ManualClock::new());
        let (_system, sink) = sink_system(Arc::clone(&clock) as Arc<dyn TimerDriver>);

        clock.schedule("t", sink.clone(), "ping", Event::new("OLD"), 10);
        // Same key replaces the pending timer.
        clock.schedule("t", sink.clone(), "ping", Event::new("NEW"), 30);
        assert_eq!(clock.pending_count(), 1);

        clock.schedule("t", sink.clone(), "gone", Event::new("GONE"), 20);
        clock.cancel("t", "gone");

        clock.advance(100);
        assert_eq!(seen(&sink), json!(["NEW"]));
    }

    #[test]
    fn test_manual_clock_cancel_all_by_owner() {
        let clock = Arc::new(ManualClock::new());
        let (_system, sink) = sink_system(Arc::clone(&clock) as Arc<dyn TimerDriver>);

        clock.schedule("mine", sink.clone(), "a", Event::new("MINE"), 10);
        clock.schedule("mine", sink.clone(), "b", Event::new("MINE_TOO"), 10);
        clock.schedule("other", sink.clone(), "a", Event::new("OTHER"), 10);

        clock.cancel_all("mine");
        clock.advance(10);
        assert_eq!(seen(&sink), json!(["OTHER"]));
    }

    #[tokio::test]
    async fn test_tokio_timers_deliver_and_cancel() {
        let timers = Arc::new(TokioTimers::new());
        let (_system, sink) =
            sink_system(Arc::clone(&timers) as Arc<dyn TimerDriver>);

        timers.schedule("t", sink.clone(), "keep", Event::new("KEPT"), 20);
        timers.schedule("t", sink.clone(), "drop", Event::new("DROPPED"), 20);
        timers.cancel("t", "drop");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(seen(&sink), json!(["KEPT"]));
    }
}
