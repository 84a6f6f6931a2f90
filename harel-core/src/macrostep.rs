//! Run-to-completion stepping.
//!
//! A macrostep takes one external event and runs microsteps until the
//! machine is stable: eventless transitions are checked after every
//! microstep and run first, then internally raised events are taken in
//! FIFO order. A per-macrostep microstep bound turns runaway eventless
//! or raise loops into [`CoreError::TransitionLoop`].
//!
//! The engine has no clock, mailbox, or child actors of its own. Every
//! externally visible effect is requested through an [`EffectRunner`];
//! the actor runtime implements one, and [`NoopRunner`] discards
//! everything for detached stepping.

use crate::action::{Action, AssignSpec, SendDest};
use crate::error::CoreError;
use crate::event::Event;
use crate::machine::{Configuration, Machine, NodeId, StateKind};
use crate::microstep::{enter_initial, fire, select_transitions};
use crate::state_value::StateValue;
use crate::value::set_field;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

/// Receives effect requests while a machine steps.
///
/// The engine calls these in execution order as actions run and states
/// enter or exit; implementations decide what delivery, timers, and
/// child actors actually are.
pub trait EffectRunner {
    /// Delivers (or schedules) an event for another actor, or for the
    /// stepping actor itself when `delay_ms` is set.
    fn send(
        &mut self,
        target: SendDest,
        event: Event,
        delay_ms: Option<u64>,
        id: Option<String>,
    ) -> Result<(), CoreError>;

    /// Cancels a delayed send by its id.
    fn cancel_send(&mut self, id: &str) -> Result<(), CoreError>;

    /// Creates a child actor. `auto_start` is set for invoke
    /// declarations and clear for explicit spawn actions.
    fn spawn_child(
        &mut self,
        src: &str,
        id: Option<&str>,
        input: Option<Value>,
        auto_start: bool,
    ) -> Result<(), CoreError>;

    /// Stops a child actor by id.
    fn stop_child(&mut self, id: &str) -> Result<(), CoreError>;

    /// Arms a state's delayed-transition timer.
    fn schedule_after(&mut self, event_type: &str, delay_ms: u64) -> Result<(), CoreError>;

    /// Disarms a delayed-transition timer on state exit.
    fn cancel_after(&mut self, event_type: &str) -> Result<(), CoreError>;
}

/// Discards every effect. Suitable for stepping a machine as a pure
/// value when no timers or child actors are involved.
pub struct NoopRunner;

impl EffectRunner for NoopRunner {
    fn send(
        &mut self,
        _target: SendDest,
        _event: Event,
        _delay_ms: Option<u64>,
        _id: Option<String>,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    fn cancel_send(&mut self, _id: &str) -> Result<(), CoreError> {
        Ok(())
    }

    fn spawn_child(
        &mut self,
        _src: &str,
        _id: Option<&str>,
        _input: Option<Value>,
        _auto_start: bool,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    fn stop_child(&mut self, _id: &str) -> Result<(), CoreError> {
        Ok(())
    }

    fn schedule_after(&mut self, _event_type: &str, _delay_ms: u64) -> Result<(), CoreError> {
        Ok(())
    }

    fn cancel_after(&mut self, _event_type: &str) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Whether the machine still accepts events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    Active,
    Done,
}

/// The complete mutable state of one running machine: active
/// configuration, extended context, history memory, and final output.
#[derive(Debug, Clone)]
pub struct MachineState {
    pub configuration: Configuration,
    pub context: Value,
    pub status: MachineStatus,
    /// Recorded memory per history pseudostate.
    pub history: HashMap<NodeId, Vec<NodeId>>,
    /// Done data of the top-level final state, once reached.
    pub output: Option<Value>,
}

impl MachineState {
    /// The nested state value for the current configuration.
    pub fn value(&self, machine: &Machine) -> StateValue {
        machine.state_value(&self.configuration)
    }

    pub fn is_done(&self) -> bool {
        self.status == MachineStatus::Done
    }

    /// Whether the current state value matches a descriptor.
    pub fn matches(&self, machine: &Machine, descriptor: &StateValue) -> bool {
        self.value(machine).matches(descriptor)
    }

    /// Rebuilds a state from a persisted value and context. History
    /// memory starts empty; use [`MachineState::restore_history`] to
    /// bring it back.
    pub fn restore(
        machine: &Machine,
        value: &StateValue,
        context: Value,
    ) -> Result<Self, CoreError> {
        Ok(MachineState {
            configuration: machine.configuration_from_value(value)?,
            context,
            status: MachineStatus::Active,
            history: HashMap::new(),
            output: None,
        })
    }

    /// History memory as a JSON object keyed by history-state id, each
    /// entry an array of recorded state ids.
    pub fn history_value(&self, machine: &Machine) -> Value {
        let mut map = serde_json::Map::new();
        for (&node, recorded) in &self.history {
            let ids = recorded
                .iter()
                .map(|&id| Value::String(machine.node_ref(id).state_id.clone()))
                .collect();
            map.insert(machine.node_ref(node).state_id.clone(), Value::Array(ids));
        }
        Value::Object(map)
    }

    /// Restores history memory from [`MachineState::history_value`]
    /// output. Ids that do not resolve in this machine are rejected.
    pub fn restore_history(&mut self, machine: &Machine, value: &Value) -> Result<(), CoreError> {
        let map = value
            .as_object()
            .ok_or_else(|| CoreError::InvalidSnapshot {
                reason: "history must be an object".to_string(),
            })?;
        self.history.clear();
        for (state_id, recorded) in map {
            let node =
                machine
                    .node_by_state_id(state_id)
                    .ok_or_else(|| CoreError::InvalidSnapshot {
                        reason: format!("unknown history state '{state_id}'"),
                    })?;
            if !matches!(machine.node_ref(node).kind, StateKind::History { .. }) {
                return Err(CoreError::InvalidSnapshot {
                    reason: format!("'{state_id}' is not a history state"),
                });
            }
            let items = recorded
                .as_array()
                .ok_or_else(|| CoreError::InvalidSnapshot {
                    reason: format!("history for '{state_id}' must be an array"),
                })?;
            let mut ids = Vec::with_capacity(items.len());
            for item in items {
                let target_id = item.as_str().ok_or_else(|| CoreError::InvalidSnapshot {
                    reason: format!("history entry for '{state_id}' must be a string"),
                })?;
                let target = machine.node_by_state_id(target_id).ok_or_else(|| {
                    CoreError::InvalidSnapshot {
                        reason: format!("unknown state '{target_id}' in history for '{state_id}'"),
                    }
                })?;
                ids.push(target);
            }
            if !ids.is_empty() {
                self.history.insert(node, ids);
            }
        }
        Ok(())
    }
}

/// Creates a running machine: resolves the initial context, enters the
/// default configuration, and runs the machine to stability.
pub fn initialize(
    machine: &Machine,
    input: Option<&Value>,
    runner: &mut dyn EffectRunner,
) -> Result<MachineState, CoreError> {
    let context = machine.initial_context(input)?;
    let mut state = MachineState {
        configuration: Configuration::from([machine.root()]),
        context,
        status: MachineStatus::Active,
        history: HashMap::new(),
        output: None,
    };
    let event = Event::init(input.cloned());
    let mut internal = VecDeque::new();
    enter_initial(machine, &mut state, &event, &mut internal, runner)?;
    tracing::debug!(machine = %machine.id(), value = ?state.value(machine), "machine initialized");

    let mut steps = 1usize;
    drain(machine, &mut state, &event, &mut internal, &mut steps, runner)?;
    Ok(state)
}

/// Processes one external event to completion. A done machine ignores
/// everything; an event no active state handles changes nothing.
pub fn macrostep(
    machine: &Machine,
    state: &mut MachineState,
    event: &Event,
    runner: &mut dyn EffectRunner,
) -> Result<(), CoreError> {
    if state.is_done() {
        tracing::debug!(machine = %machine.id(), event = %event.event_type, "event ignored, machine is done");
        return Ok(());
    }

    let mut internal = VecDeque::new();
    let mut steps = 0usize;
    let selected = select_transitions(machine, state, event, false)?;
    if selected.is_empty() {
        tracing::debug!(machine = %machine.id(), event = %event.event_type, "no transition enabled");
    } else {
        steps = 1;
        fire(machine, state, event, &selected, &mut internal, runner)?;
    }
    drain(machine, state, event, &mut internal, &mut steps, runner)
}

/// Runs the machine to stability: eventless transitions first, then
/// queued internal events, until neither yields a microstep.
fn drain(
    machine: &Machine,
    state: &mut MachineState,
    trigger: &Event,
    internal: &mut VecDeque<Event>,
    steps: &mut usize,
    runner: &mut dyn EffectRunner,
) -> Result<(), CoreError> {
    let mut current = trigger.clone();
    while !state.is_done() {
        let eventless = select_transitions(machine, state, &current, true)?;
        if !eventless.is_empty() {
            bump(machine, steps)?;
            fire(machine, state, &current, &eventless, internal, runner)?;
            continue;
        }
        let Some(event) = internal.pop_front() else {
            break;
        };
        current = event;
        let selected = select_transitions(machine, state, &current, false)?;
        if selected.is_empty() {
            tracing::debug!(machine = %machine.id(), event = %current.event_type, "internal event unhandled");
            continue;
        }
        bump(machine, steps)?;
        fire(machine, state, &current, &selected, internal, runner)?;
    }
    if state.is_done() {
        internal.clear();
        tracing::debug!(machine = %machine.id(), output = ?state.output, "machine done");
    }
    Ok(())
}

fn bump(machine: &Machine, steps: &mut usize) -> Result<(), CoreError> {
    *steps += 1;
    if *steps > machine.eventless_limit() {
        return Err(CoreError::TransitionLoop {
            limit: machine.eventless_limit(),
        });
    }
    Ok(())
}

/// Runs one action list. Assigns mutate the context in place; raises
/// and undelayed self-sends join the current macrostep's internal
/// queue; everything else goes through the runner.
pub(crate) fn execute_actions(
    machine: &Machine,
    actions: &[Action],
    state: &mut MachineState,
    event: &Event,
    internal: &mut VecDeque<Event>,
    runner: &mut dyn EffectRunner,
) -> Result<(), CoreError> {
    for action in actions {
        match action {
            Action::Assign(AssignSpec::Set(entries)) => {
                // Every value in one set reads the pre-assign context;
                // the writes land together afterwards.
                let snapshot = state.context.clone();
                let mut writes = Vec::with_capacity(entries.len());
                for (path, value) in entries {
                    writes.push((path, value.evaluate(&snapshot, event)));
                }
                for (path, value) in writes {
                    set_field(&mut state.context, path, value);
                }
            }
            Action::Assign(AssignSpec::Updater(name)) => {
                let updater = machine
                    .implementations()
                    .updater(name)
                    .ok_or_else(|| CoreError::MissingAction { name: name.clone() })?;
                state.context = updater(&state.context, event);
            }
            Action::Raise {
                event: template,
                delay,
                id,
            } => {
                let raised = template.evaluate(&state.context, event);
                match delay {
                    None => internal.push_back(raised),
                    Some(delay) => {
                        let ms = machine
                            .implementations()
                            .resolve_delay(delay, &state.context, event)?;
                        runner.send(SendDest::SelfActor, raised, Some(ms), id.clone())?;
                    }
                }
            }
            Action::Send {
                to,
                event: template,
                delay,
                id,
            } => {
                let sent = template.evaluate(&state.context, event);
                let ms = match delay {
                    None => None,
                    Some(delay) => Some(machine.implementations().resolve_delay(
                        delay,
                        &state.context,
                        event,
                    )?),
                };
                if *to == SendDest::SelfActor && ms.is_none() {
                    // Same macrostep as a raise.
                    internal.push_back(sent);
                } else {
                    runner.send(to.clone(), sent, ms, id.clone())?;
                }
            }
            Action::Cancel { send_id } => runner.cancel_send(send_id)?,
            Action::Spawn { src, id, input } => {
                let input = input.as_ref().map(|i| i.evaluate(&state.context, event));
                runner.spawn_child(src, id.as_deref(), input, false)?;
            }
            Action::Stop { child } => runner.stop_child(child)?,
            Action::Log { label, message } => {
                let value = message
                    .as_ref()
                    .map(|m| m.evaluate(&state.context, event))
                    .unwrap_or_else(|| event.to_value());
                match label {
                    Some(label) => tracing::info!(label = %label, value = %value, "log action"),
                    None => tracing::info!(value = %value, "log action"),
                }
            }
            Action::Custom { name, params } => {
                let action_fn = machine
                    .implementations()
                    .action(name)
                    .ok_or_else(|| CoreError::MissingAction { name: name.clone() })?;
                let params = params.as_ref().map(|p| p.evaluate(&state.context, event));
                action_fn(&state.context, event, params.as_ref()).map_err(|e| {
                    CoreError::ActionFailed {
                        action: name.to_string(),
                        reason: e.to_string(),
                    }
                })?;
            }
        }
    }
    Ok(())
}

/// Records every effect request, for asserting on engine output.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct CollectingRunner {
    pub(crate) calls: Vec<RunnerCall>,
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RunnerCall {
    Send {
        target: SendDest,
        event_type: String,
        delay_ms: Option<u64>,
        id: Option<String>,
    },
    CancelSend(String),
    Spawn {
        src: String,
        id: Option<String>,
        input: Option<Value>,
        auto_start: bool,
    },
    StopChild(String),
    ScheduleAfter {
        event_type: String,
        delay_ms: u64,
    },
    CancelAfter(String),
}

#[cfg(test)]
impl EffectRunner for CollectingRunner {
    fn send(
        &mut self,
        target: SendDest,
        event: Event,
        delay_ms: Option<u64>,
        id: Option<String>,
    ) -> Result<(), CoreError> {
        self.calls.push(RunnerCall::Send {
            target,
            event_type: event.event_type,
            delay_ms,
            id,
        });
        Ok(())
    }

    fn cancel_send(&mut self, id: &str) -> Result<(), CoreError> {
        self.calls.push(RunnerCall::CancelSend(id.to_string()));
        Ok(())
    }

    fn spawn_child(
        &mut self,
        src: &str,
        id: Option<&str>,
        input: Option<Value>,
        auto_start: bool,
    ) -> Result<(), CoreError> {
        self.calls.push(RunnerCall::Spawn {
            src: src.to_string(),
            id: id.map(str::to_string),
            input,
            auto_start,
        });
        Ok(())
    }

    fn stop_child(&mut self, id: &str) -> Result<(), CoreError> {
        self.calls.push(RunnerCall::StopChild(id.to_string()));
        Ok(())
    }

    fn schedule_after(&mut self, event_type: &str, delay_ms: u64) -> Result<(), CoreError> {
        self.calls.push(RunnerCall::ScheduleAfter {
            event_type: event_type.to_string(),
            delay_ms,
        });
        Ok(())
    }

    fn cancel_after(&mut self, event_type: &str) -> Result<(), CoreError> {
        self.calls.push(RunnerCall::CancelAfter(event_type.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Implementations, Machine};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn step(machine: &Machine, state: &mut MachineState, event: &str) {
        macrostep(machine, state, &Event::new(event), &mut NoopRunner).unwrap();
    }

    fn sv(raw: Value) -> StateValue {
        serde_json::from_value(raw).unwrap()
    }

    fn recorder() -> (
        Arc<Mutex<Vec<String>>>,
        impl Fn(&Value, &Event, Option<&Value>) -> Result<(), CoreError>,
    ) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let record = move |_ctx: &Value, _event: &Event, params: Option<&Value>| {
            let tag = params
                .and_then(|p| p.get("tag"))
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string();
            sink.lock().unwrap().push(tag);
            Ok(())
        };
        (log, record)
    }

    #[test]
    fn test_traffic_light_cycles() {
        let machine = Machine::from_json(&json!({
            "id": "light",
            "initial": "green",
            "states": {
                "green": {"on": {"TIMER": "yellow"}},
                "yellow": {"on": {"TIMER": "red"}},
                "red": {"on": {"TIMER": "green"}}
            }
        }))
        .unwrap();

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        assert_eq!(state.value(&machine), StateValue::leaf("green"));
        for expected in ["yellow", "red", "green"] {
            step(&machine, &mut state, "TIMER");
            assert_eq!(state.value(&machine), StateValue::leaf(expected));
        }
    }

    #[test]
    fn test_initial_defaults_to_first_declared_child() {
        // Keys deliberately out of alphabetical order: the default initial
        // is the first declared child, not the first sorted one.
        let machine = Machine::from_json(&json!({
            "id": "wizard",
            "states": {
                "welcome": {"on": {"NEXT": "details"}},
                "details": {"on": {"NEXT": "confirm"}},
                "confirm": {}
            }
        }))
        .unwrap();

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        assert_eq!(state.value(&machine), StateValue::leaf("welcome"));
        step(&machine, &mut state, "NEXT");
        assert_eq!(state.value(&machine), StateValue::leaf("details"));
    }

    #[test]
    fn test_declaration_order_decides_transition_priority() {
        // "*" sorts ahead of "PING"; declaration order, not key order,
        // decides which transition wins.
        let machine = Machine::from_json(&json!({
            "id": "router",
            "initial": "idle",
            "states": {
                "idle": {"on": {"PING": "exact", "*": "fallback"}},
                "exact": {},
                "fallback": {}
            }
        }))
        .unwrap();

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        step(&machine, &mut state, "PING");
        assert_eq!(state.value(&machine), StateValue::leaf("exact"));

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        step(&machine, &mut state, "OTHER");
        assert_eq!(state.value(&machine), StateValue::leaf("fallback"));
    }

    #[test]
    fn test_guarded_counter_stops_at_cap() {
        let machine = Machine::from_json(&json!({
            "id": "counter",
            "context": {"count": 0},
            "initial": "counting",
            "states": {
                "counting": {
                    "on": {
                        "INC": {
                            "guard": "ctx.count < 10",
                            "actions": [
                                {"type": "assign", "set": {"count": {"$expr": "ctx.count + 1"}}}
                            ]
                        }
                    }
                }
            }
        }))
        .unwrap();

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        for _ in 0..12 {
            step(&machine, &mut state, "INC");
        }
        assert_eq!(state.context["count"], json!(10));
    }

    #[test]
    fn test_exit_action_entry_ordering() {
        let (log, record) = recorder();
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "outer",
            "states": {
                "outer": {
                    "initial": "inner",
                    "exit": {"type": "record", "tag": "exit-outer"},
                    "states": {
                        "inner": {"exit": {"type": "record", "tag": "exit-inner"}}
                    },
                    "on": {
                        "E": {"target": "sibling", "actions": [{"type": "record", "tag": "action"}]}
                    }
                },
                "sibling": {"entry": {"type": "record", "tag": "enter-sibling"}}
            }
        }))
        .unwrap()
        .with_implementations(Implementations::default().with_action("record", record));

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        step(&machine, &mut state, "E");
        assert_eq!(
            *log.lock().unwrap(),
            vec!["exit-inner", "exit-outer", "action", "enter-sibling"]
        );
    }

    #[test]
    fn test_internal_vs_external_self_transition() {
        let (log, record) = recorder();
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "p",
            "states": {
                "p": {
                    "initial": "c",
                    "entry": {"type": "record", "tag": "enter-p"},
                    "states": {"c": {"entry": {"type": "record", "tag": "enter-c"}}},
                    "on": {
                        "EXTERNAL": {"target": "p"},
                        "INTERNAL": {"target": ".c", "internal": true}
                    }
                }
            }
        }))
        .unwrap()
        .with_implementations(Implementations::default().with_action("record", record));

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        log.lock().unwrap().clear();

        step(&machine, &mut state, "EXTERNAL");
        assert_eq!(*log.lock().unwrap(), vec!["enter-p", "enter-c"]);

        log.lock().unwrap().clear();
        step(&machine, &mut state, "INTERNAL");
        assert_eq!(*log.lock().unwrap(), vec!["enter-c"]);
    }

    #[test]
    fn test_eventless_cascade_in_one_macrostep() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "context": {"ready": true},
            "initial": "a",
            "states": {
                "a": {"on": {"GO": "b"}},
                "b": {"always": {"target": "c", "guard": "ctx.ready"}},
                "c": {"always": "d"},
                "d": {}
            }
        }))
        .unwrap();

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        step(&machine, &mut state, "GO");
        assert_eq!(state.value(&machine), StateValue::leaf("d"));
    }

    #[test]
    fn test_eventless_loop_hits_limit() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "a",
            "states": {
                "a": {"always": "b"},
                "b": {"always": "a"}
            }
        }))
        .unwrap()
        .with_eventless_limit(5);

        let err = initialize(&machine, None, &mut NoopRunner).unwrap_err();
        assert!(matches!(err, CoreError::TransitionLoop { limit: 5 }));
    }

    #[test]
    fn test_raise_joins_current_macrostep() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "a",
            "states": {
                "a": {
                    "on": {
                        "GO": {"target": "b", "actions": [{"type": "raise", "event": {"type": "CONTINUE"}}]}
                    }
                },
                "b": {"on": {"CONTINUE": "c"}},
                "c": {}
            }
        }))
        .unwrap();

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        step(&machine, &mut state, "GO");
        assert_eq!(state.value(&machine), StateValue::leaf("c"));
    }

    #[test]
    fn test_assign_visible_to_later_actions_and_raises() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "context": {"n": 0},
            "initial": "a",
            "states": {
                "a": {
                    "on": {
                        "GO": {
                            "actions": [
                                {"type": "assign", "set": {"n": 5}},
                                {"type": "raise", "event": {"type": "CHECK", "n": {"$expr": "ctx.n"}}}
                            ]
                        },
                        "CHECK": {"target": "b", "guard": "ctx.n == 5 && event.n == 5"}
                    }
                },
                "b": {}
            }
        }))
        .unwrap();

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        step(&machine, &mut state, "GO");
        assert_eq!(state.value(&machine), StateValue::leaf("b"));
        assert_eq!(state.context["n"], json!(5));
    }

    #[test]
    fn test_assign_set_reads_pre_assign_context() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "context": {"a": 1, "b": 2},
            "initial": "s",
            "states": {
                "s": {
                    "on": {
                        "SWAP": {
                            "actions": [{
                                "type": "assign",
                                "set": {"a": {"$expr": "ctx.b"}, "b": {"$expr": "ctx.a"}}
                            }]
                        }
                    }
                }
            }
        }))
        .unwrap();

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        step(&machine, &mut state, "SWAP");
        assert_eq!(state.context["a"], json!(2));
        assert_eq!(state.context["b"], json!(1));
    }

    #[test]
    fn test_updater_assign() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "context": {"total": 1},
            "initial": "s",
            "states": {
                "s": {"on": {"ADD": {"actions": [{"type": "assign", "updater": "accumulate"}]}}}
            }
        }))
        .unwrap()
        .with_implementations(Implementations::default().with_updater(
            "accumulate",
            |ctx: &Value, event: &Event| {
                let total = ctx["total"].as_i64().unwrap_or(0)
                    + event.get("amount").and_then(Value::as_i64).unwrap_or(0);
                json!({"total": total})
            },
        ));

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        let event = Event::with_payload("ADD", json!({"amount": 41}));
        macrostep(&machine, &mut state, &event, &mut NoopRunner).unwrap();
        assert_eq!(state.context, json!({"total": 42}));
    }

    #[test]
    fn test_parallel_regions_and_done_exactly_once() {
        let (log, record) = recorder();
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "work",
            "states": {
                "work": {
                    "type": "parallel",
                    "onDone": {"target": "finished", "actions": [{"type": "record", "tag": "done"}]},
                    "states": {
                        "a": {
                            "initial": "run",
                            "states": {"run": {"on": {"FIN_A": "ok"}}, "ok": {"type": "final"}}
                        },
                        "b": {
                            "initial": "run",
                            "states": {"run": {"on": {"FIN_B": "ok"}}, "ok": {"type": "final"}}
                        }
                    }
                },
                "finished": {}
            }
        }))
        .unwrap()
        .with_implementations(Implementations::default().with_action("record", record));

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        step(&machine, &mut state, "FIN_A");
        assert_eq!(
            state.value(&machine),
            sv(json!({"work": {"a": "ok", "b": "run"}}))
        );
        assert!(log.lock().unwrap().is_empty());

        step(&machine, &mut state, "FIN_B");
        assert_eq!(state.value(&machine), StateValue::leaf("finished"));
        assert_eq!(*log.lock().unwrap(), vec!["done"]);
    }

    #[test]
    fn test_done_event_carries_final_output() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "context": {"code": 7},
            "initial": "proc",
            "states": {
                "proc": {
                    "initial": "running",
                    "onDone": {
                        "target": "finished",
                        "actions": [{"type": "assign", "set": {"result": {"$expr": "event.output.code"}}}]
                    },
                    "states": {
                        "running": {"on": {"FIN": "end"}},
                        "end": {"type": "final", "output": {"code": {"$expr": "ctx.code"}}}
                    }
                },
                "finished": {}
            }
        }))
        .unwrap();

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        step(&machine, &mut state, "FIN");
        assert_eq!(state.value(&machine), StateValue::leaf("finished"));
        assert_eq!(state.context["result"], json!(7));
    }

    #[test]
    fn test_top_level_final_ends_machine() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "a",
            "states": {
                "a": {"on": {"END": "f"}},
                "f": {"type": "final", "output": {"ok": true}}
            }
        }))
        .unwrap();

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        assert!(!state.is_done());
        step(&machine, &mut state, "END");
        assert!(state.is_done());
        assert_eq!(state.output, Some(json!({"ok": true})));

        // A done machine swallows everything.
        step(&machine, &mut state, "END");
        step(&machine, &mut state, "ANYTHING");
        assert!(state.is_done());
        assert!(state.matches(&machine, &StateValue::leaf("f")));
    }

    #[test]
    fn test_shallow_history_restores_last_child() {
        let machine = Machine::from_json(&json!({
            "id": "player",
            "initial": "stopped",
            "states": {
                "stopped": {"on": {"PLAY": "#resume"}},
                "playing": {
                    "initial": "normal",
                    "on": {"STOP": "stopped"},
                    "states": {
                        "resume": {"id": "resume", "type": "history"},
                        "normal": {"on": {"FAST": "fast"}},
                        "fast": {}
                    }
                }
            }
        }))
        .unwrap();

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();

        // First entry has no memory and falls back to the initial.
        step(&machine, &mut state, "PLAY");
        assert_eq!(state.value(&machine), sv(json!({"playing": "normal"})));

        step(&machine, &mut state, "FAST");
        step(&machine, &mut state, "STOP");
        step(&machine, &mut state, "PLAY");
        assert_eq!(state.value(&machine), sv(json!({"playing": "fast"})));
    }

    #[test]
    fn test_deep_history_restores_nested_leaf() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "off",
            "states": {
                "off": {"on": {"START": "work", "RESUME": "#memory"}},
                "work": {
                    "initial": "stage1",
                    "on": {"PAUSE": "off"},
                    "states": {
                        "memory": {"id": "memory", "type": "history", "history": "deep"},
                        "stage1": {
                            "initial": "a",
                            "states": {"a": {"on": {"NEXT": "b"}}, "b": {}}
                        }
                    }
                }
            }
        }))
        .unwrap();

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        step(&machine, &mut state, "START");
        step(&machine, &mut state, "NEXT");
        step(&machine, &mut state, "PAUSE");
        step(&machine, &mut state, "RESUME");
        assert_eq!(state.value(&machine), sv(json!({"work": {"stage1": "b"}})));
    }

    #[test]
    fn test_after_scheduled_on_entry_cancelled_on_exit() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "wait",
            "states": {
                "wait": {"after": {"1500": "late"}, "on": {"SKIP": "early"}},
                "late": {},
                "early": {}
            }
        }))
        .unwrap();

        let mut runner = CollectingRunner::default();
        let mut state = initialize(&machine, None, &mut runner).unwrap();
        assert_eq!(
            runner.calls,
            vec![RunnerCall::ScheduleAfter {
                event_type: "after.1500.m.wait".to_string(),
                delay_ms: 1500
            }]
        );

        macrostep(&machine, &mut state, &Event::new("SKIP"), &mut runner).unwrap();
        assert!(runner
            .calls
            .contains(&RunnerCall::CancelAfter("after.1500.m.wait".to_string())));
        assert_eq!(state.value(&machine), StateValue::leaf("early"));

        // The timer's synthetic event drives the delayed transition.
        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        step(&machine, &mut state, "after.1500.m.wait");
        assert_eq!(state.value(&machine), StateValue::leaf("late"));
    }

    #[test]
    fn test_named_delay_resolved_through_implementations() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "wait",
            "states": {
                "wait": {"after": {"SHORT": "late"}},
                "late": {}
            }
        }))
        .unwrap()
        .with_implementations(Implementations::default().with_delay("SHORT", 25));

        let mut runner = CollectingRunner::default();
        initialize(&machine, None, &mut runner).unwrap();
        assert_eq!(
            runner.calls,
            vec![RunnerCall::ScheduleAfter {
                event_type: "after.SHORT.m.wait".to_string(),
                delay_ms: 25
            }]
        );
    }

    #[test]
    fn test_missing_named_delay_is_an_error() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "wait",
            "states": {"wait": {"after": {"SHORT": "late"}}, "late": {}}
        }))
        .unwrap();

        let err = initialize(&machine, None, &mut NoopRunner).unwrap_err();
        assert!(matches!(err, CoreError::MissingDelay { .. }));
    }

    #[test]
    fn test_invoke_spawned_on_entry_stopped_on_exit() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "context": {"userId": 42},
            "initial": "loading",
            "states": {
                "loading": {
                    "invoke": {
                        "src": "fetchUser",
                        "id": "fetch",
                        "input": {"user": {"$expr": "ctx.userId"}},
                        "onDone": "ready",
                        "onError": "failed"
                    },
                    "on": {"CANCEL": "idle"}
                },
                "ready": {},
                "failed": {},
                "idle": {}
            }
        }))
        .unwrap();

        let mut runner = CollectingRunner::default();
        let mut state = initialize(&machine, None, &mut runner).unwrap();
        assert_eq!(
            runner.calls,
            vec![RunnerCall::Spawn {
                src: "fetchUser".to_string(),
                id: Some("fetch".to_string()),
                input: Some(json!({"user": 42})),
                auto_start: true
            }]
        );

        macrostep(&machine, &mut state, &Event::new("CANCEL"), &mut runner).unwrap();
        assert!(runner
            .calls
            .contains(&RunnerCall::StopChild("fetch".to_string())));
        assert_eq!(state.value(&machine), StateValue::leaf("idle"));
    }

    #[test]
    fn test_invoke_done_and_error_events_route() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "loading",
            "states": {
                "loading": {
                    "invoke": {"src": "fetch", "onDone": "ready", "onError": "failed"}
                },
                "ready": {},
                "failed": {}
            }
        }))
        .unwrap();

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        let done = Event::done_invoke("fetch", Some(json!({"name": "ada"})));
        macrostep(&machine, &mut state, &done, &mut NoopRunner).unwrap();
        assert_eq!(state.value(&machine), StateValue::leaf("ready"));

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        let failed = Event::error_platform("fetch", json!("connection refused"));
        macrostep(&machine, &mut state, &failed, &mut NoopRunner).unwrap();
        assert_eq!(state.value(&machine), StateValue::leaf("failed"));
    }

    #[test]
    fn test_spawn_action_does_not_auto_start() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "s",
            "states": {
                "s": {"entry": {"type": "spawn", "src": "logger", "id": "log1"}}
            }
        }))
        .unwrap();

        let mut runner = CollectingRunner::default();
        initialize(&machine, None, &mut runner).unwrap();
        assert_eq!(
            runner.calls,
            vec![RunnerCall::Spawn {
                src: "logger".to_string(),
                id: Some("log1".to_string()),
                input: None,
                auto_start: false
            }]
        );
    }

    #[test]
    fn test_send_routing_and_undelayed_self_send() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "s",
            "states": {
                "s": {
                    "on": {
                        "PING_PARENT": {
                            "actions": [{"type": "send", "event": {"type": "PING"}, "to": "parent"}]
                        },
                        "PING_CHILD": {
                            "actions": [{
                                "type": "send", "event": {"type": "PING"},
                                "to": "worker", "delay": 50, "id": "ping1"
                            }]
                        },
                        "NUDGE": {
                            "actions": [{"type": "send", "event": {"type": "NUDGED"}}]
                        },
                        "NUDGED": "poked",
                        "ABORT": {"actions": [{"type": "cancel", "sendId": "ping1"}]}
                    }
                },
                "poked": {}
            }
        }))
        .unwrap();

        let mut runner = CollectingRunner::default();
        let mut state = initialize(&machine, None, &mut runner).unwrap();

        macrostep(&machine, &mut state, &Event::new("PING_PARENT"), &mut runner).unwrap();
        macrostep(&machine, &mut state, &Event::new("PING_CHILD"), &mut runner).unwrap();
        macrostep(&machine, &mut state, &Event::new("ABORT"), &mut runner).unwrap();
        assert_eq!(
            runner.calls,
            vec![
                RunnerCall::Send {
                    target: SendDest::Parent,
                    event_type: "PING".to_string(),
                    delay_ms: None,
                    id: None
                },
                RunnerCall::Send {
                    target: SendDest::Child("worker".to_string()),
                    event_type: "PING".to_string(),
                    delay_ms: Some(50),
                    id: Some("ping1".to_string())
                },
                RunnerCall::CancelSend("ping1".to_string())
            ]
        );

        // An undelayed self-send never reaches the runner; it joins
        // the running macrostep like a raise.
        runner.calls.clear();
        macrostep(&machine, &mut state, &Event::new("NUDGE"), &mut runner).unwrap();
        assert!(runner.calls.is_empty());
        assert_eq!(state.value(&machine), StateValue::leaf("poked"));
    }

    #[test]
    fn test_init_event_exposes_input() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "context": {"user": {"$expr": "event.input.name"}, "count": 0},
            "initial": "s",
            "states": {"s": {}}
        }))
        .unwrap();

        let state =
            initialize(&machine, Some(&json!({"name": "ada"})), &mut NoopRunner).unwrap();
        assert_eq!(state.context, json!({"user": "ada", "count": 0}));
    }

    #[test]
    fn test_unhandled_event_changes_nothing() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "context": {"n": 1},
            "initial": "a",
            "states": {"a": {"on": {"KNOWN": "b"}}, "b": {}}
        }))
        .unwrap();

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        let before = state.clone();
        step(&machine, &mut state, "UNKNOWN");
        assert_eq!(state.value(&machine), before.value(&machine));
        assert_eq!(state.context, before.context);
    }

    #[test]
    fn test_targetless_transition_runs_actions_without_exit() {
        let (log, record) = recorder();
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "s",
            "states": {
                "s": {
                    "entry": {"type": "record", "tag": "enter"},
                    "exit": {"type": "record", "tag": "exit"},
                    "on": {"POKE": {"actions": [{"type": "record", "tag": "poke"}]}}
                }
            }
        }))
        .unwrap()
        .with_implementations(Implementations::default().with_action("record", record));

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        step(&machine, &mut state, "POKE");
        step(&machine, &mut state, "POKE");
        assert_eq!(*log.lock().unwrap(), vec!["enter", "poke", "poke"]);
        assert_eq!(state.value(&machine), StateValue::leaf("s"));
    }

    #[test]
    fn test_missing_custom_action_is_an_error() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "s",
            "states": {"s": {"on": {"GO": {"actions": ["vanish"]}}}}
        }))
        .unwrap();

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        let err = macrostep(&machine, &mut state, &Event::new("GO"), &mut NoopRunner)
            .unwrap_err();
        assert!(matches!(err, CoreError::MissingAction { name } if name == "vanish"));
    }

    #[test]
    fn test_failing_custom_action_reports_name() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "s",
            "states": {"s": {"on": {"GO": {"actions": ["explode"]}}}}
        }))
        .unwrap()
        .with_implementations(Implementations::default().with_action(
            "explode",
            |_: &Value, _: &Event, _: Option<&Value>| {
                Err(CoreError::EffectFailed {
                    reason: "boom".to_string(),
                })
            },
        ));

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        let err = macrostep(&machine, &mut state, &Event::new("GO"), &mut NoopRunner)
            .unwrap_err();
        match err {
            CoreError::ActionFailed { action, reason } => {
                assert_eq!(action, "explode");
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_restore_value_context_and_history() {
        let machine = Machine::from_json(&json!({
            "id": "player",
            "context": {"plays": 0},
            "initial": "stopped",
            "states": {
                "stopped": {"on": {"PLAY": "#resume"}},
                "playing": {
                    "initial": "normal",
                    "on": {"STOP": "stopped"},
                    "states": {
                        "resume": {"id": "resume", "type": "history"},
                        "normal": {"on": {"FAST": "fast"}},
                        "fast": {}
                    }
                }
            }
        }))
        .unwrap();

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        step(&machine, &mut state, "PLAY");
        step(&machine, &mut state, "FAST");
        step(&machine, &mut state, "STOP");

        let value = state.value(&machine);
        let history = state.history_value(&machine);
        assert_eq!(history, json!({"resume": ["player.playing.fast"]}));

        let mut restored =
            MachineState::restore(&machine, &value, state.context.clone()).unwrap();
        restored.restore_history(&machine, &history).unwrap();
        step(&machine, &mut restored, "PLAY");
        assert_eq!(restored.value(&machine), sv(json!({"playing": "fast"})));
    }

    #[test]
    fn test_restore_rejects_unknown_ids() {
        let machine = Machine::from_json(&json!({
            "id": "m",
            "initial": "a",
            "states": {"a": {}, "b": {}}
        }))
        .unwrap();

        let err =
            MachineState::restore(&machine, &StateValue::leaf("nope"), json!({})).unwrap_err();
        assert!(matches!(err, CoreError::InvalidSnapshot { .. }));

        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        let err = state
            .restore_history(&machine, &json!({"ghost": ["a"]}))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidSnapshot { .. }));
    }

    fn determinism_machine() -> Machine {
        Machine::from_json(&json!({
            "id": "m",
            "context": {"n": 0, "mode": "idle"},
            "initial": "idle",
            "states": {
                "idle": {"on": {"GO": "busy"}},
                "busy": {
                    "type": "parallel",
                    "on": {"STOP": "idle"},
                    "states": {
                        "count": {
                            "initial": "s",
                            "states": {
                                "s": {
                                    "on": {
                                        "TOGGLE": {
                                            "actions": [{
                                                "type": "assign",
                                                "set": {"n": {"$expr": "ctx.n + 1"}}
                                            }]
                                        }
                                    }
                                }
                            }
                        },
                        "mode": {
                            "initial": "low",
                            "states": {
                                "low": {"on": {"TOGGLE": "high"}},
                                "high": {"on": {"TOGGLE": "low"}}
                            }
                        }
                    }
                }
            }
        }))
        .unwrap()
    }

    proptest! {
        #[test]
        fn test_event_sequences_are_deterministic(seq in proptest::collection::vec(0usize..3, 0..16)) {
            let events = ["GO", "STOP", "TOGGLE"];
            let run = |seq: &[usize]| {
                let machine = determinism_machine();
                let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
                for &i in seq {
                    macrostep(&machine, &mut state, &Event::new(events[i]), &mut NoopRunner)
                        .unwrap();
                }
                (state.value(&machine), state.context.clone())
            };
            prop_assert_eq!(run(&seq), run(&seq));
        }
    }
}
