//! Microsteps.
//!
//! One microstep moves the machine one configuration forward for a
//! single event (or for the eventless check):
//!
//! 1. selection: each active leaf walks its ancestor chain and
//!    contributes the first transition whose descriptor matches and
//!    whose guard passes (document order within a node, deeper states
//!    shadow their ancestors)
//! 2. conflict resolution: transitions whose exit sets overlap are
//!    mutually exclusive; a deeper source preempts its ancestor's
//!    transition, otherwise the earlier selection stays
//! 3. exits run in reverse document order, then transition actions in
//!    selection order, then entries in document order
//!
//! History memory is recorded from the pre-exit configuration whenever
//! a state owning a history child exits. Entering a final state raises
//! the matching `done.state.*` events; completion at the root marks
//! the machine done.

use crate::error::CoreError;
use crate::event::{descriptor_matches, Event};
use crate::guard::evaluate_opt;
use crate::machine::{Configuration, Machine, NodeId, StateKind, Transition, Trigger};
use crate::macrostep::{execute_actions, EffectRunner, MachineState, MachineStatus};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Selects the enabled transition set for one event, or for the
/// eventless check when `eventless` is set (the event is then only
/// visible to guards).
pub(crate) fn select_transitions<'m>(
    machine: &'m Machine,
    state: &MachineState,
    event: &Event,
    eventless: bool,
) -> Result<Vec<&'m Transition>, CoreError> {
    let mut selected: Vec<&'m Transition> = Vec::new();
    for leaf in active_leaves(machine, &state.configuration) {
        let Some(candidate) = first_enabled(machine, state, leaf, event, eventless)? else {
            continue;
        };
        let duplicate = selected
            .iter()
            .any(|t| t.source == candidate.source && t.index == candidate.index);
        if !duplicate {
            selected.push(candidate);
        }
    }
    Ok(remove_conflicting(machine, &state.configuration, selected))
}

/// Executes one microstep for an already-selected transition set.
pub(crate) fn fire(
    machine: &Machine,
    state: &mut MachineState,
    event: &Event,
    transitions: &[&Transition],
    internal: &mut VecDeque<Event>,
    runner: &mut dyn EffectRunner,
) -> Result<(), CoreError> {
    let domains: Vec<NodeId> = transitions
        .iter()
        .map(|t| transition_domain(machine, t))
        .collect();

    let mut exits: BTreeSet<NodeId> = BTreeSet::new();
    for (transition, &domain) in transitions.iter().zip(&domains) {
        if transition.targets.is_empty() {
            continue;
        }
        for &id in state.configuration.iter() {
            if machine.is_proper_ancestor(domain, id) {
                exits.insert(id);
            }
        }
    }

    record_history(machine, state, &exits);

    // Exit deepest-first: cancel delays, run exit actions, stop
    // invoked children, then drop the state from the configuration.
    for &id in exits.iter().rev() {
        let node = machine.node_ref(id);
        for after in &node.afters {
            runner.cancel_after(&after.event_type)?;
        }
        execute_actions(machine, &node.exit, state, event, internal, runner)?;
        for invoke in &node.invokes {
            runner.stop_child(&invoke.id)?;
        }
        state.configuration.remove(&id);
    }

    for transition in transitions {
        execute_actions(machine, &transition.actions, state, event, internal, runner)?;
    }

    let mut entry: BTreeSet<NodeId> = BTreeSet::new();
    for (transition, &domain) in transitions.iter().zip(&domains) {
        for &target in &transition.targets {
            add_target(machine, &state.history, &mut entry, target, domain);
        }
    }
    complete_parallels(machine, &state.history, &state.configuration, &mut entry);

    enter_nodes(machine, state, event, &entry, internal, runner)
}

/// Enters the machine's default configuration from a bare root.
pub(crate) fn enter_initial(
    machine: &Machine,
    state: &mut MachineState,
    event: &Event,
    internal: &mut VecDeque<Event>,
    runner: &mut dyn EffectRunner,
) -> Result<(), CoreError> {
    let mut entry = BTreeSet::new();
    descend(machine, &state.history, &mut entry, machine.root());
    complete_parallels(machine, &state.history, &state.configuration, &mut entry);
    enter_nodes(machine, state, event, &entry, internal, runner)?;

    if matches!(machine.node_ref(machine.root()).kind, StateKind::Final) {
        state.output = machine
            .node_ref(machine.root())
            .output
            .as_ref()
            .map(|dv| dv.evaluate(&state.context, event));
        state.status = MachineStatus::Done;
    }
    Ok(())
}

fn active_leaves(machine: &Machine, config: &Configuration) -> Vec<NodeId> {
    config
        .iter()
        .copied()
        .filter(|&id| {
            !machine
                .node_ref(id)
                .children
                .iter()
                .any(|child| config.contains(child))
        })
        .collect()
}

fn first_enabled<'m>(
    machine: &'m Machine,
    state: &MachineState,
    from: NodeId,
    event: &Event,
    eventless: bool,
) -> Result<Option<&'m Transition>, CoreError> {
    let mut current = Some(from);
    while let Some(id) = current {
        let node = machine.node_ref(id);
        for transition in &node.transitions {
            let triggered = match (&transition.trigger, eventless) {
                (Trigger::Always, true) => true,
                (Trigger::Pattern(descriptor), false) => {
                    descriptor_matches(descriptor, &event.event_type)
                }
                _ => false,
            };
            if !triggered {
                continue;
            }
            if evaluate_opt(
                transition.guard.as_ref(),
                &state.context,
                event,
                machine.implementations().guards(),
            )? {
                return Ok(Some(transition));
            }
        }
        current = node.parent;
    }
    Ok(None)
}

fn remove_conflicting<'m>(
    machine: &'m Machine,
    config: &Configuration,
    selected: Vec<&'m Transition>,
) -> Vec<&'m Transition> {
    let mut kept: Vec<(&'m Transition, BTreeSet<NodeId>)> = Vec::new();
    'candidates: for candidate in selected {
        let candidate_exit = exit_set(machine, config, candidate);
        let mut replaced = Vec::new();
        for (i, (existing, existing_exit)) in kept.iter().enumerate() {
            if candidate_exit.is_disjoint(existing_exit) {
                continue;
            }
            if machine.is_proper_ancestor(existing.source, candidate.source) {
                // Deeper source preempts its ancestor's transition.
                replaced.push(i);
            } else {
                continue 'candidates;
            }
        }
        for i in replaced.into_iter().rev() {
            kept.remove(i);
        }
        kept.push((candidate, candidate_exit));
    }
    kept.into_iter().map(|(transition, _)| transition).collect()
}

/// The state whose active descendants a transition replaces.
pub(crate) fn transition_domain(machine: &Machine, transition: &Transition) -> NodeId {
    if transition.targets.is_empty() {
        return transition.source;
    }
    let source = transition.source;
    if transition.internal
        && transition
            .targets
            .iter()
            .all(|&target| target == source || machine.is_proper_ancestor(source, target))
    {
        return source;
    }
    lcca(machine, source, &transition.targets)
}

/// Least common compound ancestor of a source and its targets; the
/// root serves as the ultimate fallback domain.
fn lcca(machine: &Machine, source: NodeId, targets: &[NodeId]) -> NodeId {
    for ancestor in machine.ancestors(source) {
        let compound_like = matches!(machine.node_ref(ancestor).kind, StateKind::Compound { .. })
            || ancestor == machine.root();
        if !compound_like {
            continue;
        }
        if targets
            .iter()
            .all(|&target| machine.is_proper_ancestor(ancestor, target))
        {
            return ancestor;
        }
    }
    machine.root()
}

fn exit_set(
    machine: &Machine,
    config: &Configuration,
    transition: &Transition,
) -> BTreeSet<NodeId> {
    if transition.targets.is_empty() {
        return BTreeSet::new();
    }
    let domain = transition_domain(machine, transition);
    config
        .iter()
        .copied()
        .filter(|&id| machine.is_proper_ancestor(domain, id))
        .collect()
}

/// Records history memory for every exiting state that owns a history
/// child, reading the configuration as it was before the exit.
fn record_history(machine: &Machine, state: &mut MachineState, exits: &BTreeSet<NodeId>) {
    for &id in exits {
        let node = machine.node_ref(id);
        for &child in &node.children {
            let StateKind::History { deep } = machine.node_ref(child).kind else {
                continue;
            };
            let recorded: Vec<NodeId> = if deep {
                state
                    .configuration
                    .iter()
                    .copied()
                    .filter(|&n| machine.is_proper_ancestor(id, n))
                    .filter(|&n| {
                        !machine
                            .node_ref(n)
                            .children
                            .iter()
                            .any(|c| state.configuration.contains(c))
                    })
                    .collect()
            } else {
                node.children
                    .iter()
                    .copied()
                    .filter(|c| state.configuration.contains(c))
                    .collect()
            };
            if !recorded.is_empty() {
                state.history.insert(child, recorded);
            }
        }
    }
}

fn add_target(
    machine: &Machine,
    history: &HashMap<NodeId, Vec<NodeId>>,
    entry: &mut BTreeSet<NodeId>,
    target: NodeId,
    domain: NodeId,
) {
    if matches!(machine.node_ref(target).kind, StateKind::History { .. }) {
        // The pseudostate itself never becomes active; enter its
        // parent chain and whatever its memory resolves to.
        if let Some(parent) = machine.node_ref(target).parent {
            add_chain(machine, entry, parent, domain);
        }
        resolve_history(machine, history, entry, target);
    } else {
        add_chain(machine, entry, target, domain);
        descend(machine, history, entry, target);
    }
}

fn add_chain(machine: &Machine, entry: &mut BTreeSet<NodeId>, from: NodeId, domain: NodeId) {
    let mut current = Some(from);
    while let Some(id) = current {
        if id == domain {
            break;
        }
        entry.insert(id);
        current = machine.node_ref(id).parent;
    }
}

fn descend(
    machine: &Machine,
    history: &HashMap<NodeId, Vec<NodeId>>,
    entry: &mut BTreeSet<NodeId>,
    node: NodeId,
) {
    match machine.node_ref(node).kind {
        StateKind::Compound { initial } => {
            entry.insert(initial);
            descend(machine, history, entry, initial);
        }
        StateKind::Parallel => {
            for &region in &machine.node_ref(node).children {
                entry.insert(region);
                descend(machine, history, entry, region);
            }
        }
        StateKind::History { .. } => {
            resolve_history(machine, history, entry, node);
        }
        StateKind::Atomic | StateKind::Final => {}
    }
}

fn resolve_history(
    machine: &Machine,
    history: &HashMap<NodeId, Vec<NodeId>>,
    entry: &mut BTreeSet<NodeId>,
    node: NodeId,
) {
    let StateKind::History { deep } = machine.node_ref(node).kind else {
        return;
    };
    let Some(parent) = machine.node_ref(node).parent else {
        return;
    };
    match history.get(&node) {
        Some(recorded) if !recorded.is_empty() => {
            if deep {
                // Recorded leaves form a complete sub-configuration;
                // entering each leaf plus its chain below the parent
                // restores the whole subtree.
                for &leaf in recorded {
                    entry.insert(leaf);
                    let mut current = machine.node_ref(leaf).parent;
                    while let Some(id) = current {
                        if id == parent {
                            break;
                        }
                        entry.insert(id);
                        current = machine.node_ref(id).parent;
                    }
                }
            } else {
                for &child in recorded {
                    entry.insert(child);
                    descend(machine, history, entry, child);
                }
            }
        }
        _ => {
            // No memory yet: fall back to the parent's initial child.
            if let StateKind::Compound { initial } = machine.node_ref(parent).kind {
                entry.insert(initial);
                descend(machine, history, entry, initial);
            }
        }
    }
}

/// Entering any parallel state requires every region to be covered,
/// either by the entry set or by states that stayed active.
fn complete_parallels(
    machine: &Machine,
    history: &HashMap<NodeId, Vec<NodeId>>,
    config: &Configuration,
    entry: &mut BTreeSet<NodeId>,
) {
    loop {
        let parallels: Vec<NodeId> = entry
            .iter()
            .copied()
            .filter(|&id| matches!(machine.node_ref(id).kind, StateKind::Parallel))
            .collect();
        let mut changed = false;
        for parallel in parallels {
            for &region in &machine.node_ref(parallel).children {
                if entry.contains(&region) || config.contains(&region) {
                    continue;
                }
                entry.insert(region);
                descend(machine, history, entry, region);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

fn enter_nodes(
    machine: &Machine,
    state: &mut MachineState,
    event: &Event,
    entry: &BTreeSet<NodeId>,
    internal: &mut VecDeque<Event>,
    runner: &mut dyn EffectRunner,
) -> Result<(), CoreError> {
    for &id in entry {
        state.configuration.insert(id);
        let node = machine.node_ref(id);
        execute_actions(machine, &node.entry, state, event, internal, runner)?;
        for after in &node.afters {
            let ms = machine
                .implementations()
                .resolve_delay(&after.delay, &state.context, event)?;
            runner.schedule_after(&after.event_type, ms)?;
        }
        for invoke in &node.invokes {
            let input = invoke
                .input
                .as_ref()
                .map(|input| input.evaluate(&state.context, event));
            runner.spawn_child(&invoke.src, Some(&invoke.id), input, true)?;
        }
        if matches!(node.kind, StateKind::Final) {
            handle_final_entry(machine, state, event, id, internal);
            if state.status == MachineStatus::Done {
                break;
            }
        }
    }
    Ok(())
}

fn handle_final_entry(
    machine: &Machine,
    state: &mut MachineState,
    event: &Event,
    final_id: NodeId,
    internal: &mut VecDeque<Event>,
) {
    let output = machine
        .node_ref(final_id)
        .output
        .as_ref()
        .map(|dv| dv.evaluate(&state.context, event));
    let Some(parent) = machine.node_ref(final_id).parent else {
        state.status = MachineStatus::Done;
        state.output = output;
        return;
    };
    match machine.node_ref(parent).kind {
        StateKind::Compound { .. } => {
            emit_done_state(machine, state, internal, parent, output);
            if state.status == MachineStatus::Done {
                return;
            }
            if let Some(grandparent) = machine.node_ref(parent).parent {
                if matches!(machine.node_ref(grandparent).kind, StateKind::Parallel)
                    && machine
                        .node_ref(grandparent)
                        .children
                        .iter()
                        .all(|&region| region_done(machine, &state.configuration, region))
                {
                    emit_done_state(machine, state, internal, grandparent, None);
                }
            }
        }
        StateKind::Parallel => {
            if machine
                .node_ref(parent)
                .children
                .iter()
                .all(|&region| region_done(machine, &state.configuration, region))
            {
                emit_done_state(machine, state, internal, parent, None);
            }
        }
        _ => {}
    }
}

fn emit_done_state(
    machine: &Machine,
    state: &mut MachineState,
    internal: &mut VecDeque<Event>,
    node: NodeId,
    output: Option<Value>,
) {
    if node == machine.root() {
        state.status = MachineStatus::Done;
        state.output = output;
    } else {
        internal.push_back(Event::done_state(&machine.node_ref(node).state_id, output));
    }
}

fn region_done(machine: &Machine, config: &Configuration, region: NodeId) -> bool {
    match machine.node_ref(region).kind {
        StateKind::Compound { .. } => machine.node_ref(region).children.iter().any(|&child| {
            config.contains(&child) && matches!(machine.node_ref(child).kind, StateKind::Final)
        }),
        StateKind::Parallel => machine
            .node_ref(region)
            .children
            .iter()
            .all(|&child| region_done(machine, config, child)),
        StateKind::Final => config.contains(&region),
        StateKind::Atomic | StateKind::History { .. } => false,
    }
}
