//! Compiled machines.
//!
//! A [`Machine`] is the validated, immutable form of a definition:
//!
//! - states live in a preorder arena (`Vec<StateNode>`), so a `NodeId`
//!   doubles as document order: ascending ids are entry order,
//!   descending ids are exit order
//! - every transition target is resolved to a `NodeId` at compile time
//! - `after` declarations become synthetic `after.<delay>.<id>` event
//!   listeners, `onDone`/`onError` become listeners for the reserved
//!   `done.*`/`error.platform.*` namespaces
//!
//! Guards, actions, updaters, and named delays referenced by name
//! resolve at execution time through [`Implementations`].

use crate::action::{Action, Delay};
use crate::context::resolve_initial_context;
use crate::definition::{MachineDef, StateDef, TransitionDef};
use crate::error::CoreError;
use crate::event::Event;
use crate::guard::{Guard, GuardFn};
use crate::state_value::StateValue;
use crate::value::DynValue;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Index of a state in the machine's preorder arena.
pub type NodeId = usize;

/// The set of simultaneously active states, root included.
pub type Configuration = BTreeSet<NodeId>;

/// Custom action implementation: context, event, evaluated params.
pub type ActionFn =
    Arc<dyn Fn(&Value, &Event, Option<&Value>) -> Result<(), CoreError> + Send + Sync>;

/// Named assign updater: returns the full next context.
pub type UpdaterFn = Arc<dyn Fn(&Value, &Event) -> Value + Send + Sync>;

/// Named delay: returns milliseconds for the given context and event.
pub type DelayFn = Arc<dyn Fn(&Value, &Event) -> u64 + Send + Sync>;

/// State node variants, dispatched exhaustively by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Atomic,
    Compound { initial: NodeId },
    Parallel,
    History { deep: bool },
    Final,
}

/// What causes a transition to be considered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Eventless: checked after every microstep.
    Always,
    /// An event descriptor: exact type, `*`, or a `prefix.*` pattern.
    Pattern(String),
}

/// A compiled transition.
#[derive(Debug, Clone)]
pub struct Transition {
    pub source: NodeId,
    pub trigger: Trigger,
    pub guard: Option<Guard>,
    /// Empty for targetless (action-only) transitions.
    pub targets: Vec<NodeId>,
    pub actions: Vec<Action>,
    pub internal: bool,
    /// Position within the source node's transition list.
    pub index: usize,
}

/// A compiled invoke declaration.
#[derive(Debug, Clone)]
pub struct Invoke {
    pub src: String,
    pub id: String,
    pub input: Option<DynValue>,
}

/// A compiled `after` delay on a state.
#[derive(Debug, Clone)]
pub struct After {
    pub delay: Delay,
    /// The synthetic event type, `after.<delay>.<state id>`.
    pub event_type: String,
}

/// One state in the compiled tree.
#[derive(Debug, Clone)]
pub struct StateNode {
    pub id: NodeId,
    /// Key under the parent's `states` map; the machine id for the root.
    pub key: String,
    /// Global id: custom `id` or the dot-joined path from the root.
    pub state_id: String,
    pub parent: Option<NodeId>,
    pub depth: usize,
    pub kind: StateKind,
    pub children: Vec<NodeId>,
    pub transitions: Vec<Transition>,
    pub entry: Vec<Action>,
    pub exit: Vec<Action>,
    pub invokes: Vec<Invoke>,
    pub afters: Vec<After>,
    /// Done-data mapping; final nodes only.
    pub output: Option<DynValue>,
}

/// Named guards, actions, updaters, and delays referenced from a
/// definition.
#[derive(Clone, Default)]
pub struct Implementations {
    guards: HashMap<String, GuardFn>,
    actions: HashMap<String, ActionFn>,
    updaters: HashMap<String, UpdaterFn>,
    delays: HashMap<String, DelayFn>,
}

impl Implementations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_guard(
        mut self,
        name: impl Into<String>,
        guard: impl Fn(&Value, &Event) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.guards.insert(name.into(), Arc::new(guard));
        self
    }

    pub fn with_action(
        mut self,
        name: impl Into<String>,
        action: impl Fn(&Value, &Event, Option<&Value>) -> Result<(), CoreError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.actions.insert(name.into(), Arc::new(action));
        self
    }

    pub fn with_updater(
        mut self,
        name: impl Into<String>,
        updater: impl Fn(&Value, &Event) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.updaters.insert(name.into(), Arc::new(updater));
        self
    }

    /// Registers a fixed named delay.
    pub fn with_delay(self, name: impl Into<String>, ms: u64) -> Self {
        self.with_delay_fn(name, move |_, _| ms)
    }

    /// Registers a delay computed from context and event.
    pub fn with_delay_fn(
        mut self,
        name: impl Into<String>,
        delay: impl Fn(&Value, &Event) -> u64 + Send + Sync + 'static,
    ) -> Self {
        self.delays.insert(name.into(), Arc::new(delay));
        self
    }

    pub(crate) fn guards(&self) -> &HashMap<String, GuardFn> {
        &self.guards
    }

    pub(crate) fn action(&self, name: &str) -> Option<&ActionFn> {
        self.actions.get(name)
    }

    pub(crate) fn updater(&self, name: &str) -> Option<&UpdaterFn> {
        self.updaters.get(name)
    }

    /// Resolves a delay to milliseconds.
    pub fn resolve_delay(
        &self,
        delay: &Delay,
        ctx: &Value,
        event: &Event,
    ) -> Result<u64, CoreError> {
        match delay {
            Delay::Ms(ms) => Ok(*ms),
            Delay::Named(name) => match self.delays.get(name) {
                Some(f) => Ok(f(ctx, event)),
                None => Err(CoreError::MissingDelay { name: name.clone() }),
            },
        }
    }
}

impl fmt::Debug for Implementations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Implementations")
            .field("guards", &self.guards.keys().collect::<Vec<_>>())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("updaters", &self.updaters.keys().collect::<Vec<_>>())
            .field("delays", &self.delays.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A validated, immutable machine.
#[derive(Debug, Clone)]
pub struct Machine {
    nodes: Vec<StateNode>,
    ids: HashMap<String, NodeId>,
    machine_id: String,
    checksum: String,
    context_def: Option<Value>,
    eventless_limit: usize,
    implementations: Implementations,
}

/// Default bound on microsteps within one macrostep.
pub const DEFAULT_EVENTLESS_LIMIT: usize = 100;

impl Machine {
    /// Compiles a machine from a JSON definition.
    pub fn from_json(json: &Value) -> Result<Self, CoreError> {
        Self::from_def(MachineDef::from_json(json)?)
    }

    /// Compiles a machine from a YAML definition.
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        Self::from_def(MachineDef::from_yaml(yaml)?)
    }

    /// Compiles a parsed definition.
    pub fn from_def(def: MachineDef) -> Result<Self, CoreError> {
        // The checksum covers the normalized document, so the same
        // machine hashes identically whether it came from JSON or YAML.
        let checksum = format!("{:08x}", crc32c::crc32c(&serde_json::to_vec(&def)?));
        let machine_id = def
            .root
            .id
            .clone()
            .unwrap_or_else(|| "(machine)".to_string());

        let mut raw = Vec::new();
        flatten(&mut raw, machine_id.clone(), &def.root, None);

        let mut ids = HashMap::with_capacity(raw.len());
        for (node_id, node) in raw.iter().enumerate() {
            if ids.insert(node.state_id.clone(), node_id).is_some() {
                return Err(CoreError::DuplicateStateId {
                    id: node.state_id.clone(),
                });
            }
        }

        // Preorder guarantees a parent is classified before its
        // children, which history validation relies on.
        let mut kinds = Vec::with_capacity(raw.len());
        for node_id in 0..raw.len() {
            let kind = resolve_kind(&raw, &kinds, node_id)?;
            kinds.push(kind);
        }

        let mut nodes = Vec::with_capacity(raw.len());
        for (node_id, rn) in raw.iter().enumerate() {
            let (transitions, afters, invokes) =
                compile_node_behavior(&raw, &ids, &kinds, node_id)?;

            if rn.def.output.is_some() && !matches!(kinds[node_id], StateKind::Final) {
                return Err(CoreError::InvalidDefinition {
                    reason: format!(
                        "'output' is only allowed on final states (state '{}')",
                        rn.state_id
                    ),
                });
            }
            if rn.def.history.is_some() && !matches!(kinds[node_id], StateKind::History { .. })
            {
                return Err(CoreError::InvalidDefinition {
                    reason: format!(
                        "'history' is only allowed on history states (state '{}')",
                        rn.state_id
                    ),
                });
            }

            nodes.push(StateNode {
                id: node_id,
                key: rn.key.clone(),
                state_id: rn.state_id.clone(),
                parent: rn.parent,
                depth: rn.depth,
                kind: kinds[node_id],
                children: rn.children.clone(),
                transitions,
                entry: Action::compile_list(&rn.def.entry.0)?,
                exit: Action::compile_list(&rn.def.exit.0)?,
                invokes,
                afters,
                output: rn.def.output.as_ref().map(DynValue::compile).transpose()?,
            });
        }

        Ok(Machine {
            nodes,
            ids,
            machine_id,
            checksum,
            context_def: def.context.clone(),
            eventless_limit: DEFAULT_EVENTLESS_LIMIT,
            implementations: Implementations::default(),
        })
    }

    /// Attaches named guard/action/updater/delay implementations.
    pub fn with_implementations(mut self, implementations: Implementations) -> Self {
        self.implementations = implementations;
        self
    }

    /// Overrides the microstep bound for one macrostep.
    pub fn with_eventless_limit(mut self, limit: usize) -> Self {
        self.eventless_limit = limit.max(1);
        self
    }

    pub fn id(&self) -> &str {
        &self.machine_id
    }

    /// Checksum of the normalized definition, `{:08x}` crc32c.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn eventless_limit(&self) -> usize {
        self.eventless_limit
    }

    pub fn implementations(&self) -> &Implementations {
        &self.implementations
    }

    pub(crate) fn context_def(&self) -> Option<&Value> {
        self.context_def.as_ref()
    }

    /// Resolves the initial context for a start input.
    pub fn initial_context(&self, input: Option<&Value>) -> Result<Value, CoreError> {
        resolve_initial_context(self.context_def(), input)
    }

    pub fn root(&self) -> NodeId {
        0
    }

    /// Looks up a node by arena id, `None` when out of range.
    pub fn node(&self, id: NodeId) -> Option<&StateNode> {
        self.nodes.get(id)
    }

    /// Infallible access for ids produced by this machine's arena.
    pub(crate) fn node_ref(&self, id: NodeId) -> &StateNode {
        &self.nodes[id]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Looks up a state by its global id.
    pub fn node_by_state_id(&self, state_id: &str) -> Option<NodeId> {
        self.ids.get(state_id).copied()
    }

    /// True when `ancestor` is a proper ancestor of `node`.
    pub fn is_proper_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = self.nodes[node].parent;
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes[id].parent;
        }
        false
    }

    /// Proper ancestors of `node`, nearest first.
    pub fn ancestors(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.nodes[node].parent;
        while let Some(id) = current {
            out.push(id);
            current = self.nodes[id].parent;
        }
        out
    }

    /// The configuration reached by default entry, without running any
    /// entry actions. Used for pre-start snapshots and restore.
    pub fn initial_configuration(&self) -> Configuration {
        let mut config = Configuration::new();
        config.insert(self.root());
        self.default_descend(self.root(), &mut config);
        config
    }

    /// Adds the default descendants of an entered node to `config`.
    pub(crate) fn default_descend(&self, node: NodeId, config: &mut Configuration) {
        match self.nodes[node].kind {
            StateKind::Compound { initial } => {
                config.insert(initial);
                self.default_descend(initial, config);
            }
            StateKind::Parallel => {
                for &child in &self.nodes[node].children {
                    config.insert(child);
                    self.default_descend(child, config);
                }
            }
            StateKind::Atomic | StateKind::Final | StateKind::History { .. } => {}
        }
    }

    /// The hierarchical value of a configuration.
    pub fn state_value(&self, config: &Configuration) -> StateValue {
        self.value_below(self.root(), config)
    }

    fn value_below(&self, node: NodeId, config: &Configuration) -> StateValue {
        let n = &self.nodes[node];
        match n.kind {
            StateKind::Parallel => {
                let mut map = BTreeMap::new();
                for &child in &n.children {
                    if config.contains(&child) {
                        map.insert(self.nodes[child].key.clone(), self.value_below(child, config));
                    }
                }
                StateValue::Compound(map)
            }
            _ => {
                let active = n.children.iter().copied().find(|c| config.contains(c));
                match active {
                    None => StateValue::Leaf(n.key.clone()),
                    Some(child) => {
                        let deeper = self.nodes[child]
                            .children
                            .iter()
                            .any(|g| config.contains(g));
                        if deeper {
                            StateValue::nested(
                                self.nodes[child].key.clone(),
                                self.value_below(child, config),
                            )
                        } else {
                            StateValue::Leaf(self.nodes[child].key.clone())
                        }
                    }
                }
            }
        }
    }

    /// Rebuilds a configuration from a state value, default-descending
    /// anywhere the value is shallower than the tree.
    pub fn configuration_from_value(
        &self,
        value: &StateValue,
    ) -> Result<Configuration, CoreError> {
        let mut config = Configuration::new();
        config.insert(self.root());
        let root = &self.nodes[self.root()];
        if root.children.is_empty() {
            // Childless root: the value is the root's own key.
            return match value {
                StateValue::Leaf(key) if *key == root.key => Ok(config),
                _ => Err(CoreError::InvalidSnapshot {
                    reason: format!("machine '{}' has no child states", root.state_id),
                }),
            };
        }
        self.restore_below(self.root(), value, &mut config)?;
        Ok(config)
    }

    fn restore_below(
        &self,
        node: NodeId,
        value: &StateValue,
        config: &mut Configuration,
    ) -> Result<(), CoreError> {
        let n = &self.nodes[node];
        match (&n.kind, value) {
            (StateKind::Parallel, StateValue::Compound(map)) => {
                for key in map.keys() {
                    if !n
                        .children
                        .iter()
                        .any(|&c| self.nodes[c].key == *key)
                    {
                        return Err(CoreError::InvalidSnapshot {
                            reason: format!(
                                "unknown region '{}' under '{}'",
                                key, n.state_id
                            ),
                        });
                    }
                }
                for &child in &n.children {
                    config.insert(child);
                    match map.get(&self.nodes[child].key) {
                        Some(sub) => self.restore_below(child, sub, config)?,
                        None => self.default_descend(child, config),
                    }
                }
                Ok(())
            }
            (StateKind::Parallel, StateValue::Leaf(_)) => Err(CoreError::InvalidSnapshot {
                reason: format!(
                    "parallel state '{}' requires an object value",
                    n.state_id
                ),
            }),
            (_, StateValue::Leaf(key)) => {
                let child = self.child_by_key(node, key).ok_or_else(|| {
                    CoreError::InvalidSnapshot {
                        reason: format!("unknown state '{}' under '{}'", key, n.state_id),
                    }
                })?;
                config.insert(child);
                self.default_descend(child, config);
                Ok(())
            }
            (_, StateValue::Compound(map)) => {
                if map.len() != 1 {
                    return Err(CoreError::InvalidSnapshot {
                        reason: format!(
                            "state '{}' expects exactly one active child",
                            n.state_id
                        ),
                    });
                }
                let (key, sub) = map.iter().next().ok_or_else(|| {
                    CoreError::InvalidSnapshot {
                        reason: format!("state '{}' has an empty value", n.state_id),
                    }
                })?;
                let child = self.child_by_key(node, key).ok_or_else(|| {
                    CoreError::InvalidSnapshot {
                        reason: format!("unknown state '{}' under '{}'", key, n.state_id),
                    }
                })?;
                config.insert(child);
                self.restore_below(child, sub, config)
            }
        }
    }

    fn child_by_key(&self, node: NodeId, key: &str) -> Option<NodeId> {
        self.nodes[node]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c].key == key)
    }
}

struct RawNode<'a> {
    def: &'a StateDef,
    key: String,
    state_id: String,
    parent: Option<NodeId>,
    depth: usize,
    children: Vec<NodeId>,
}

fn flatten<'a>(
    raw: &mut Vec<RawNode<'a>>,
    key: String,
    def: &'a StateDef,
    parent: Option<NodeId>,
) -> NodeId {
    let node_id = raw.len();
    let state_id = match &def.id {
        Some(custom) => custom.clone(),
        None => match parent {
            None => key.clone(),
            Some(p) => format!("{}.{}", raw[p].state_id, key),
        },
    };
    let depth = parent.map_or(0, |p| raw[p].depth + 1);
    raw.push(RawNode {
        def,
        key,
        state_id,
        parent,
        depth,
        children: Vec::new(),
    });
    for (child_key, child_def) in &def.states {
        let child = flatten(raw, child_key.clone(), child_def, Some(node_id));
        raw[node_id].children.push(child);
    }
    node_id
}

fn is_history_def(def: &StateDef) -> bool {
    def.kind.as_deref() == Some("history")
}

fn resolve_kind(
    raw: &[RawNode<'_>],
    kinds: &[StateKind],
    node_id: NodeId,
) -> Result<StateKind, CoreError> {
    let rn = &raw[node_id];
    match rn.def.kind.as_deref() {
        Some("parallel") => {
            if rn.children.is_empty() {
                return Err(CoreError::InvalidDefinition {
                    reason: format!("parallel state '{}' must declare child regions", rn.state_id),
                });
            }
            if rn.def.initial.is_some() {
                return Err(CoreError::InvalidDefinition {
                    reason: format!("parallel state '{}' cannot declare 'initial'", rn.state_id),
                });
            }
            Ok(StateKind::Parallel)
        }
        Some("history") => {
            let parent = rn.parent.ok_or_else(|| CoreError::InvalidDefinition {
                reason: "the root state cannot be a history state".to_string(),
            })?;
            if !matches!(kinds[parent], StateKind::Compound { .. }) {
                return Err(CoreError::InvalidDefinition {
                    reason: format!(
                        "history state '{}' must be the child of a compound state",
                        rn.state_id
                    ),
                });
            }
            if !rn.children.is_empty() {
                return Err(CoreError::InvalidDefinition {
                    reason: format!("history state '{}' cannot have children", rn.state_id),
                });
            }
            let deep = match rn.def.history.as_deref() {
                None | Some("shallow") => false,
                Some("deep") => true,
                Some(other) => {
                    return Err(CoreError::InvalidDefinition {
                        reason: format!(
                            "history must be 'shallow' or 'deep', got '{other}' in '{}'",
                            rn.state_id
                        ),
                    })
                }
            };
            Ok(StateKind::History { deep })
        }
        Some("final") => {
            if !rn.children.is_empty() {
                return Err(CoreError::InvalidDefinition {
                    reason: format!("final state '{}' cannot have children", rn.state_id),
                });
            }
            if !rn.def.on.is_empty()
                || rn.def.always.is_some()
                || !rn.def.after.is_empty()
                || !rn.def.invoke.is_empty()
            {
                return Err(CoreError::InvalidDefinition {
                    reason: format!(
                        "final state '{}' cannot declare transitions or invocations",
                        rn.state_id
                    ),
                });
            }
            Ok(StateKind::Final)
        }
        Some("atomic") => {
            if !rn.children.is_empty() {
                return Err(CoreError::InvalidDefinition {
                    reason: format!("atomic state '{}' cannot have children", rn.state_id),
                });
            }
            Ok(StateKind::Atomic)
        }
        Some("compound") | None if !rn.children.is_empty() => {
            let initial = match rn.def.initial.as_deref() {
                Some(key) => {
                    let child = rn
                        .children
                        .iter()
                        .copied()
                        .find(|&c| raw[c].key == key)
                        .ok_or_else(|| CoreError::InvalidDefinition {
                            reason: format!(
                                "initial state '{}' not found in '{}'",
                                key, rn.state_id
                            ),
                        })?;
                    if is_history_def(raw[child].def) {
                        return Err(CoreError::InvalidDefinition {
                            reason: format!(
                                "initial of '{}' cannot be a history state",
                                rn.state_id
                            ),
                        });
                    }
                    child
                }
                None => rn
                    .children
                    .iter()
                    .copied()
                    .find(|&c| !is_history_def(raw[c].def))
                    .ok_or_else(|| CoreError::InvalidDefinition {
                        reason: format!(
                            "compound state '{}' has no enterable child",
                            rn.state_id
                        ),
                    })?,
            };
            Ok(StateKind::Compound { initial })
        }
        Some("compound") => Err(CoreError::InvalidDefinition {
            reason: format!("compound state '{}' must declare children", rn.state_id),
        }),
        None => Ok(StateKind::Atomic),
        Some(other) => Err(CoreError::InvalidDefinition {
            reason: format!("unknown state type '{other}' in '{}'", rn.state_id),
        }),
    }
}

fn compile_node_behavior(
    raw: &[RawNode<'_>],
    ids: &HashMap<String, NodeId>,
    kinds: &[StateKind],
    node_id: NodeId,
) -> Result<(Vec<Transition>, Vec<After>, Vec<Invoke>), CoreError> {
    let rn = &raw[node_id];
    let mut transitions: Vec<Transition> = Vec::new();

    let push = |transitions: &mut Vec<Transition>,
                    trigger: Trigger,
                    tdef: &TransitionDef|
     -> Result<(), CoreError> {
        let index = transitions.len();
        transitions.push(compile_transition(raw, ids, kinds, node_id, trigger, tdef, index)?);
        Ok(())
    };

    for (descriptor, list) in &rn.def.on {
        for tdef in &list.0 {
            push(&mut transitions, Trigger::Pattern(descriptor.clone()), tdef)?;
        }
    }

    if let Some(list) = &rn.def.on_done {
        if !matches!(
            kinds[node_id],
            StateKind::Compound { .. } | StateKind::Parallel
        ) {
            return Err(CoreError::InvalidDefinition {
                reason: format!(
                    "'onDone' is only allowed on compound or parallel states (state '{}')",
                    rn.state_id
                ),
            });
        }
        let descriptor = format!("done.state.{}", rn.state_id);
        for tdef in &list.0 {
            push(&mut transitions, Trigger::Pattern(descriptor.clone()), tdef)?;
        }
    }

    let mut invokes: Vec<Invoke> = Vec::new();
    for inv in &rn.def.invoke.0 {
        let child_id = inv.child_id().to_string();
        if invokes.iter().any(|existing| existing.id == child_id) {
            return Err(CoreError::InvalidDefinition {
                reason: format!(
                    "duplicate invoke id '{}' in state '{}'",
                    child_id, rn.state_id
                ),
            });
        }
        if let Some(list) = &inv.on_done {
            let descriptor = format!("done.invoke.{child_id}");
            for tdef in &list.0 {
                push(&mut transitions, Trigger::Pattern(descriptor.clone()), tdef)?;
            }
        }
        if let Some(list) = &inv.on_error {
            let descriptor = format!("error.platform.{child_id}");
            for tdef in &list.0 {
                push(&mut transitions, Trigger::Pattern(descriptor.clone()), tdef)?;
            }
        }
        invokes.push(Invoke {
            src: inv.src.clone(),
            id: child_id,
            input: inv.input.as_ref().map(DynValue::compile).transpose()?,
        });
    }

    let mut afters: Vec<After> = Vec::new();
    for (key, list) in &rn.def.after {
        let delay = Delay::parse_key(key);
        let event_type = Event::after_type(&delay.key(), &rn.state_id);
        for tdef in &list.0 {
            push(&mut transitions, Trigger::Pattern(event_type.clone()), tdef)?;
        }
        afters.push(After { delay, event_type });
    }

    if let Some(list) = &rn.def.always {
        for tdef in &list.0 {
            if tdef.guard.is_none() && tdef.targets().is_empty() {
                return Err(CoreError::InvalidDefinition {
                    reason: format!(
                        "eventless transition in '{}' needs a guard or a target",
                        rn.state_id
                    ),
                });
            }
            push(&mut transitions, Trigger::Always, tdef)?;
        }
    }

    Ok((transitions, afters, invokes))
}

fn compile_transition(
    raw: &[RawNode<'_>],
    ids: &HashMap<String, NodeId>,
    kinds: &[StateKind],
    source: NodeId,
    trigger: Trigger,
    tdef: &TransitionDef,
    index: usize,
) -> Result<Transition, CoreError> {
    let guard = tdef.guard.as_ref().map(Guard::compile).transpose()?;
    let actions = Action::compile_list(&tdef.actions.0)?;
    let mut targets = Vec::new();
    for target in tdef.targets() {
        targets.push(resolve_target(raw, ids, source, &target)?);
    }
    // Multiple targets are only coherent across orthogonal regions.
    for (i, &a) in targets.iter().enumerate() {
        for &b in &targets[i + 1..] {
            if !matches!(kinds[raw_lca(raw, a, b)], StateKind::Parallel) {
                return Err(CoreError::InvalidDefinition {
                    reason: format!(
                        "multi-target transition in '{}' must target distinct parallel regions",
                        raw[source].state_id
                    ),
                });
            }
        }
    }
    Ok(Transition {
        source,
        trigger,
        guard,
        targets,
        actions,
        internal: tdef.internal,
        index,
    })
}

fn raw_lca(raw: &[RawNode<'_>], a: NodeId, b: NodeId) -> NodeId {
    let mut seen = BTreeSet::new();
    let mut current = Some(a);
    while let Some(id) = current {
        seen.insert(id);
        current = raw[id].parent;
    }
    let mut current = Some(b);
    while let Some(id) = current {
        if seen.contains(&id) {
            return id;
        }
        current = raw[id].parent;
    }
    0
}

/// Resolves a target reference from a source state.
///
/// `#id` is a global id lookup; `.a.b` descends from the source;
/// `a.b` names a sibling (a child of the root for root transitions)
/// and descends, falling back to a global id lookup.
fn resolve_target(
    raw: &[RawNode<'_>],
    ids: &HashMap<String, NodeId>,
    source: NodeId,
    target: &str,
) -> Result<NodeId, CoreError> {
    let unresolvable = || CoreError::UnresolvableTarget {
        target: target.to_string(),
        state: raw[source].state_id.clone(),
    };

    if let Some(id) = target.strip_prefix('#') {
        return ids.get(id).copied().ok_or_else(unresolvable);
    }

    if let Some(rest) = target.strip_prefix('.') {
        let segments: Vec<&str> = rest.split('.').collect();
        return descend_keys(raw, source, &segments).ok_or_else(unresolvable);
    }

    let segments: Vec<&str> = target.split('.').collect();
    let scope = raw[source].parent.unwrap_or(source);
    if let Some(found) = descend_keys(raw, scope, &segments) {
        return Ok(found);
    }
    ids.get(target).copied().ok_or_else(unresolvable)
}

fn descend_keys(raw: &[RawNode<'_>], from: NodeId, segments: &[&str]) -> Option<NodeId> {
    let mut node = from;
    for segment in segments {
        node = raw[node]
            .children
            .iter()
            .copied()
            .find(|&c| raw[c].key == *segment)?;
    }
    Some(node)
}
