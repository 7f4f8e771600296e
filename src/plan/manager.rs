//! The `Plan` root: node arena, event channel and per-element edits.
//!
//! Holder operations (insert, remove, timing cascade, ...) live in
//! [`holder`](super::holder); this module owns the storage they work on.

use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::events::{ChangeNotifier, ChangeRecord, PlanEvent, PlanObserver, Property};
use super::model::{Element, ElementKind, Holder, Millis, Node, NodeId};
use crate::config::PlanConfig;
use crate::error::{PlanError, PlanResult};

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Root sequence holder of a mission plan.
///
/// Owns every node of the tree in an arena. Parent, previous and next links
/// are plain [`NodeId`] lookups into that arena, so removing a subtree can
/// never leave a dangling reference behind: stale handles fail with
/// `NodeNotFound`.
pub struct Plan {
    id: Uuid,
    config: PlanConfig,
    pub(crate) start_time: Millis,
    pub(crate) sequence: Vec<NodeId>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    pub(crate) notifier: ChangeNotifier,
}

impl Plan {
    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Creates an empty plan with the default configuration.
    pub fn new() -> Self {
        Self::with_config(PlanConfig::default())
    }

    /// Creates an empty plan with the given configuration.
    pub fn with_config(config: PlanConfig) -> Self {
        let notifier = ChangeNotifier::new(config.event_backlog);
        Self {
            id: Uuid::new_v4(),
            config,
            start_time: 0,
            sequence: Vec::new(),
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            notifier,
        }
    }

    /// Builds a plan from detached elements, appended in order.
    ///
    /// The initial build does not emit change records.
    pub fn from_elements(
        config: PlanConfig,
        start_time: Millis,
        elements: Vec<Element>,
    ) -> PlanResult<Self> {
        let mut plan = Self::with_config(config);
        plan.start_time = start_time;
        for element in &elements {
            plan.validate_element(element, Holder::Root)?;
        }
        for element in &elements {
            let id = plan.build_subtree(element, Holder::Root, 1);
            plan.sequence.push(id);
        }
        plan.relink(Holder::Root)?;
        plan.update_times(Holder::Root, 0)?;
        plan.update_names(Holder::Root, 0)?;
        debug!(plan = %plan.id, nodes = plan.live, "built plan from elements");
        Ok(plan)
    }

    /// Deep copy of the whole plan.
    ///
    /// The tree is first copied out into detached values, then rebuilt, so the
    /// copy shares nothing with this plan. The copy gets a fresh id and an
    /// empty event channel. Fails with `CloneUnsupported` if the plan holds a
    /// transient command.
    pub fn try_clone(&self) -> PlanResult<Self> {
        let elements = self.to_elements()?;
        Self::from_elements(self.config.clone(), self.start_time, elements)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &PlanConfig {
        &self.config
    }

    /// Start time of the plan in milliseconds.
    pub fn start_time(&self) -> Millis {
        self.start_time
    }

    /// Sum of the durations of the top-level elements.
    ///
    /// The root sequence only ever holds live handles; `check_invariants`
    /// reports a stale one as `NodeNotFound`.
    pub fn calculated_duration(&self) -> Millis {
        self.sequence
            .iter()
            .map(|id| {
                debug_assert!(self.contains_node(*id), "stale handle {} in plan root", id);
                self.node(*id).map_or(0, Node::calculated_duration)
            })
            .sum()
    }

    /// End of the last element.
    pub fn end_time(&self) -> Millis {
        self.start_time + self.calculated_duration()
    }

    /// Number of live nodes at any depth.
    pub fn node_count(&self) -> usize {
        self.live
    }

    // =========================================================================
    // ARENA
    // =========================================================================

    /// Looks up a live node.
    pub fn node(&self, id: NodeId) -> PlanResult<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
            .ok_or(PlanError::NodeNotFound(id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> PlanResult<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .ok_or(PlanError::NodeNotFound(id))
    }

    /// True if the handle refers to a node currently in this plan.
    pub fn contains_node(&self, id: NodeId) -> bool {
        self.node(id).is_ok()
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId::new(index, slot.generation)
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId::new((self.slots.len() - 1) as u32, 0)
            }
        }
    }

    /// Frees a node and everything below it. Returns how many nodes were freed.
    pub(crate) fn free_subtree(&mut self, id: NodeId) -> usize {
        let mut stack = vec![id];
        let mut freed = 0;
        while let Some(current) = stack.pop() {
            let Some(slot) = self.slots.get_mut(current.index as usize) else {
                continue;
            };
            if slot.generation != current.generation {
                continue;
            }
            if let Some(node) = slot.node.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(current.index);
                self.live -= 1;
                freed += 1;
                stack.extend(node.sequence);
            }
        }
        freed
    }

    /// Checks that `element` may be placed into `holder` without breaking the
    /// element shape or the nesting limit.
    pub(crate) fn validate_element(&self, element: &Element, holder: Holder) -> PlanResult<()> {
        fn check_shape(element: &Element) -> PlanResult<()> {
            if !element.kind.holds_children() && !element.sequence.is_empty() {
                return Err(PlanError::invalid_element(format!(
                    "{} '{}' cannot hold children",
                    element.kind.label(),
                    element.name
                )));
            }
            if let Some(duration) = element.kind.intrinsic_duration() {
                check_duration(duration)?;
            }
            element.sequence.iter().try_for_each(check_shape)
        }

        check_shape(element)?;
        let depth = self.holder_depth(holder)? + element.height();
        if depth > self.config.max_depth {
            return Err(PlanError::depth_limit_exceeded(depth, self.config.max_depth));
        }
        Ok(())
    }

    /// Allocates nodes for an already validated element tree. Children are
    /// linked and aggregated; timing and names are left to the caller.
    pub(crate) fn build_subtree(&mut self, element: &Element, parent: Holder, depth: usize) -> NodeId {
        let id = self.alloc(Node::detached(element, parent, depth));
        if element.sequence.is_empty() {
            return id;
        }

        let children: Vec<NodeId> = element
            .sequence
            .iter()
            .map(|child| self.build_subtree(child, Holder::Node(id), depth + 1))
            .collect();
        let mut total = 0;
        for (i, child) in children.iter().enumerate() {
            let previous = if i > 0 { Some(children[i - 1]) } else { None };
            let next = children.get(i + 1).copied();
            if let Ok(node) = self.node_mut(*child) {
                node.previous = previous;
                node.next = next;
                total += node.duration;
            }
        }
        if let Ok(node) = self.node_mut(id) {
            node.sequence = children;
            node.duration = total;
        }
        id
    }

    /// Depth of a holder: 0 for the root.
    pub(crate) fn holder_depth(&self, holder: Holder) -> PlanResult<usize> {
        match holder {
            Holder::Root => Ok(0),
            Holder::Node(id) => Ok(self.node(id)?.depth),
        }
    }

    /// Path from `holder` up to and including the root.
    pub fn route_from(&self, holder: Holder) -> PlanResult<Vec<Holder>> {
        let mut route = vec![holder];
        let mut current = holder;
        while let Holder::Node(id) = current {
            if route.len() > self.config.max_depth + 1 {
                return Err(PlanError::invariant_violation(format!(
                    "ancestor chain of {} exceeds max depth {}",
                    holder, self.config.max_depth
                )));
            }
            current = self.node(id)?.parent;
            route.push(current);
        }
        Ok(route)
    }

    // =========================================================================
    // DETACHED COPIES
    // =========================================================================

    /// Copies a live subtree out into a detached element.
    pub fn detached_copy(&self, id: NodeId) -> PlanResult<Element> {
        self.copy_subtree(id, false)
    }

    /// Copies every top-level element out of the plan.
    pub fn to_elements(&self) -> PlanResult<Vec<Element>> {
        self.sequence
            .iter()
            .map(|id| self.detached_copy(*id))
            .collect()
    }

    fn copy_subtree(&self, id: NodeId, include_transient: bool) -> PlanResult<Element> {
        let node = self.node(id)?;
        if let ElementKind::Command(cmd) = &node.kind {
            if cmd.transient && !include_transient {
                return Err(PlanError::clone_unsupported(node.name.clone()));
            }
        }
        let sequence = node
            .sequence
            .iter()
            .map(|child| self.copy_subtree(*child, include_transient))
            .collect::<PlanResult<Vec<_>>>()?;
        Ok(Element {
            name: node.name.clone(),
            notes: node.notes.clone(),
            start_time: node.start_time,
            kind: node.kind.clone(),
            sequence,
        })
    }

    // =========================================================================
    // ELEMENT EDITS
    // =========================================================================

    /// Sets the duration of a command.
    ///
    /// Emits a `DurationChanged` record for the command, then one for every
    /// ancestor whose aggregate duration changed, ending at the root. Start
    /// times downstream of the command are recomputed at every level. Setting
    /// the current value is a no-op and emits nothing.
    pub fn set_command_duration(
        &mut self,
        id: NodeId,
        duration: Millis,
    ) -> PlanResult<Vec<ChangeRecord>> {
        let node = self.node(id)?;
        let old = match &node.kind {
            ElementKind::Command(cmd) => cmd.duration,
            _ => {
                return Err(PlanError::invalid_element(format!(
                    "{} '{}' has no intrinsic duration",
                    node.kind.label(),
                    node.name
                )))
            }
        };
        check_duration(duration)?;
        if old == duration {
            return Ok(Vec::new());
        }
        let parent = node.parent;
        let root_before = self.calculated_duration();

        let node = self.node_mut(id)?;
        if let ElementKind::Command(cmd) = &mut node.kind {
            cmd.duration = duration;
        }
        node.duration = duration;
        trace!(node = %id, old, new = duration, "command duration changed");

        let mut records = Vec::new();
        let route = self.route_from(Holder::Node(id))?;
        records.push(self.notifier.emit(
            PlanEvent::DurationChanged {
                source: Holder::Node(id),
                old,
                new: duration,
            },
            route,
        ));

        let index = self.index_of(parent, id)?;
        self.update_times(parent, index)?;
        for (holder, old, new) in self.propagate_up(parent)? {
            let route = self.route_from(holder)?;
            records.push(
                self.notifier
                    .emit(PlanEvent::DurationChanged { source: holder, old, new }, route),
            );
        }

        let root_after = self.calculated_duration();
        if root_before != root_after {
            records.push(self.notifier.emit(
                PlanEvent::DurationChanged {
                    source: Holder::Root,
                    old: root_before,
                    new: root_after,
                },
                vec![Holder::Root],
            ));
        }
        Ok(records)
    }

    /// Sets free-text notes on any element.
    pub fn set_notes(&mut self, id: NodeId, notes: impl Into<String>) -> PlanResult<ChangeRecord> {
        self.node_mut(id)?.notes = notes.into();
        self.emit_plan_changed(id, Property::Notes)
    }

    /// Changes the type of a command.
    pub fn set_command_kind(&mut self, id: NodeId, kind: impl Into<String>) -> PlanResult<ChangeRecord> {
        self.command_mut(id)?.kind = kind.into();
        self.emit_plan_changed(id, Property::CommandKind)
    }

    /// Sets a command parameter; `None` removes it.
    pub fn set_command_param(
        &mut self,
        id: NodeId,
        key: &str,
        value: Option<serde_json::Value>,
    ) -> PlanResult<ChangeRecord> {
        let cmd = self.command_mut(id)?;
        match value {
            Some(v) => {
                cmd.params.insert(key.to_string(), v);
            }
            None => {
                cmd.params.remove(key);
            }
        }
        self.emit_plan_changed(id, Property::Param)
    }

    fn command_mut(&mut self, id: NodeId) -> PlanResult<&mut super::model::Command> {
        let node = self.node_mut(id)?;
        let label = node.kind.label();
        match &mut node.kind {
            ElementKind::Command(cmd) => Ok(cmd),
            _ => Err(PlanError::invalid_element(format!(
                "{} '{}' is not a command",
                label, node.name
            ))),
        }
    }

    fn emit_plan_changed(&mut self, id: NodeId, property: Property) -> PlanResult<ChangeRecord> {
        let route = self.route_from(Holder::Node(id))?;
        Ok(self
            .notifier
            .emit(PlanEvent::PlanChanged { source: id, property }, route))
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Registers an observer called after every mutation.
    pub fn subscribe(&mut self, observer: impl PlanObserver + 'static) {
        self.notifier.subscribe(Box::new(observer));
    }

    /// Takes all queued change records, oldest first.
    pub fn drain_events(&mut self) -> Vec<ChangeRecord> {
        self.notifier.drain()
    }

    /// Queued change records, oldest first.
    pub fn pending_events(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.notifier.pending()
    }

    /// Records discarded because the backlog was full.
    pub fn dropped_events(&self) -> u64 {
        self.notifier.dropped()
    }

    pub(crate) fn warn_copy_refused(&self, id: NodeId, err: &PlanError) {
        warn!(plan = %self.id, node = %id, error = %err, "removed element could not be copied");
    }
}

/// Durations are non-negative so that start times never run backwards.
fn check_duration(duration: Millis) -> PlanResult<()> {
    if duration < 0 {
        return Err(PlanError::invalid_element(format!(
            "negative duration {}",
            duration
        )));
    }
    Ok(())
}

impl Default for Plan {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("id", &self.id)
            .field("start_time", &self.start_time)
            .field("sequence", &self.sequence)
            .field("nodes", &self.live)
            .field("notifier", &self.notifier)
            .finish()
    }
}

/// Value equality: same start time and same element trees. Plan ids, handles
/// and pending events are not compared.
impl PartialEq for Plan {
    fn eq(&self, other: &Self) -> bool {
        if self.start_time != other.start_time || self.sequence.len() != other.sequence.len() {
            return false;
        }
        self.sequence.iter().zip(other.sequence.iter()).all(|(a, b)| {
            match (self.copy_subtree(*a, true), other.copy_subtree(*b, true)) {
                (Ok(x), Ok(y)) => x == y,
                _ => false,
            }
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
