//! Sequence holder operations.
//!
//! Every operation addresses a holder: the plan root or a Station/Segment node.
//! Mutations follow the same steps: validate (a failed validation leaves the
//! plan untouched), restructure, relink siblings, re-derive timing and names
//! downstream of the change, push the new aggregate durations up through the
//! ancestors, and finally emit one `SequenceChanged` record whose route runs
//! from the mutated holder to the root.

use tracing::{debug, trace};

use super::events::{ChangeRecord, PlanEvent};
use super::manager::Plan;
use super::model::{Element, Holder, Millis, NodeId};
use crate::error::{PlanError, PlanResult};

/// Result of an insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct Inserted {
    /// Handle of the new element.
    pub id: NodeId,
    pub record: ChangeRecord,
}

/// Result of a removal.
#[derive(Debug, Clone, PartialEq)]
pub struct Removal {
    /// Detached copy of the removed element, or why one could not be made.
    /// The removal itself has happened either way.
    pub copy: PlanResult<Element>,
    pub record: ChangeRecord,
}

impl Plan {
    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Children of a holder in temporal order.
    pub fn sequence(&self, holder: Holder) -> PlanResult<&[NodeId]> {
        match holder {
            Holder::Root => Ok(&self.sequence),
            Holder::Node(id) => {
                let node = self.node(id)?;
                if !node.kind.holds_children() {
                    return Err(PlanError::NotAContainer(id));
                }
                Ok(&node.sequence)
            }
        }
    }

    fn sequence_mut(&mut self, holder: Holder) -> PlanResult<&mut Vec<NodeId>> {
        match holder {
            Holder::Root => Ok(&mut self.sequence),
            Holder::Node(id) => {
                let node = self.node_mut(id)?;
                if !node.kind.holds_children() {
                    return Err(PlanError::NotAContainer(id));
                }
                Ok(&mut node.sequence)
            }
        }
    }

    /// Element at `index`.
    pub fn get(&self, holder: Holder, index: usize) -> PlanResult<NodeId> {
        let sequence = self.sequence(holder)?;
        sequence
            .get(index)
            .copied()
            .ok_or_else(|| PlanError::index_out_of_range(index, sequence.len()))
    }

    /// First element, if any.
    pub fn first(&self, holder: Holder) -> PlanResult<Option<NodeId>> {
        Ok(self.sequence(holder)?.first().copied())
    }

    pub fn len(&self, holder: Holder) -> PlanResult<usize> {
        Ok(self.sequence(holder)?.len())
    }

    pub fn is_empty(&self, holder: Holder) -> PlanResult<bool> {
        Ok(self.sequence(holder)?.is_empty())
    }

    /// Position of `id` among the holder's direct children.
    pub fn index_of(&self, holder: Holder, id: NodeId) -> PlanResult<usize> {
        self.sequence(holder)?
            .iter()
            .position(|child| *child == id)
            .ok_or(PlanError::ReferenceNotFound(id))
    }

    /// True if `id` is a direct child of the holder.
    pub fn contains(&self, holder: Holder, id: NodeId) -> PlanResult<bool> {
        Ok(self.sequence(holder)?.contains(&id))
    }

    /// Start time of a holder.
    pub fn holder_start(&self, holder: Holder) -> PlanResult<Millis> {
        match holder {
            Holder::Root => Ok(self.start_time),
            Holder::Node(id) => Ok(self.node(id)?.start_time),
        }
    }

    /// Calculated duration of a holder.
    pub fn holder_duration(&self, holder: Holder) -> PlanResult<Millis> {
        match holder {
            Holder::Root => Ok(self.calculated_duration()),
            Holder::Node(id) => Ok(self.node(id)?.duration),
        }
    }

    // =========================================================================
    // INSERTION
    // =========================================================================

    /// Inserts `element` at `index` (`0 <= index <= len`).
    pub fn insert_at(&mut self, holder: Holder, index: usize, element: Element) -> PlanResult<Inserted> {
        let length = self.len(holder)?;
        if index > length {
            return Err(PlanError::index_out_of_range(index, length));
        }
        self.validate_element(&element, holder)?;

        let old = self.sequence(holder)?.to_vec();
        let depth = self.holder_depth(holder)? + 1;
        let id = self.build_subtree(&element, holder, depth);
        self.sequence_mut(holder)?.insert(index, id);
        self.relink_range(holder, index.saturating_sub(1), index + 1)?;
        self.update_times(holder, index)?;
        self.update_names(holder, index)?;
        self.propagate_up(holder)?;

        debug!(holder = %holder, index, node = %id, kind = element.kind.label(), "inserted element");
        let record = self.emit_sequence_changed(holder, old)?;
        Ok(Inserted { id, record })
    }

    /// Appends `element` to the end of the holder.
    pub fn append(&mut self, holder: Holder, element: Element) -> PlanResult<Inserted> {
        let length = self.len(holder)?;
        self.insert_at(holder, length, element)
    }

    /// Inserts `element` directly before `reference`.
    pub fn insert_before(
        &mut self,
        holder: Holder,
        reference: NodeId,
        element: Element,
    ) -> PlanResult<Inserted> {
        let index = self.index_of(holder, reference)?;
        self.insert_at(holder, index, element)
    }

    /// Appends several elements one by one; each append emits its own record.
    ///
    /// All elements are validated up front, so either every element is
    /// appended or none is.
    pub fn extend(&mut self, holder: Holder, elements: Vec<Element>) -> PlanResult<Vec<Inserted>> {
        for element in &elements {
            self.validate_element(element, holder)?;
        }
        elements
            .into_iter()
            .map(|element| self.append(holder, element))
            .collect()
    }

    /// Replaces the element at `index` (`0 <= index < len`). The replaced
    /// subtree is dropped from the plan.
    pub fn set_at(&mut self, holder: Holder, index: usize, element: Element) -> PlanResult<Inserted> {
        let length = self.len(holder)?;
        if index >= length {
            return Err(PlanError::index_out_of_range(index, length));
        }
        self.validate_element(&element, holder)?;

        let old = self.sequence(holder)?.to_vec();
        let depth = self.holder_depth(holder)? + 1;
        let id = self.build_subtree(&element, holder, depth);
        let replaced = std::mem::replace(&mut self.sequence_mut(holder)?[index], id);
        self.free_subtree(replaced);
        self.relink_range(holder, index.saturating_sub(1), index + 1)?;
        self.update_times(holder, index)?;
        self.update_names(holder, index)?;
        self.propagate_up(holder)?;

        debug!(holder = %holder, index, node = %id, replaced = %replaced, "replaced element");
        let record = self.emit_sequence_changed(holder, old)?;
        Ok(Inserted { id, record })
    }

    /// Replaces the whole sequence of a holder. Emits a single record.
    pub fn set_sequence(&mut self, holder: Holder, elements: Vec<Element>) -> PlanResult<ChangeRecord> {
        self.sequence(holder)?;
        for element in &elements {
            self.validate_element(element, holder)?;
        }

        let old = std::mem::take(self.sequence_mut(holder)?);
        for id in &old {
            self.free_subtree(*id);
        }
        let depth = self.holder_depth(holder)? + 1;
        let ids: Vec<NodeId> = elements
            .iter()
            .map(|element| self.build_subtree(element, holder, depth))
            .collect();
        *self.sequence_mut(holder)? = ids;
        self.relink(holder)?;
        self.update_times(holder, 0)?;
        self.update_names(holder, 0)?;
        self.propagate_up(holder)?;

        debug!(holder = %holder, len = elements.len(), "replaced sequence");
        self.emit_sequence_changed(holder, old)
    }

    /// Moves an element from one position to another within the same holder.
    ///
    /// `to` is interpreted against the sequence before the move, as with an
    /// insertion point: moving `0` to `len` puts the first element last.
    /// A move that leaves the order unchanged emits nothing and returns `None`.
    pub fn move_within(
        &mut self,
        holder: Holder,
        from: usize,
        to: usize,
    ) -> PlanResult<Option<ChangeRecord>> {
        let length = self.len(holder)?;
        if from >= length {
            return Err(PlanError::index_out_of_range(from, length));
        }
        if to > length {
            return Err(PlanError::index_out_of_range(to, length));
        }

        let target = if from < to { to - 1 } else { to };
        if target == from {
            return Ok(None);
        }

        let old = self.sequence(holder)?.to_vec();
        let sequence = self.sequence_mut(holder)?;
        let id = sequence.remove(from);
        sequence.insert(target, id);
        let lo = from.min(target);
        let hi = from.max(target);
        self.relink_range(holder, lo.saturating_sub(1), hi + 1)?;
        self.update_times(holder, lo)?;
        self.update_names(holder, lo)?;
        self.propagate_up(holder)?;

        debug!(holder = %holder, from, to = target, "moved element");
        self.emit_sequence_changed(holder, old).map(Some)
    }

    // =========================================================================
    // REMOVAL
    // =========================================================================

    /// Removes the element at `index` (`0 <= index < len`).
    ///
    /// Removing a Station also removes one connecting Segment so that stations
    /// and segments keep alternating. The Segment before the station is
    /// dropped when there is one; otherwise the Segment after it. The Segment
    /// that survives is relinked to the station that preceded the removed one.
    ///
    /// The returned copy is taken before anything is detached. When the
    /// element cannot be copied the removal still happens and the copy slot
    /// carries `CloneUnsupported`.
    pub fn remove_at(&mut self, holder: Holder, index: usize) -> PlanResult<Removal> {
        let length = self.len(holder)?;
        if index >= length {
            return Err(PlanError::index_out_of_range(index, length));
        }

        let old = self.sequence(holder)?.to_vec();
        let target = old[index];
        let copy = self.detached_copy(target);
        if let Err(err) = &copy {
            self.warn_copy_refused(target, err);
        }

        // empty a composite target first so nothing below it survives detachment
        let children = std::mem::take(&mut self.node_mut(target)?.sequence);
        for child in children {
            self.free_subtree(child);
        }

        let mut changed = index;
        if self.node(target)?.is_station() {
            let previous = self.connecting_segment_before(holder, index)?;
            let next = self.connecting_segment_after(holder, index)?;
            match (previous, next) {
                (Some(segment), _) => {
                    changed = self.index_of(holder, segment)?;
                    self.detach(holder, segment)?;
                    trace!(holder = %holder, segment = %segment, "dropped previous segment");
                }
                (None, Some(segment)) => {
                    self.detach(holder, segment)?;
                    trace!(holder = %holder, segment = %segment, "dropped next segment");
                }
                (None, None) => {}
            }
        }

        self.detach(holder, target)?;
        self.update_times(holder, changed)?;
        self.update_names(holder, changed)?;
        self.propagate_up(holder)?;

        debug!(holder = %holder, index, node = %target, "removed element");
        let record = self.emit_sequence_changed(holder, old)?;
        Ok(Removal { copy, record })
    }

    /// Removes `reference` from the holder.
    pub fn remove(&mut self, holder: Holder, reference: NodeId) -> PlanResult<Removal> {
        let index = self.index_of(holder, reference)?;
        self.remove_at(holder, index)
    }

    /// Removes every element of the holder at once. Emits a single record.
    pub fn clear(&mut self, holder: Holder) -> PlanResult<ChangeRecord> {
        let old = std::mem::take(self.sequence_mut(holder)?);
        let mut freed = 0;
        for id in &old {
            freed += self.free_subtree(*id);
        }
        self.propagate_up(holder)?;

        debug!(holder = %holder, freed, "cleared sequence");
        self.emit_sequence_changed(holder, old)
    }

    /// Unlinks `id` from the holder, stitches its neighbours together and
    /// frees its subtree.
    fn detach(&mut self, holder: Holder, id: NodeId) -> PlanResult<()> {
        let index = self.index_of(holder, id)?;
        self.sequence_mut(holder)?.remove(index);
        let node = self.node(id)?;
        let (previous, next) = (node.previous, node.next);
        if let Some(previous) = previous {
            self.node_mut(previous)?.next = next;
        }
        if let Some(next) = next {
            self.node_mut(next)?.previous = previous;
        }
        self.free_subtree(id);
        Ok(())
    }

    /// The Segment linking the element at `index` to the Station before it.
    /// Commands in between are skipped; reaching a Station first means none.
    fn connecting_segment_before(&self, holder: Holder, index: usize) -> PlanResult<Option<NodeId>> {
        let sequence = self.sequence(holder)?;
        for id in sequence[..index].iter().rev() {
            let node = self.node(*id)?;
            if node.is_segment() {
                return Ok(Some(*id));
            }
            if node.is_station() {
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// The Segment linking the element at `index` to the Station after it.
    fn connecting_segment_after(&self, holder: Holder, index: usize) -> PlanResult<Option<NodeId>> {
        let sequence = self.sequence(holder)?;
        for id in sequence.iter().skip(index + 1) {
            let node = self.node(*id)?;
            if node.is_segment() {
                return Ok(Some(*id));
            }
            if node.is_station() {
                return Ok(None);
            }
        }
        Ok(None)
    }

    // =========================================================================
    // TRAVERSAL
    // =========================================================================

    /// Every element below the holder in pre-order: each container is
    /// followed by its own flattened children.
    pub fn flatten(&self, holder: Holder) -> PlanResult<Vec<NodeId>> {
        let mut out = Vec::new();
        self.collect(holder, true, &mut out)?;
        Ok(out)
    }

    /// Like [`flatten`](Self::flatten) but only leaves (commands); Station and
    /// Segment wrappers are skipped.
    pub fn leaves_only(&self, holder: Holder) -> PlanResult<Vec<NodeId>> {
        let mut out = Vec::new();
        self.collect(holder, false, &mut out)?;
        Ok(out)
    }

    fn collect(&self, holder: Holder, containers: bool, out: &mut Vec<NodeId>) -> PlanResult<()> {
        for id in self.sequence(holder)? {
            let node = self.node(*id)?;
            if node.kind.holds_children() {
                if containers {
                    out.push(*id);
                }
                self.collect(Holder::Node(*id), containers, out)?;
            } else {
                out.push(*id);
            }
        }
        Ok(())
    }

    /// Nearest Station strictly before `index`.
    pub fn previous_station(&self, holder: Holder, index: usize) -> PlanResult<Option<NodeId>> {
        self.scan_back(holder, index, |plan, id| plan.node(id).map(|n| n.is_station()))
    }

    /// Nearest Station at or after `index`.
    pub fn next_station(&self, holder: Holder, index: usize) -> PlanResult<Option<NodeId>> {
        self.scan_forward(holder, index, |plan, id| plan.node(id).map(|n| n.is_station()))
    }

    /// Nearest Segment strictly before `index`.
    pub fn previous_segment(&self, holder: Holder, index: usize) -> PlanResult<Option<NodeId>> {
        self.scan_back(holder, index, |plan, id| plan.node(id).map(|n| n.is_segment()))
    }

    /// Nearest Segment at or after `index`.
    pub fn next_segment(&self, holder: Holder, index: usize) -> PlanResult<Option<NodeId>> {
        self.scan_forward(holder, index, |plan, id| plan.node(id).map(|n| n.is_segment()))
    }

    /// Stations a Segment connects: the nearest Station before it and after it
    /// in its holder.
    pub fn segment_stations(&self, segment: NodeId) -> PlanResult<(Option<NodeId>, Option<NodeId>)> {
        let node = self.node(segment)?;
        if !node.is_segment() {
            return Err(PlanError::invalid_element(format!(
                "{} '{}' is not a segment",
                node.kind.label(),
                node.name
            )));
        }
        let holder = node.parent;
        let index = self.index_of(holder, segment)?;
        Ok((
            self.previous_station(holder, index)?,
            self.next_station(holder, index + 1)?,
        ))
    }

    fn scan_back<F>(&self, holder: Holder, index: usize, matches: F) -> PlanResult<Option<NodeId>>
    where
        F: Fn(&Plan, NodeId) -> PlanResult<bool>,
    {
        let sequence = self.sequence(holder)?;
        let end = index.min(sequence.len());
        for id in sequence[..end].iter().rev() {
            if matches(self, *id)? {
                return Ok(Some(*id));
            }
        }
        Ok(None)
    }

    fn scan_forward<F>(&self, holder: Holder, index: usize, matches: F) -> PlanResult<Option<NodeId>>
    where
        F: Fn(&Plan, NodeId) -> PlanResult<bool>,
    {
        for id in self.sequence(holder)?.iter().skip(index) {
            if matches(self, *id)? {
                return Ok(Some(*id));
            }
        }
        Ok(None)
    }

    // =========================================================================
    // TIMING AND NAMES
    // =========================================================================

    /// Sets the plan start time and cascades it through every element.
    pub fn set_start_time(&mut self, start_time: Millis) -> PlanResult<()> {
        self.start_time = start_time;
        self.update_times(Holder::Root, 0)
    }

    /// Re-derives start times from `from` to the end of the holder. Element 0
    /// starts with the holder; every other element starts when its
    /// predecessor ends. Non-empty containers are re-timed from their start.
    pub fn update_times(&mut self, holder: Holder, from: usize) -> PlanResult<()> {
        let start = self.holder_start(holder)?;
        let length = self.len(holder)?;
        for i in from..length {
            let begin = if i == 0 {
                start
            } else {
                self.node(self.get(holder, i - 1)?)?.end_time()
            };
            let id = self.get(holder, i)?;
            let node = self.node_mut(id)?;
            node.start_time = begin;
            if !node.sequence.is_empty() {
                self.update_times(Holder::Node(id), 0)?;
            }
        }
        Ok(())
    }

    /// Re-derives names from `from` to the end of the holder, recursing into
    /// containers so nested names follow their parent's.
    ///
    /// A name is the holder's prefix plus the position. Top-level elements use
    /// `PlanConfig::name_prefix` (`Plan0`, `Plan1`, ...); children of a
    /// container use its name and type (`Plan0.Station0`).
    pub fn update_names(&mut self, holder: Holder, from: usize) -> PlanResult<()> {
        let prefix = match holder {
            Holder::Root => self.config().name_prefix.clone(),
            Holder::Node(id) => {
                let node = self.node(id)?;
                format!("{}.{}", node.name, node.kind.type_name())
            }
        };
        let length = self.len(holder)?;
        for i in from..length {
            let id = self.get(holder, i)?;
            let node = self.node_mut(id)?;
            node.name = format!("{}{}", prefix, i);
            if !node.sequence.is_empty() {
                self.update_names(Holder::Node(id), 0)?;
            }
        }
        Ok(())
    }

    /// Re-derives the names of every child of the holder.
    pub fn auto_name_children(&mut self, holder: Holder) -> PlanResult<()> {
        self.update_names(holder, 0)
    }

    /// Recomputes aggregate durations from `holder` up to the root, re-timing
    /// each ancestor downstream of the child that changed.
    ///
    /// Returns `(holder, old, new)` for every holder whose aggregate changed,
    /// innermost first. The root is never included.
    pub(crate) fn propagate_up(&mut self, holder: Holder) -> PlanResult<Vec<(Holder, Millis, Millis)>> {
        let mut changes = Vec::new();
        let mut current = holder;
        let mut hops = 0;
        while let Holder::Node(id) = current {
            hops += 1;
            if hops > self.config().max_depth {
                return Err(PlanError::invariant_violation(format!(
                    "duration cascade from {} exceeds max depth {}",
                    holder,
                    self.config().max_depth
                )));
            }

            let total: Millis = self
                .node(id)?
                .sequence
                .iter()
                .map(|child| self.node(*child).map(|n| n.duration))
                .sum::<PlanResult<Millis>>()?;
            let node = self.node_mut(id)?;
            let old = node.duration;
            node.duration = total;
            let parent = node.parent;
            if old != total {
                trace!(holder = %current, old, new = total, "aggregate duration changed");
                changes.push((current, old, total));
            }

            let index = self.index_of(parent, id)?;
            self.update_times(parent, index)?;
            current = parent;
        }
        Ok(changes)
    }

    /// Rewires previous/next of every child of the holder.
    pub(crate) fn relink(&mut self, holder: Holder) -> PlanResult<()> {
        let length = self.len(holder)?;
        if length == 0 {
            return Ok(());
        }
        self.relink_range(holder, 0, length - 1)
    }

    /// Rewires previous/next of children `lo..=hi` (clamped to the sequence).
    fn relink_range(&mut self, holder: Holder, lo: usize, hi: usize) -> PlanResult<()> {
        let sequence = self.sequence(holder)?.to_vec();
        if sequence.is_empty() {
            return Ok(());
        }
        let hi = hi.min(sequence.len() - 1);
        for i in lo..=hi {
            let node = self.node_mut(sequence[i])?;
            node.previous = if i > 0 { Some(sequence[i - 1]) } else { None };
            node.next = sequence.get(i + 1).copied();
        }
        Ok(())
    }

    fn emit_sequence_changed(&mut self, holder: Holder, old: Vec<NodeId>) -> PlanResult<ChangeRecord> {
        let new = self.sequence(holder)?.to_vec();
        let route = self.route_from(holder)?;
        Ok(self
            .notifier
            .emit(PlanEvent::SequenceChanged { holder, old, new }, route))
    }

    // =========================================================================
    // CONSISTENCY
    // =========================================================================

    /// Verifies ownership, sibling links, start-time cascade and aggregate
    /// durations across the whole tree.
    ///
    /// Violations indicate a bug in the caller or the engine, never a
    /// recoverable runtime condition.
    pub fn check_invariants(&self) -> PlanResult<()> {
        let reachable = self.check_holder(Holder::Root, 0)?;
        if reachable != self.node_count() {
            return Err(PlanError::invariant_violation(format!(
                "{} live nodes but {} reachable from the root",
                self.node_count(),
                reachable
            )));
        }
        Ok(())
    }

    fn check_holder(&self, holder: Holder, depth: usize) -> PlanResult<usize> {
        let sequence = self.sequence(holder)?;
        let start = self.holder_start(holder)?;
        let mut reachable = 0;
        let mut total: Millis = 0;

        for (i, id) in sequence.iter().enumerate() {
            let node = self.node(*id)?;
            let fail = |what: String| -> PlanResult<usize> {
                Err(PlanError::invariant_violation(format!("{} in {}: {}", id, holder, what)))
            };

            if node.parent != holder {
                return fail(format!("parent is {}", node.parent));
            }
            if node.depth != depth + 1 {
                return fail(format!("depth {} under holder at depth {}", node.depth, depth));
            }
            let previous = if i > 0 { Some(sequence[i - 1]) } else { None };
            if node.previous != previous || node.next != sequence.get(i + 1).copied() {
                return fail("sibling links out of date".to_string());
            }
            let expected_start = match previous {
                Some(p) => self.node(p)?.end_time(),
                None => start,
            };
            if node.start_time != expected_start {
                return fail(format!("starts at {} instead of {}", node.start_time, expected_start));
            }

            if node.kind.holds_children() {
                reachable += self.check_holder(Holder::Node(*id), depth + 1)?;
            } else if !node.sequence.is_empty() {
                return fail("command holds children".to_string());
            }
            total += node.duration;
            reachable += 1;
        }

        let duration = self.holder_duration(holder)?;
        if duration != total {
            return Err(PlanError::invariant_violation(format!(
                "{} has duration {} but its children sum to {}",
                holder, duration, total
            )));
        }
        Ok(reachable)
    }

    /// Verifies that Stations and Segments alternate in the holder. Commands
    /// between them are ignored.
    pub fn check_alternation(&self, holder: Holder) -> PlanResult<()> {
        let mut last: Option<NodeId> = None;
        for id in self.sequence(holder)? {
            let node = self.node(*id)?;
            if !(node.is_station() || node.is_segment()) {
                continue;
            }
            if let Some(previous) = last {
                if self.node(previous)?.kind.label() == node.kind.label() {
                    return Err(PlanError::invariant_violation(format!(
                        "adjacent {}s {} and {} in {}",
                        node.kind.label(),
                        previous,
                        id,
                        holder
                    )));
                }
            }
            last = Some(*id);
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlanConfig;
    use crate::plan::model::Command;
    use proptest::prelude::*;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn wait(ms: Millis) -> Element {
        Element::command(Command::new("wait", ms))
    }

    fn station(ms: Millis) -> Element {
        Element::station().with_child(wait(ms))
    }

    fn segment(ms: Millis) -> Element {
        Element::segment().with_child(wait(ms))
    }

    /// A, S1, B, S2, C with 10/20/30/40/50 ms of waiting.
    fn motion_plan() -> (Plan, Vec<NodeId>) {
        let mut plan = Plan::new();
        let ids = plan
            .extend(
                Holder::Root,
                vec![station(10), segment(20), station(30), segment(40), station(50)],
            )
            .unwrap()
            .into_iter()
            .map(|inserted| inserted.id)
            .collect();
        plan.drain_events();
        (plan, ids)
    }

    #[test]
    fn test_append_and_timing() {
        let (plan, ids) = motion_plan();
        let starts: Vec<Millis> = ids.iter().map(|id| plan.node(*id).unwrap().start_time()).collect();
        assert_eq!(starts, vec![0, 10, 30, 60, 100]);
        assert_eq!(plan.calculated_duration(), 150);
        plan.check_invariants().unwrap();
    }

    #[test]
    fn test_insert_at_end_appends() {
        let (mut plan, ids) = motion_plan();
        let inserted = plan.insert_at(Holder::Root, 5, segment(5)).unwrap();
        assert_eq!(plan.get(Holder::Root, 5).unwrap(), inserted.id);
        assert_eq!(plan.node(inserted.id).unwrap().start_time(), 150);
        assert_eq!(plan.node(inserted.id).unwrap().previous(), Some(ids[4]));
        assert_eq!(plan.node(ids[4]).unwrap().next(), Some(inserted.id));
        plan.check_invariants().unwrap();
    }

    #[test]
    fn test_insert_out_of_range_is_noop() {
        let (mut plan, _) = motion_plan();
        let before = plan.sequence(Holder::Root).unwrap().to_vec();
        let err = plan.insert_at(Holder::Root, 6, station(1)).unwrap_err();
        assert_eq!(err, PlanError::index_out_of_range(6, 5));
        assert_eq!(plan.sequence(Holder::Root).unwrap(), before.as_slice());
        assert_eq!(plan.node_count(), 10);
        assert_eq!(plan.pending_events().count(), 0);
    }

    #[test]
    fn test_insert_in_middle_shifts_times_and_names() {
        let (mut plan, ids) = motion_plan();
        let inserted = plan.insert_at(Holder::Root, 1, wait(7)).unwrap();

        assert_eq!(plan.node(inserted.id).unwrap().start_time(), 10);
        assert_eq!(plan.node(inserted.id).unwrap().name(), "Plan1");
        assert_eq!(plan.node(ids[1]).unwrap().start_time(), 17);
        assert_eq!(plan.node(ids[1]).unwrap().name(), "Plan2");
        let nested = plan.node(ids[1]).unwrap().sequence()[0];
        assert_eq!(plan.node(nested).unwrap().name(), "Plan2.Segment0");
        assert_eq!(plan.node(nested).unwrap().start_time(), 17);

        match &inserted.record.event {
            PlanEvent::SequenceChanged { holder, old, new } => {
                assert_eq!(*holder, Holder::Root);
                assert_eq!(old, &ids);
                assert_eq!(new.len(), 6);
            }
            other => panic!("unexpected event {:?}", other),
        }
        plan.check_invariants().unwrap();
    }

    #[test]
    fn test_insert_before() {
        let (mut plan, ids) = motion_plan();
        let inserted = plan.insert_before(Holder::Root, ids[2], wait(1)).unwrap();
        assert_eq!(plan.index_of(Holder::Root, inserted.id).unwrap(), 2);

        let stranger = plan.node(ids[0]).unwrap().sequence()[0];
        let err = plan.insert_before(Holder::Root, stranger, wait(1)).unwrap_err();
        assert_eq!(err, PlanError::ReferenceNotFound(stranger));
    }

    #[test]
    fn test_insert_into_command_fails() {
        let (mut plan, ids) = motion_plan();
        let cmd = plan.node(ids[0]).unwrap().sequence()[0];
        let err = plan.append(Holder::Node(cmd), wait(1)).unwrap_err();
        assert_eq!(err, PlanError::NotAContainer(cmd));
    }

    #[test]
    fn test_nested_insert_bubbles_to_root() {
        let (mut plan, ids) = motion_plan();
        let inserted = plan.append(Holder::Node(ids[1]), wait(100)).unwrap();

        assert_eq!(inserted.record.route, vec![Holder::Node(ids[1]), Holder::Root]);
        assert!(inserted.record.reached_root());
        assert_eq!(plan.node(ids[1]).unwrap().calculated_duration(), 120);
        assert_eq!(plan.node(ids[2]).unwrap().start_time(), 130);
        assert_eq!(plan.calculated_duration(), 250);
        assert_eq!(plan.node(inserted.id).unwrap().name(), "Plan1.Segment1");
        plan.check_invariants().unwrap();
    }

    #[test]
    fn test_set_at_replaces() {
        let (mut plan, ids) = motion_plan();
        let replacement = plan.set_at(Holder::Root, 1, segment(500)).unwrap();
        assert!(!plan.contains_node(ids[1]));
        assert_eq!(plan.node(replacement.id).unwrap().previous(), Some(ids[0]));
        assert_eq!(plan.node(ids[2]).unwrap().previous(), Some(replacement.id));
        assert_eq!(plan.node(ids[2]).unwrap().start_time(), 510);
        assert_eq!(plan.node_count(), 10);

        let err = plan.set_at(Holder::Root, 5, segment(1)).unwrap_err();
        assert_eq!(err, PlanError::index_out_of_range(5, 5));
        plan.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_middle_station_drops_previous_segment() {
        init_tracing();
        let (mut plan, ids) = motion_plan();
        let removal = plan.remove_at(Holder::Root, 2).unwrap();

        let remaining = plan.sequence(Holder::Root).unwrap().to_vec();
        assert_eq!(remaining, vec![ids[0], ids[3], ids[4]]);
        assert!(!plan.contains_node(ids[1]));
        assert!(!plan.contains_node(ids[2]));

        // the surviving segment now connects A and C
        assert_eq!(plan.segment_stations(ids[3]).unwrap(), (Some(ids[0]), Some(ids[4])));
        assert_eq!(plan.node(ids[3]).unwrap().previous(), Some(ids[0]));
        assert_eq!(plan.node(ids[0]).unwrap().next(), Some(ids[3]));

        assert_eq!(plan.node(ids[3]).unwrap().start_time(), 10);
        assert_eq!(plan.node(ids[3]).unwrap().name(), "Plan1");
        assert_eq!(plan.node(ids[4]).unwrap().start_time(), 50);
        assert_eq!(plan.calculated_duration(), 100);

        let copy = removal.copy.unwrap();
        assert!(copy.is_station());
        assert_eq!(copy.calculated_duration(), 30);
        assert_eq!(copy.name, "Plan2");
        plan.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_first_station_drops_next_segment() {
        let (mut plan, ids) = motion_plan();
        plan.remove_at(Holder::Root, 0).unwrap();
        assert_eq!(plan.sequence(Holder::Root).unwrap(), &[ids[2], ids[3], ids[4]]);
        assert_eq!(plan.node(ids[2]).unwrap().start_time(), 0);
        assert_eq!(plan.node(ids[2]).unwrap().previous(), None);
        assert_eq!(plan.node(ids[2]).unwrap().name(), "Plan0");
        plan.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_last_station_drops_previous_segment() {
        let (mut plan, ids) = motion_plan();
        plan.remove_at(Holder::Root, 4).unwrap();
        assert_eq!(plan.sequence(Holder::Root).unwrap(), &[ids[0], ids[1], ids[2]]);
        assert_eq!(plan.node(ids[2]).unwrap().next(), None);
        plan.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_lone_station() {
        let mut plan = Plan::new();
        let id = plan.append(Holder::Root, station(5)).unwrap().id;
        let removal = plan.remove(Holder::Root, id).unwrap();
        assert!(plan.is_empty(Holder::Root).unwrap());
        assert_eq!(plan.node_count(), 0);
        assert_eq!(removal.copy.unwrap().sequence.len(), 1);
    }

    #[test]
    fn test_remove_out_of_range_is_noop() {
        let (mut plan, _) = motion_plan();
        let err = plan.remove_at(Holder::Root, 5).unwrap_err();
        assert_eq!(err, PlanError::index_out_of_range(5, 5));
        assert_eq!(plan.node_count(), 10);
        assert_eq!(plan.pending_events().count(), 0);
    }

    #[test]
    fn test_remove_frees_grandchildren() {
        let (mut plan, ids) = motion_plan();
        let cmd = plan.node(ids[2]).unwrap().sequence()[0];
        plan.remove_at(Holder::Root, 2).unwrap();
        assert!(!plan.contains_node(cmd));
        assert_eq!(plan.node_count(), 6);
    }

    #[test]
    fn test_remove_transient_reports_clone_unsupported() {
        init_tracing();
        let (mut plan, ids) = motion_plan();
        plan.append(
            Holder::Node(ids[0]),
            Element::command(Command::new("teleop", 5).with_transient(true)),
        )
        .unwrap();
        let removal = plan.remove_at(Holder::Root, 0).unwrap();
        assert!(matches!(removal.copy, Err(PlanError::CloneUnsupported(_))));
        assert!(!plan.contains_node(ids[0]));
        plan.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_command_inside_station() {
        let (mut plan, ids) = motion_plan();
        let removal = plan.remove_at(Holder::Node(ids[2]), 0).unwrap();
        assert_eq!(removal.record.route, vec![Holder::Node(ids[2]), Holder::Root]);
        assert_eq!(plan.node(ids[2]).unwrap().calculated_duration(), 0);
        assert_eq!(plan.node(ids[3]).unwrap().start_time(), 30);
        assert_eq!(plan.calculated_duration(), 120);
        plan.check_invariants().unwrap();
    }

    #[test]
    fn test_clear() {
        let (mut plan, ids) = motion_plan();
        plan.clear(Holder::Node(ids[0])).unwrap();
        assert_eq!(plan.node(ids[1]).unwrap().start_time(), 0);
        plan.check_invariants().unwrap();

        let record = plan.clear(Holder::Root).unwrap();
        assert_eq!(plan.node_count(), 0);
        assert_eq!(plan.calculated_duration(), 0);
        match record.event {
            PlanEvent::SequenceChanged { old, new, .. } => {
                assert_eq!(old, ids);
                assert!(new.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_set_sequence() {
        let (mut plan, ids) = motion_plan();
        let record = plan
            .set_sequence(Holder::Node(ids[1]), vec![wait(1), wait(2), wait(3)])
            .unwrap();
        assert!(record.is_structural());
        assert_eq!(plan.len(Holder::Node(ids[1])).unwrap(), 3);
        assert_eq!(plan.node(ids[1]).unwrap().calculated_duration(), 6);
        assert_eq!(plan.node(ids[2]).unwrap().start_time(), 16);
        assert_eq!(plan.drain_events().len(), 1);
        plan.check_invariants().unwrap();
    }

    #[test]
    fn test_move_within() {
        let mut plan = Plan::new();
        let ids: Vec<NodeId> = plan
            .extend(Holder::Root, vec![wait(1), wait(2), wait(4)])
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();

        plan.drain_events();

        let record = plan.move_within(Holder::Root, 0, 3).unwrap().unwrap();
        assert!(record.is_structural());
        assert_eq!(plan.sequence(Holder::Root).unwrap(), &[ids[1], ids[2], ids[0]]);
        assert_eq!(plan.node(ids[0]).unwrap().start_time(), 6);
        assert_eq!(plan.node(ids[0]).unwrap().name(), "Plan2");

        assert!(plan.move_within(Holder::Root, 2, 0).unwrap().is_some());
        assert_eq!(plan.sequence(Holder::Root).unwrap(), &[ids[0], ids[1], ids[2]]);
        assert!(plan.move_within(Holder::Root, 3, 0).is_err());
        assert_eq!(plan.drain_events().len(), 2);
        plan.check_invariants().unwrap();
    }

    #[test]
    fn test_move_in_place_emits_nothing() {
        let (mut plan, ids) = motion_plan();
        assert_eq!(plan.move_within(Holder::Root, 1, 1).unwrap(), None);
        assert_eq!(plan.move_within(Holder::Root, 1, 2).unwrap(), None);
        assert_eq!(plan.sequence(Holder::Root).unwrap(), ids.as_slice());
        assert_eq!(plan.pending_events().count(), 0);
    }

    #[test]
    fn test_flatten_and_leaves() {
        let (plan, ids) = motion_plan();
        let flat = plan.flatten(Holder::Root).unwrap();
        assert_eq!(flat.len(), plan.node_count());
        assert_eq!(flat[0], ids[0]);
        assert_eq!(flat[1], plan.node(ids[0]).unwrap().sequence()[0]);
        assert_eq!(flat[2], ids[1]);

        let leaves = plan.leaves_only(Holder::Root).unwrap();
        assert_eq!(leaves.len(), 5);
        assert!(leaves.iter().all(|id| plan.node(*id).unwrap().is_command()));
        let starts: Vec<Millis> = leaves.iter().map(|id| plan.node(*id).unwrap().start_time()).collect();
        assert!(starts.windows(2).all(|w| w[0] <= w[1]));
    }

    /// Station > Segment > Station > wait(10), then Segment > wait(5).
    fn deep_plan() -> Plan {
        Plan::from_elements(
            PlanConfig::default(),
            0,
            vec![
                Element::station().with_child(
                    Element::segment().with_child(Element::station().with_child(wait(10))),
                ),
                segment(5),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_nested_names_carry_container_type() {
        let plan = deep_plan();
        let names: Vec<String> = plan
            .flatten(Holder::Root)
            .unwrap()
            .iter()
            .map(|id| plan.node(*id).unwrap().name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "Plan0",
                "Plan0.Station0",
                "Plan0.Station0.Segment0",
                "Plan0.Station0.Segment0.Station0",
                "Plan1",
                "Plan1.Segment0",
            ]
        );
    }

    #[test]
    fn test_flatten_deep_tree_in_pre_order() {
        let plan = deep_plan();
        let outer = plan.get(Holder::Root, 0).unwrap();
        let middle = plan.get(Holder::Node(outer), 0).unwrap();
        let inner = plan.get(Holder::Node(middle), 0).unwrap();
        let leaf = plan.get(Holder::Node(inner), 0).unwrap();
        let trailing = plan.get(Holder::Root, 1).unwrap();
        let trailing_leaf = plan.get(Holder::Node(trailing), 0).unwrap();

        assert_eq!(
            plan.flatten(Holder::Root).unwrap(),
            vec![outer, middle, inner, leaf, trailing, trailing_leaf]
        );
        assert_eq!(plan.leaves_only(Holder::Root).unwrap(), vec![leaf, trailing_leaf]);
        assert_eq!(plan.flatten(Holder::Node(middle)).unwrap(), vec![inner, leaf]);
        assert_eq!(plan.node(leaf).unwrap().depth(), 4);
        assert_eq!(plan.node(trailing_leaf).unwrap().start_time(), 10);
        plan.check_invariants().unwrap();
    }

    #[test]
    fn test_neighbour_queries() {
        let (plan, ids) = motion_plan();
        assert_eq!(plan.previous_station(Holder::Root, 3).unwrap(), Some(ids[2]));
        assert_eq!(plan.next_station(Holder::Root, 3).unwrap(), Some(ids[4]));
        assert_eq!(plan.previous_segment(Holder::Root, 1).unwrap(), None);
        assert_eq!(plan.next_segment(Holder::Root, 2).unwrap(), Some(ids[3]));
        assert_eq!(plan.segment_stations(ids[1]).unwrap(), (Some(ids[0]), Some(ids[2])));
        assert!(plan.segment_stations(ids[0]).is_err());
        assert_eq!(plan.first(Holder::Root).unwrap(), Some(ids[0]));
        assert!(plan.contains(Holder::Root, ids[4]).unwrap());
    }

    #[test]
    fn test_set_start_time_cascades() {
        let (mut plan, ids) = motion_plan();
        plan.set_start_time(1_000).unwrap();
        assert_eq!(plan.node(ids[0]).unwrap().start_time(), 1_000);
        let nested = plan.node(ids[3]).unwrap().sequence()[0];
        assert_eq!(plan.node(nested).unwrap().start_time(), 1_060);
        assert_eq!(plan.end_time(), 1_150);
        plan.check_invariants().unwrap();
    }

    #[test]
    fn test_name_prefix() {
        let mut plan = Plan::with_config(PlanConfig::default().with_name_prefix("P"));
        let id = plan.append(Holder::Root, station(1)).unwrap().id;
        let cmd = plan.node(id).unwrap().sequence()[0];
        assert_eq!(plan.node(id).unwrap().name(), "P0");
        assert_eq!(plan.node(cmd).unwrap().name(), "P0.Station0");
    }

    #[test]
    fn test_depth_limit_on_insert() {
        let mut plan = Plan::with_config(PlanConfig::default().with_max_depth(2));
        let id = plan.append(Holder::Root, Element::station()).unwrap().id;
        let err = plan.append(Holder::Node(id), segment(1)).unwrap_err();
        assert_eq!(err, PlanError::depth_limit_exceeded(3, 2));
        assert_eq!(plan.node_count(), 1);
    }

    #[test]
    fn test_extend_is_all_or_nothing() {
        let mut plan = Plan::new();
        let bad = Element::command(Command::new("dock", 1)).with_child(wait(1));
        assert!(plan.extend(Holder::Root, vec![station(1), bad]).is_err());
        assert_eq!(plan.node_count(), 0);
    }

    #[test]
    fn test_check_alternation_detects_adjacent_segments() {
        let mut plan = Plan::new();
        plan.extend(Holder::Root, vec![station(1), segment(1), wait(1), segment(1)]).unwrap();
        plan.check_invariants().unwrap();
        let err = plan.check_alternation(Holder::Root).unwrap_err();
        assert!(matches!(err, PlanError::InvariantViolation(_)));

        let (plan, _) = motion_plan();
        plan.check_alternation(Holder::Root).unwrap();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert { index: usize, nested: bool, ms: Millis },
        Remove { index: usize },
        Duration { index: usize, ms: Millis },
        Nest { pick: prop::sample::Index, segment: bool, ms: Millis },
        Unnest { pick: prop::sample::Index },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..8, any::<bool>(), 0i64..1_000)
                .prop_map(|(index, nested, ms)| Op::Insert { index, nested, ms }),
            (0usize..8).prop_map(|index| Op::Remove { index }),
            (0usize..16, 0i64..1_000).prop_map(|(index, ms)| Op::Duration { index, ms }),
            (any::<prop::sample::Index>(), any::<bool>(), 0i64..1_000)
                .prop_map(|(pick, segment, ms)| Op::Nest { pick, segment, ms }),
            any::<prop::sample::Index>().prop_map(|pick| Op::Unnest { pick }),
        ]
    }

    fn containers(plan: &Plan) -> Vec<NodeId> {
        plan.flatten(Holder::Root)
            .unwrap()
            .into_iter()
            .filter(|id| plan.node(*id).unwrap().kind().holds_children())
            .collect()
    }

    proptest! {
        #[test]
        fn prop_invariants_hold_after_any_edit(ops in proptest::collection::vec(op(), 1..40)) {
            let mut plan = Plan::with_config(PlanConfig::default().with_max_depth(64));
            for op in ops {
                match op {
                    Op::Insert { index, nested, ms } => {
                        let element = if nested { station(ms) } else { wait(ms) };
                        let length = plan.len(Holder::Root).unwrap();
                        let result = plan.insert_at(Holder::Root, index, element);
                        prop_assert_eq!(result.is_ok(), index <= length);
                    }
                    Op::Remove { index } => {
                        let length = plan.len(Holder::Root).unwrap();
                        let result = plan.remove_at(Holder::Root, index);
                        prop_assert_eq!(result.is_ok(), index < length);
                    }
                    Op::Duration { index, ms } => {
                        let leaves = plan.leaves_only(Holder::Root).unwrap();
                        if let Some(id) = leaves.get(index) {
                            plan.set_command_duration(*id, ms).unwrap();
                        }
                    }
                    Op::Nest { pick, segment: as_segment, ms } => {
                        let holders = containers(&plan);
                        if !holders.is_empty() {
                            let parent = holders[pick.index(holders.len())];
                            let element = if as_segment { segment(ms) } else { station(ms) };
                            let inserted = plan.append(Holder::Node(parent), element).unwrap();
                            prop_assert!(inserted.record.reached_root());
                            prop_assert_eq!(
                                plan.node(inserted.id).unwrap().depth(),
                                plan.node(parent).unwrap().depth() + 1
                            );
                        }
                    }
                    Op::Unnest { pick } => {
                        let holders: Vec<NodeId> = containers(&plan)
                            .into_iter()
                            .filter(|id| !plan.node(*id).unwrap().sequence().is_empty())
                            .collect();
                        if !holders.is_empty() {
                            let parent = holders[pick.index(holders.len())];
                            plan.remove_at(Holder::Node(parent), 0).unwrap();
                        }
                    }
                }
                prop_assert!(plan.check_invariants().is_ok());
                let leaf_total: Millis = plan
                    .leaves_only(Holder::Root)
                    .unwrap()
                    .iter()
                    .map(|id| plan.node(*id).unwrap().calculated_duration())
                    .sum();
                prop_assert_eq!(plan.calculated_duration(), leaf_total);
                prop_assert_eq!(plan.flatten(Holder::Root).unwrap().len(), plan.node_count());
            }
        }

        #[test]
        fn prop_station_removal_keeps_alternation(
            stations in 2usize..8,
            picks in proptest::collection::vec(any::<prop::sample::Index>(), 1..6),
        ) {
            let mut elements = vec![station(1)];
            for i in 1..stations {
                elements.push(segment(i as Millis));
                elements.push(station(i as Millis));
            }
            let mut plan = Plan::from_elements(PlanConfig::default(), 0, elements).unwrap();

            for pick in picks {
                let stations: Vec<NodeId> = plan
                    .sequence(Holder::Root)
                    .unwrap()
                    .iter()
                    .copied()
                    .filter(|id| plan.node(*id).unwrap().is_station())
                    .collect();
                if stations.is_empty() {
                    break;
                }
                let before = plan.len(Holder::Root).unwrap();
                let target = stations[pick.index(stations.len())];
                plan.remove(Holder::Root, target).unwrap();

                // one station plus exactly one segment, unless it was the only station
                let expected = if before == 1 { 0 } else { before - 2 };
                prop_assert_eq!(plan.len(Holder::Root).unwrap(), expected);
                prop_assert!(plan.check_alternation(Holder::Root).is_ok());
                prop_assert!(plan.check_invariants().is_ok());
            }
        }
    }
}
