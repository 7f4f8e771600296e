//! Change records and their delivery.
//!
//! Every mutation produces a [`ChangeRecord`]. The record is returned to the
//! caller, queued on the plan's channel until drained, and handed to each
//! registered [`PlanObserver`] once the mutation has fully completed. Observers
//! only ever see `&ChangeRecord`, so they cannot re-enter the plan mid-update.

use std::collections::VecDeque;
use std::fmt;

use tracing::warn;

use super::model::{Holder, Millis, NodeId};

/// Non-structural properties whose edits bubble as a generic plan change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    Notes,
    CommandKind,
    Param,
}

impl Property {
    pub fn as_str(&self) -> &'static str {
        match self {
            Property::Notes => "notes",
            Property::CommandKind => "kind",
            Property::Param => "params",
        }
    }
}

/// What changed.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanEvent {
    /// A holder's sequence was restructured. Snapshots are taken before and after.
    SequenceChanged {
        holder: Holder,
        old: Vec<NodeId>,
        new: Vec<NodeId>,
    },

    /// The duration of `source` changed: intrinsic for a command, aggregate for a holder.
    DurationChanged {
        source: Holder,
        old: Millis,
        new: Millis,
    },

    /// Any other edit below the root.
    PlanChanged { source: NodeId, property: Property },
}

/// A change event plus the path it bubbled along.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// Monotonic per plan, starting at 1.
    pub sequence: u64,

    pub event: PlanEvent,

    /// Holders that saw the event, from its origin up to and including the root.
    pub route: Vec<Holder>,
}

impl ChangeRecord {
    /// Where the event originated.
    pub fn origin(&self) -> Holder {
        self.route.first().copied().unwrap_or(Holder::Root)
    }

    /// True if the event bubbled all the way to the plan root.
    pub fn reached_root(&self) -> bool {
        self.route.last() == Some(&Holder::Root)
    }

    /// True for structural (sequence) changes.
    pub fn is_structural(&self) -> bool {
        matches!(self.event, PlanEvent::SequenceChanged { .. })
    }
}

/// Receives change records after each mutation.
pub trait PlanObserver {
    fn on_change(&mut self, record: &ChangeRecord);
}

impl<F> PlanObserver for F
where
    F: FnMut(&ChangeRecord),
{
    fn on_change(&mut self, record: &ChangeRecord) {
        self(record)
    }
}

/// The plan's event channel: a bounded queue plus synchronous observers.
pub(crate) struct ChangeNotifier {
    next_sequence: u64,
    pending: VecDeque<ChangeRecord>,
    backlog: usize,
    dropped: u64,
    observers: Vec<Box<dyn PlanObserver>>,
}

impl ChangeNotifier {
    pub(crate) fn new(backlog: usize) -> Self {
        Self {
            next_sequence: 1,
            pending: VecDeque::new(),
            backlog,
            dropped: 0,
            observers: Vec::new(),
        }
    }

    pub(crate) fn subscribe(&mut self, observer: Box<dyn PlanObserver>) {
        self.observers.push(observer);
    }

    /// Stamps, queues and delivers an event. Returns the stamped record.
    pub(crate) fn emit(&mut self, event: PlanEvent, route: Vec<Holder>) -> ChangeRecord {
        let record = ChangeRecord {
            sequence: self.next_sequence,
            event,
            route,
        };
        self.next_sequence += 1;

        if self.backlog == 0 {
            self.dropped += 1;
        } else {
            if self.pending.len() >= self.backlog {
                self.pending.pop_front();
                self.dropped += 1;
                warn!(
                    backlog = self.backlog,
                    dropped = self.dropped,
                    "change backlog full, dropping oldest record"
                );
            }
            self.pending.push_back(record.clone());
        }

        for observer in self.observers.iter_mut() {
            observer.on_change(&record);
        }
        record
    }

    pub(crate) fn drain(&mut self) -> Vec<ChangeRecord> {
        self.pending.drain(..).collect()
    }

    pub(crate) fn pending(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.pending.iter()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("next_sequence", &self.next_sequence)
            .field("pending", &self.pending.len())
            .field("dropped", &self.dropped)
            .field("observers", &self.observers.len())
            .finish()
    }
}
