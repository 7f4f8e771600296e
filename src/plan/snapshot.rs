//! Read-only snapshots for persistence and display layers.
//!
//! A snapshot walks the live tree and records, per element, the fields an
//! external writer needs (name, kind, start time, duration, children). The
//! engine does not pick a file format; callers serialize the snapshot however
//! they like.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::manager::Plan;
use super::model::{ElementKind, Holder, Millis, NodeId};
use crate::error::{PlanError, PlanResult};

/// Whole-plan snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub id: Uuid,
    pub start_time: Millis,
    pub calculated_duration: Millis,
    pub sequence: Vec<SnapshotEntry>,
}

/// One element of a snapshot, with its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    pub start_time: Millis,
    pub calculated_duration: Millis,
    pub kind: ElementKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequence: Vec<SnapshotEntry>,
}

impl SnapshotEntry {
    /// End time: start plus duration.
    pub fn end_time(&self) -> Millis {
        self.start_time + self.calculated_duration
    }
}

impl PlanSnapshot {
    /// Number of entries at any depth.
    pub fn len(&self) -> usize {
        fn count(entries: &[SnapshotEntry]) -> usize {
            entries.iter().map(|e| 1 + count(&e.sequence)).sum()
        }
        count(&self.sequence)
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Converts to a JSON value.
    pub fn to_json_value(&self) -> PlanResult<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| PlanError::serialization(e.to_string()))
    }
}

impl Plan {
    /// Captures the current tree. Transient commands are included.
    pub fn snapshot(&self) -> PlanResult<PlanSnapshot> {
        Ok(PlanSnapshot {
            id: self.id(),
            start_time: self.start_time(),
            calculated_duration: self.calculated_duration(),
            sequence: self.snapshot_holder(Holder::Root)?,
        })
    }

    /// Captures a single element and its children.
    pub fn snapshot_node(&self, id: NodeId) -> PlanResult<SnapshotEntry> {
        let node = self.node(id)?;
        let sequence = if node.kind().holds_children() {
            self.snapshot_holder(Holder::Node(id))?
        } else {
            Vec::new()
        };
        Ok(SnapshotEntry {
            name: node.name().to_string(),
            notes: node.notes().to_string(),
            start_time: node.start_time(),
            calculated_duration: node.calculated_duration(),
            kind: node.kind().clone(),
            sequence,
        })
    }

    fn snapshot_holder(&self, holder: Holder) -> PlanResult<Vec<SnapshotEntry>> {
        self.sequence(holder)?
            .iter()
            .map(|id| self.snapshot_node(*id))
            .collect()
    }
}
