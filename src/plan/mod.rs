//! Plan module.
//!
//! Provides the arena-backed plan tree: stations, segments and commands held
//! in ordered sequences with cascading timing and change records.

pub mod events;
pub mod holder;
pub mod manager;
pub mod model;
pub mod snapshot;

// Re-exports for convenience
pub use events::{ChangeRecord, PlanEvent, PlanObserver, Property};
pub use holder::{Inserted, Removal};
pub use manager::Plan;
pub use model::{Command, Element, ElementKind, Holder, Millis, Node, NodeId};
pub use snapshot::{PlanSnapshot, SnapshotEntry};
