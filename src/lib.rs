//! planseq - Hierarchical plan-sequencing engine for robot mission plans.
//!
//! A plan is a tree of ordered sequences. Stations (hold points) and segments
//! (motion legs) alternate at the top level and may nest commands; commands
//! are leaves with an intrinsic duration. The engine keeps the tree
//! consistent under every edit:
//!
//! - **Timing**: each element starts when its predecessor ends; container
//!   durations are the sum of their children and cascade upward
//! - **Structure**: removing a station also removes one connecting segment
//! - **Change records**: every edit yields a record that bubbles from the
//!   edited holder to the plan root
//!
//! # Example
//!
//! ```rust
//! use planseq::{Command, Element, Holder, Plan};
//!
//! let mut plan = Plan::new();
//! let dock = plan
//!     .append(Holder::Root, Element::station().with_notes("dock"))
//!     .unwrap()
//!     .id;
//! plan.append(
//!     Holder::Root,
//!     Element::segment().with_child(Element::command(Command::new("move", 12_000))),
//! )
//! .unwrap();
//! plan.append(Holder::Root, Element::station()).unwrap();
//!
//! // nested commands push later elements back
//! plan.append(Holder::Node(dock), Element::command(Command::new("undock", 3_000)))
//!     .unwrap();
//! assert_eq!(plan.calculated_duration(), 15_000);
//!
//! // removing a station also drops the segment leading to it
//! let removal = plan.remove_at(Holder::Root, 2).unwrap();
//! assert!(removal.copy.unwrap().is_station());
//! assert_eq!(plan.len(Holder::Root).unwrap(), 1);
//! ```

pub mod config;
pub mod error;

// Plan module
pub mod plan;

// Re-exports for convenience
pub use config::PlanConfig;
pub use error::{PlanError, PlanResult};
pub use plan::{
    ChangeRecord, Command, Element, ElementKind, Holder, Inserted, Millis, Node, NodeId, Plan,
    PlanEvent, PlanObserver, PlanSnapshot, Property, Removal, SnapshotEntry,
};
