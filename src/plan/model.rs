//! Data models for the plan-sequencing engine.
//!
//! Two shapes of the same element exist:
//! - [`Element`]: a detached, owned value tree. Authoring code builds these and
//!   hands them to a plan; removals hand detached copies back.
//! - [`Node`]: the live form inside a plan's arena, addressed by [`NodeId`] and
//!   carrying parent/sibling links and computed timing.

use paste::paste;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Milliseconds from the plan epoch.
pub type Millis = i64;

// =============================================================================
// HANDLES
// =============================================================================

/// Stable handle of a node in a plan's arena.
///
/// The generation makes handles of removed nodes detectably stale even after
/// their slot has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl NodeId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// A sequence holder: the plan root or a container node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Holder {
    Root,
    Node(NodeId),
}

impl Holder {
    /// Returns the node handle, or None for the root.
    pub fn node(self) -> Option<NodeId> {
        match self {
            Holder::Root => None,
            Holder::Node(id) => Some(id),
        }
    }
}

impl From<NodeId> for Holder {
    fn from(id: NodeId) -> Self {
        Holder::Node(id)
    }
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Holder::Root => write!(f, "root"),
            Holder::Node(id) => write!(f, "{}", id),
        }
    }
}

// =============================================================================
// ELEMENT KIND
// =============================================================================

/// A command leaf: something the robot does at a point in the plan.
///
/// The engine only carries plain attribute values; translating `kind` and
/// `params` into executable configuration is left to external services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command type, e.g. "dock", "wait", "arm_pan".
    pub kind: String,

    /// Intrinsic duration in milliseconds.
    pub duration: Millis,

    /// Plain parameter values keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,

    /// Transient commands are bound to the live plan and are never copied out of it.
    #[serde(default)]
    pub transient: bool,
}

impl Command {
    /// Creates a command with the given type and duration.
    pub fn new(kind: impl Into<String>, duration: Millis) -> Self {
        Self {
            kind: kind.into(),
            duration,
            params: BTreeMap::new(),
            transient: false,
        }
    }

    /// Builder: Add a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Builder: Mark as transient.
    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }
}

/// Closed set of element variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ElementKind {
    /// Hold point. May nest commands.
    Station,
    /// Motion leg between two stations. May nest commands.
    Segment,
    /// Leaf with an intrinsic duration.
    Command(Command),
}

/// Generates `is_<variant>()` predicates over anything exposing `kind()`.
macro_rules! kind_predicates {
    ($($variant:ident => $name:ident),* $(,)?) => {
        paste! {
            $(
                #[doc = concat!("Returns true if this is a ", stringify!($name), ".")]
                pub fn [<is_ $name>](&self) -> bool {
                    matches!(self.kind(), ElementKind::$variant { .. })
                }
            )*
        }
    };
}

impl ElementKind {
    fn kind(&self) -> &ElementKind {
        self
    }

    kind_predicates!(Station => station, Segment => segment, Command => command);

    /// Whether elements of this kind can own a sequence of children.
    pub fn holds_children(&self) -> bool {
        !self.is_command()
    }

    /// Duration that does not derive from children.
    pub fn intrinsic_duration(&self) -> Option<Millis> {
        match self {
            ElementKind::Command(cmd) => Some(cmd.duration),
            _ => None,
        }
    }

    /// Returns the command payload, if any.
    pub fn command(&self) -> Option<&Command> {
        match self {
            ElementKind::Command(cmd) => Some(cmd),
            _ => None,
        }
    }

    /// Short human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            ElementKind::Station => "station",
            ElementKind::Segment => "segment",
            ElementKind::Command(_) => "command",
        }
    }

    /// Type name used as the naming prefix for children of this kind.
    pub fn type_name(&self) -> &'static str {
        match self {
            ElementKind::Station => "Station",
            ElementKind::Segment => "Segment",
            ElementKind::Command(_) => "Command",
        }
    }
}

// =============================================================================
// ELEMENT (detached value)
// =============================================================================

/// A detached sequenceable and its children.
///
/// `name` and `start_time` reflect where the element last lived; both are
/// re-derived when it is inserted into a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub notes: String,

    #[serde(default)]
    pub start_time: Millis,

    pub kind: ElementKind,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequence: Vec<Element>,
}

impl Element {
    /// Creates an element of the given kind with no children.
    pub fn new(kind: ElementKind) -> Self {
        Self {
            name: String::new(),
            notes: String::new(),
            start_time: 0,
            kind,
            sequence: Vec::new(),
        }
    }

    /// Creates an empty station.
    pub fn station() -> Self {
        Self::new(ElementKind::Station)
    }

    /// Creates an empty segment.
    pub fn segment() -> Self {
        Self::new(ElementKind::Segment)
    }

    /// Creates a command leaf.
    pub fn command(command: Command) -> Self {
        Self::new(ElementKind::Command(command))
    }

    /// Builder: Set name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder: Set notes.
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    /// Builder: Append a child.
    pub fn with_child(mut self, child: Element) -> Self {
        self.sequence.push(child);
        self
    }

    /// Builder: Append several children.
    pub fn with_children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.sequence.extend(children);
        self
    }

    pub fn kind(&self) -> &ElementKind {
        &self.kind
    }

    kind_predicates!(Station => station, Segment => segment, Command => command);

    /// Duration of this element: intrinsic for commands, sum of children otherwise.
    pub fn calculated_duration(&self) -> Millis {
        match self.kind.intrinsic_duration() {
            Some(duration) => duration,
            None => self.sequence.iter().map(Element::calculated_duration).sum(),
        }
    }

    /// Height of this tree; a lone element has height 1.
    pub fn height(&self) -> usize {
        1 + self.sequence.iter().map(Element::height).max().unwrap_or(0)
    }

    /// Number of elements in this tree, including itself.
    pub fn count(&self) -> usize {
        1 + self.sequence.iter().map(Element::count).sum::<usize>()
    }
}

// =============================================================================
// NODE (live arena entry)
// =============================================================================

/// A sequenceable living inside a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) notes: String,
    pub(crate) kind: ElementKind,
    pub(crate) start_time: Millis,
    /// Intrinsic for commands, cached aggregate for containers.
    pub(crate) duration: Millis,
    pub(crate) parent: Holder,
    pub(crate) previous: Option<NodeId>,
    pub(crate) next: Option<NodeId>,
    pub(crate) sequence: Vec<NodeId>,
    /// Top-level elements sit at depth 1.
    pub(crate) depth: usize,
}

impl Node {
    pub(crate) fn detached(element: &Element, parent: Holder, depth: usize) -> Self {
        Self {
            name: element.name.clone(),
            notes: element.notes.clone(),
            kind: element.kind.clone(),
            start_time: 0,
            duration: element.kind.intrinsic_duration().unwrap_or(0),
            parent,
            previous: None,
            next: None,
            sequence: Vec::new(),
            depth,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }

    pub fn kind(&self) -> &ElementKind {
        &self.kind
    }

    kind_predicates!(Station => station, Segment => segment, Command => command);

    /// Start time in milliseconds from the plan epoch.
    pub fn start_time(&self) -> Millis {
        self.start_time
    }

    /// Intrinsic duration for commands, sum of children for containers.
    pub fn calculated_duration(&self) -> Millis {
        self.duration
    }

    /// End time: start plus duration.
    pub fn end_time(&self) -> Millis {
        self.start_time + self.duration
    }

    /// The holder that owns this node.
    pub fn parent(&self) -> Holder {
        self.parent
    }

    pub fn previous(&self) -> Option<NodeId> {
        self.previous
    }

    pub fn next(&self) -> Option<NodeId> {
        self.next
    }

    /// Children in temporal order. Always empty for commands.
    pub fn sequence(&self) -> &[NodeId] {
        &self.sequence
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Returns the command payload, if this is a command.
    pub fn command(&self) -> Option<&Command> {
        self.kind.command()
    }
}

// =============================================================================
// TESTS
// =============================================================================
