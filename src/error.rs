//! Error types for the plan-sequencing engine.

use thiserror::Error;

use crate::plan::NodeId;

/// Result type alias for plan operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// Errors that can occur while editing a plan.
///
/// Every failure is local: the plan is left exactly as it was before the
/// failing call, except for `CloneUnsupported`, which is reported alongside a
/// removal that still went through.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    /// Index out of bounds for an insert, replace or remove.
    #[error("Index {index} out of range for sequence of length {length}")]
    IndexOutOfRange { index: usize, length: usize },

    /// The reference element of an insert-before is not in the holder.
    #[error("Reference element not found: {0}")]
    ReferenceNotFound(NodeId),

    /// The element cannot produce a detached copy.
    #[error("Element '{0}' cannot be copied out of the plan")]
    CloneUnsupported(String),

    /// Handle does not refer to a live node (removed, or from another plan).
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Children were requested from an element that cannot hold any.
    #[error("Node {0} is not a sequence holder")]
    NotAContainer(NodeId),

    /// The insertion would nest elements deeper than the configured limit.
    #[error("Nesting depth {depth} exceeds the configured maximum of {max}")]
    DepthLimitExceeded { depth: usize, max: usize },

    /// The element value is malformed (e.g. a command carrying children).
    #[error("Invalid element: {0}")]
    InvalidElement(String),

    /// A structural invariant does not hold. Indicates a caller bug.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PlanError {
    /// Creates an IndexOutOfRange error.
    pub fn index_out_of_range(index: usize, length: usize) -> Self {
        Self::IndexOutOfRange { index, length }
    }

    /// Creates a CloneUnsupported error.
    pub fn clone_unsupported(name: impl Into<String>) -> Self {
        Self::CloneUnsupported(name.into())
    }

    /// Creates a DepthLimitExceeded error.
    pub fn depth_limit_exceeded(depth: usize, max: usize) -> Self {
        Self::DepthLimitExceeded { depth, max }
    }

    /// Creates an InvalidElement error.
    pub fn invalid_element(msg: impl Into<String>) -> Self {
        Self::InvalidElement(msg.into())
    }

    /// Creates an InvariantViolation error.
    pub fn invariant_violation(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Creates a Config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a Serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}
