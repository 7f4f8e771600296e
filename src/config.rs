//! Engine configuration.
//!
//! Usually built with `PlanConfig::default()`; hosts that keep settings in a
//! TOML file can parse them with [`PlanConfig::from_toml_str`].

use serde::{Deserialize, Serialize};

use crate::error::{PlanError, PlanResult};

/// Settings that shape naming, nesting limits and event buffering of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Prefix of auto-generated names for top-level elements. Nested
    /// elements are prefixed with their container's name and type.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Maximum nesting depth below the plan root. Top-level elements sit at depth 1.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Maximum number of undrained change records kept by the plan.
    #[serde(default = "default_event_backlog")]
    pub event_backlog: usize,
}

fn default_name_prefix() -> String {
    "Plan".to_string()
}

fn default_max_depth() -> usize {
    16
}

fn default_event_backlog() -> usize {
    1024
}

impl PlanConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: Set the name prefix for top-level elements.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Builder: Set the maximum nesting depth.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Builder: Set the event backlog.
    pub fn with_event_backlog(mut self, backlog: usize) -> Self {
        self.event_backlog = backlog;
        self
    }

    /// Parses a configuration from TOML. Missing keys fall back to defaults.
    pub fn from_toml_str(content: &str) -> PlanResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| PlanError::config(format!("Failed to parse config: {}", e)))?;
        if config.max_depth == 0 {
            return Err(PlanError::config("max_depth must be at least 1"));
        }
        Ok(config)
    }

    /// Serializes the configuration to TOML.
    pub fn to_toml_string(&self) -> PlanResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PlanError::config(format!("Failed to serialize config: {}", e)))
    }
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            max_depth: default_max_depth(),
            event_backlog: default_event_backlog(),
        }
    }
}
