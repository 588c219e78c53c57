//! Agent configuration, loadable from TOML.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cycle::Phase;
use crate::decide::exploration::ExplorationConfig;
use crate::error::ConfigError;

/// Tunables for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Elaboration waves allowed in one propose or apply phase (default: 100).
    pub max_elaborations: u64,
    /// Stop once this many decision cycles have run in total (default: none).
    pub max_decisions: Option<u64>,
    /// Deepest goal stack allowed, counting the top state (default: 100).
    pub max_goal_depth: u32,
    /// Learned rules allowed before the run stops (default: 50).
    pub max_chunks: u64,
    /// Build chunks from sub-goal results; otherwise justifications (default: false).
    pub learning: bool,
    /// Phase before which decision-unit runs stop (default: input).
    pub stop_phase: Phase,
    /// Do not create state no-change sub-goals (default: false).
    pub wait_on_state_no_change: bool,
    /// Stop the run when a right-hand-side function fails (default: false).
    pub halt_on_rhs_error: bool,
    /// Seed for the agent's random number generator (default: 42).
    pub seed: u64,
    /// Name prefix of learned rules (default: "chunk").
    pub chunk_name_prefix: String,
    /// Selection among mutually indifferent operators.
    pub exploration: ExplorationConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_elaborations: 100,
            max_decisions: None,
            max_goal_depth: 100,
            max_chunks: 50,
            learning: false,
            stop_phase: Phase::Input,
            wait_on_state_no_change: false,
            halt_on_rhs_error: false,
            seed: 42,
            chunk_name_prefix: "chunk".to_string(),
            exploration: ExplorationConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io { source: e })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }
}
