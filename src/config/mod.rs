//! Configuration management for the nodeflow engine
//!
//! Engine limits and the workflow directory. `Config::default()` reads
//! `NODEFLOW_*` environment variables; `Config::load` layers a TOML file on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::expression::{DEFAULT_MEMORY_LIMIT, DEFAULT_TIME_LIMIT};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheduler and sandbox limits
    pub engine: EngineConfig,
    /// Workflow storage configuration
    pub storage: StorageConfig,
}

/// Scheduler and sandbox limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sibling nodes invoked concurrently per readiness cycle (1 = sequential)
    pub max_parallel_nodes: usize,
    /// Timeout for nodes without their own `timeout_ms`
    pub default_node_timeout_ms: Option<u64>,
    /// Maximum nesting of sub-workflow and error-workflow runs
    pub max_workflow_depth: usize,
    /// Maximum invocations of a looping node per loop
    pub max_loop_iterations: usize,
    /// Lua sandbox memory cap in bytes
    pub expression_memory_limit: usize,
    /// Wall-clock cap for a single `{{ }}` expression
    pub expression_timeout_ms: u64,
}

/// Directory-backed workflow storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `<workflow id>.json` definitions (default: "workflows")
    pub workflows_dir: PathBuf,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

impl Default for EngineConfig {
    /// Defaults with ENV_VAR overrides for container deployment
    fn default() -> Self {
        Self {
            max_parallel_nodes: env_parse("NODEFLOW_MAX_PARALLEL_NODES").unwrap_or(1),
            default_node_timeout_ms: env_parse("NODEFLOW_NODE_TIMEOUT_MS"),
            max_workflow_depth: env_parse("NODEFLOW_MAX_WORKFLOW_DEPTH").unwrap_or(16),
            max_loop_iterations: env_parse("NODEFLOW_MAX_LOOP_ITERATIONS").unwrap_or(10_000),
            expression_memory_limit: env_parse("NODEFLOW_EXPRESSION_MEMORY_LIMIT").unwrap_or(DEFAULT_MEMORY_LIMIT),
            expression_timeout_ms: env_parse("NODEFLOW_EXPRESSION_TIMEOUT_MS")
                .unwrap_or(DEFAULT_TIME_LIMIT.as_millis() as u64),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workflows_dir: std::env::var("NODEFLOW_WORKFLOWS_DIR")
                .unwrap_or_else(|_| "workflows".to_string())
                .into(),
        }
    }
}

impl EngineConfig {
    pub fn default_node_timeout(&self) -> Option<Duration> {
        self.default_node_timeout_ms.map(Duration::from_millis)
    }

    pub fn expression_timeout(&self) -> Duration {
        Duration::from_millis(self.expression_timeout_ms)
    }
}

impl Config {
    /// Read a TOML file; missing keys fall back to the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}
