use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// How the planner turns a task into a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlannerMode {
    /// Fixed templates keyed by task kind.
    Scripted,
    /// Ordered rules over the payload and prior artifacts.
    #[default]
    Heuristic,
    /// Delegated to an injected model planner, then validated.
    Model,
}

impl std::fmt::Display for PlannerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlannerMode::Scripted => write!(f, "scripted"),
            PlannerMode::Heuristic => write!(f, "heuristic"),
            PlannerMode::Model => write!(f, "model"),
        }
    }
}

/// Exponential backoff between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub max_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            backoff_coefficient: 2.0,
            max_interval_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately. Handy in tests.
    pub fn immediate() -> Self {
        Self {
            initial_interval_ms: 0,
            backoff_coefficient: 1.0,
            max_interval_ms: 0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        if self.initial_interval_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let raw = self.initial_interval_ms as f64 * self.backoff_coefficient.powi(exponent);
        let capped = raw.min(self.max_interval_ms.max(self.initial_interval_ms) as f64);
        Duration::from_millis(capped as u64)
    }
}

fn default_queues() -> BTreeMap<String, usize> {
    BTreeMap::from([
        ("io".to_string(), 8),
        ("compute".to_string(), 2),
        ("model".to_string(), 4),
    ])
}

/// Configuration of one agent run.
///
/// Applied through the `configure` event and read-only afterwards until the
/// next `configure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent_name: String,
    pub workspace_id: Option<String>,
    /// Max steps dispatched per planning round; `None` dispatches the whole ready set.
    pub planning_interval: Option<usize>,
    pub planner_mode: PlannerMode,
    pub memory_budget_chars: usize,
    pub memory_budget_tokens: Option<usize>,
    pub keep_last: usize,
    /// Compaction triggers at `memory_budget_chars * safety_margin`.
    pub safety_margin: f64,
    /// Empty means every registered tool may run.
    pub allowed_tools: BTreeSet<String>,
    pub queues: BTreeMap<String, usize>,
    pub tool_queues: BTreeMap<String, String>,
    pub default_concurrency: usize,
    pub tool_timeouts: BTreeMap<String, u64>,
    pub default_timeout_secs: u64,
    pub default_retry_attempts: u32,
    pub retry: RetryPolicy,
    /// Consecutive failures before a tool fails fast. 0 disables the breaker.
    pub circuit_breaker_threshold: u32,
    /// Save a snapshot every N resolved steps; `None` saves after every task.
    pub snapshot_interval: Option<u64>,
    pub restart_threshold: u64,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_name: "orca".to_string(),
            workspace_id: None,
            planning_interval: None,
            planner_mode: PlannerMode::default(),
            memory_budget_chars: 16_000,
            memory_budget_tokens: None,
            keep_last: 5,
            safety_margin: 0.9,
            allowed_tools: BTreeSet::new(),
            queues: default_queues(),
            tool_queues: BTreeMap::new(),
            default_concurrency: 4,
            tool_timeouts: BTreeMap::new(),
            default_timeout_secs: 60,
            default_retry_attempts: 2,
            retry: RetryPolicy::default(),
            circuit_breaker_threshold: 5,
            snapshot_interval: None,
            restart_threshold: 2_000,
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn orca_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".orca"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::orca_dir()?.join("config.toml"))
    }

    pub fn default_snapshot_dir() -> Result<PathBuf> {
        Ok(Self::orca_dir()?.join("snapshots"))
    }

    /// Check the invariants a configuration must satisfy before it is applied.
    pub fn validate(&self) -> Result<()> {
        if self.agent_name.trim().is_empty() {
            return Err(Error::Validation("agent_name must not be empty".into()));
        }
        if self.memory_budget_chars == 0 {
            return Err(Error::Validation("memory_budget_chars must be > 0".into()));
        }
        if self.memory_budget_tokens == Some(0) {
            return Err(Error::Validation("memory_budget_tokens must be > 0".into()));
        }
        if !(self.safety_margin > 0.0 && self.safety_margin <= 1.0) {
            return Err(Error::Validation(format!(
                "safety_margin must be in (0, 1], got {}",
                self.safety_margin
            )));
        }
        if self.planning_interval == Some(0) {
            return Err(Error::Validation("planning_interval must be > 0".into()));
        }
        if self.default_concurrency == 0 {
            return Err(Error::Validation("default_concurrency must be > 0".into()));
        }
        if let Some((name, _)) = self.queues.iter().find(|(_, limit)| **limit == 0) {
            return Err(Error::Validation(format!(
                "queue '{}' must allow at least one concurrent step",
                name
            )));
        }
        if self.retry.backoff_coefficient < 1.0 {
            return Err(Error::Validation(
                "retry.backoff_coefficient must be >= 1.0".into(),
            ));
        }
        if self.default_timeout_secs == 0 {
            return Err(Error::Validation("default_timeout_secs must be > 0".into()));
        }
        if self.restart_threshold == 0 {
            return Err(Error::Validation("restart_threshold must be > 0".into()));
        }
        if self.snapshot_interval == Some(0) {
            return Err(Error::Validation("snapshot_interval must be > 0".into()));
        }
        Ok(())
    }

    /// Whether the allow-list permits `tool`.
    pub fn allows(&self, tool: &str) -> bool {
        self.allowed_tools.is_empty() || self.allowed_tools.contains(tool)
    }

    /// History size at which compaction kicks in.
    pub fn compaction_threshold_chars(&self) -> usize {
        ((self.memory_budget_chars as f64) * self.safety_margin).floor() as usize
    }

    /// Token budget scaled by the safety margin, if one is configured.
    pub fn compaction_threshold_tokens(&self) -> Option<usize> {
        self.memory_budget_tokens
            .map(|tokens| ((tokens as f64) * self.safety_margin).floor() as usize)
    }

    /// Timeout for a tool, falling back to `template` and then the default.
    pub fn timeout_for(&self, tool: &str, template: Option<u64>) -> u64 {
        self.tool_timeouts
            .get(tool)
            .copied()
            .or(template)
            .unwrap_or(self.default_timeout_secs)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!("AgentConfig::load path={}", path.display());
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config = Self::from_toml_str(&fs::read_to_string(path)?)?;
        tracing::debug!(
            agent = %config.agent_name,
            mode = %config.planner_mode,
            budget = config.memory_budget_chars,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                tracing::debug!("Creating config directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!("Config saved to {}", path.display());
        Ok(())
    }
}
