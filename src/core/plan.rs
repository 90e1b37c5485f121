//! Plan and plan step data model.
//!
//! A plan is the ordered list of steps the orchestrator runs for one task.
//! Steps name a registered tool and may depend on other steps of the same
//! plan; the dependency structure is checked by [`crate::core::dag`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::core::task::TaskId;

/// How a plan was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    Scripted,
    Heuristic,
    Model,
    /// Supplied from outside through `set_plan`.
    Manual,
}

impl std::fmt::Display for PlanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanMode::Scripted => write!(f, "scripted"),
            PlanMode::Heuristic => write!(f, "heuristic"),
            PlanMode::Model => write!(f, "model"),
            PlanMode::Manual => write!(f, "manual"),
        }
    }
}

/// Step status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting on dependencies.
    #[default]
    Pending,
    /// Dependencies satisfied, not yet dispatched.
    Ready,
    /// Handed to the dispatcher.
    Running,
    Succeeded,
    Failed,
}

impl StepStatus {
    /// Whether the step has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Failed)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Ready => write!(f, "ready"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_retries() -> u32 {
    2
}

/// A single step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Tool name; unique within the plan.
    pub name: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Retries after the first attempt.
    #[serde(default = "default_retries")]
    pub retry_attempts: u32,
    #[serde(default)]
    pub status: StepStatus,
    /// Explicit dispatcher queue; falls back to the tool's configured queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Artifact names registered when the step succeeds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PlanStep {
    /// Create a pending step with default timeout and retries.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inputs: Map::new(),
            depends_on: Vec::new(),
            timeout_secs: default_timeout(),
            retry_attempts: default_retries(),
            status: StepStatus::Pending,
            queue: None,
            outputs: Vec::new(),
            attempts: 0,
            last_error: None,
        }
    }

    pub fn with_input(mut self, key: &str, value: Value) -> Self {
        self.inputs.insert(key.to_string(), value);
        self
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn depends_on(mut self, name: &str) -> Self {
        self.depends_on.push(name.to_string());
        self
    }

    pub fn with_output(mut self, name: &str) -> Self {
        self.outputs.push(name.to_string());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_retries(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_string());
        self
    }

    /// Return the step to a fresh pending state.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.attempts = 0;
        self.last_error = None;
    }

    /// Inputs with `${steps.<name>[.<field>...]}` references replaced by
    /// dependency results.
    ///
    /// Only values that consist entirely of a reference are substituted.
    /// References to unknown steps or missing fields are left untouched.
    pub fn resolved_inputs(&self, results: &BTreeMap<String, Value>) -> Map<String, Value> {
        self.inputs
            .iter()
            .map(|(key, value)| (key.clone(), resolve_value(value, results)))
            .collect()
    }
}

fn resolve_value(value: &Value, results: &BTreeMap<String, Value>) -> Value {
    match value {
        Value::String(text) => resolve_reference(text, results).unwrap_or_else(|| value.clone()),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, results)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, results)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_reference(text: &str, results: &BTreeMap<String, Value>) -> Option<Value> {
    let path = text.strip_prefix("${steps.")?.strip_suffix('}')?;
    let mut parts = path.split('.');
    let step = parts.next().filter(|s| !s.is_empty())?;
    let mut current = results.get(step)?;
    for field in parts {
        current = match current {
            Value::Object(map) => map.get(field)?,
            Value::Array(items) => items.get(field.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// An ordered set of steps produced for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub task_id: TaskId,
    /// History sequence number at creation.
    pub created_at_seq: u64,
    pub mode: PlanMode,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn new(id: impl Into<String>, task_id: TaskId, mode: PlanMode, steps: Vec<PlanStep>) -> Self {
        Self {
            id: id.into(),
            task_id,
            created_at_seq: 0,
            mode,
            steps,
        }
    }

    pub fn step(&self, name: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    /// Whether every step is terminal.
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    pub fn all_succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Succeeded)
    }

    pub fn has_failures(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Put every step back to pending, as for a freshly supplied plan.
    pub fn reset(&mut self) {
        for step in &mut self.steps {
            step.reset();
        }
    }
}
