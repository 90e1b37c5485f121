//! Task data model.
//!
//! A task is one unit of inbound work. It is never mutated after it is
//! enqueued; the orchestrator drops it from the pending queue once its plan
//! completes or fails.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier of a task, unique among the pending tasks of one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Kind of work a task asks for. Drives plan templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Research,
    Writeup,
    Review,
    #[default]
    Custom,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Research => write!(f, "research"),
            TaskKind::Writeup => write!(f, "writeup"),
            TaskKind::Review => write!(f, "review"),
            TaskKind::Custom => write!(f, "custom"),
        }
    }
}

/// A unit of inbound work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(default)]
    pub kind: TaskKind,
    /// Free-form payload interpreted by the planner.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Task {
    /// Create a task with an empty payload.
    pub fn new(id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: TaskId::new(id),
            kind,
            payload: Map::new(),
        }
    }

    /// Builder-style payload field.
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    /// Payload field as a string, if present and a string.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Payload field as an array, treating a missing field as empty.
    pub fn payload_array(&self, key: &str) -> &[Value] {
        self.payload
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
