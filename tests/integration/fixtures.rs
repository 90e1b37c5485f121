//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Tools that record every invocation
//! - Snapshot stores whose saves or reads always fail
//! - Launching supervised runs with test configuration

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use orca::core::history::{EntryKind, HistoryEntry};
use orca::instance::{InstanceId, OrchestratorHandle, RunSummary, Services, Supervisor};
use orca::orchestration::{Tool, ToolRegistry};
use orca::state::{Snapshot, SnapshotStore};
use orca::{AgentConfig, Error, Result, RetryPolicy};

/// Inputs a tool was invoked with, shared with the test.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Value>>>);

impl CallLog {
    pub fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn inputs(&self) -> Vec<Value> {
        self.0.lock().unwrap().clone()
    }

    fn record(&self, input: Value) -> usize {
        let mut calls = self.0.lock().unwrap();
        calls.push(input);
        calls.len()
    }
}

/// A tool that records its inputs and answers with a fixed response.
pub struct RecordingTool {
    name: String,
    calls: CallLog,
    response: Value,
    /// Leading invocations that fail with a retryable error.
    fail_first: usize,
}

impl RecordingTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: CallLog::default(),
            response: json!({"tool": name}),
            fail_first: 0,
        }
    }

    pub fn responding(mut self, response: Value) -> Self {
        self.response = response;
        self
    }

    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, input: Value) -> Result<Value> {
        let n = self.calls.record(input);
        if n <= self.fail_first {
            return Err(Error::retryable(&self.name, format!("transient failure {}", n)));
        }
        Ok(self.response.clone())
    }
}

/// Register a recording tool per name and return the call logs by name.
pub fn recording_registry(names: &[&str]) -> (ToolRegistry, BTreeMap<String, CallLog>) {
    let mut registry = ToolRegistry::new();
    let mut logs = BTreeMap::new();
    for name in names {
        let tool = RecordingTool::new(name);
        logs.insert(name.to_string(), tool.calls());
        registry.register(tool);
    }
    (registry, logs)
}

/// A snapshot store that rejects every save.
#[derive(Debug, Default)]
pub struct FailingStore {
    pub attempts: AtomicU32,
}

#[async_trait]
impl SnapshotStore for FailingStore {
    async fn save(&self, _snapshot: &Snapshot) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::Persistence("disk full".to_string()))
    }

    async fn load(&self, _instance: &InstanceId) -> Result<Option<Snapshot>> {
        Ok(None)
    }
}

/// A snapshot store whose saves succeed but whose reads always fail.
#[derive(Debug, Default)]
pub struct UnreadableStore {
    pub saves: AtomicU32,
}

#[async_trait]
impl SnapshotStore for UnreadableStore {
    async fn save(&self, _snapshot: &Snapshot) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, _instance: &InstanceId) -> Result<Option<Snapshot>> {
        Err(Error::Persistence("corrupt snapshot".to_string()))
    }
}

/// Default configuration without backoff delays.
pub fn test_config() -> AgentConfig {
    AgentConfig {
        retry: RetryPolicy::immediate(),
        ..Default::default()
    }
}

/// Launch a supervised run.
pub fn launch(id: &str, services: Services) -> (OrchestratorHandle, JoinHandle<Result<RunSummary>>) {
    Supervisor::new(InstanceId::from(id), services).launch()
}

/// History entries of `kind`, in log order.
pub fn entries_of(summary: &RunSummary, kind: EntryKind) -> Vec<&HistoryEntry> {
    summary.history.iter().filter(|e| e.kind == kind).collect()
}
