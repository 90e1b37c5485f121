//! Step dispatcher.
//!
//! Runs plan steps against registered tools under the policy of the active
//! configuration:
//! - allow-list and registry checks before any call is made
//! - a per-tool circuit breaker that fails fast after repeated failures
//! - per-queue concurrency limits backed by semaphores
//! - a timeout on every attempt
//! - exponential backoff between retries of retryable failures
//!
//! The dispatcher never touches orchestrator state. It returns a
//! [`StepReport`] that the orchestrator applies to the plan and history.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::config::AgentConfig;
use crate::core::plan::PlanStep;
use crate::orchestration::tools::ToolRegistry;
use crate::util::with_timeout;
use crate::Error;

/// Queue used when neither the step nor the configuration names one.
pub const DEFAULT_QUEUE: &str = "default";

/// One invocation of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    pub latency_ms: u64,
    /// Error text when the attempt failed.
    pub error: Option<String>,
    pub retryable: bool,
}

/// Terminal failure of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    /// Error class, as given by `Error::tag`.
    pub tag: String,
    pub message: String,
    pub retryable: bool,
}

impl StepFailure {
    fn from_error(error: &Error) -> Self {
        Self {
            tag: error.tag().to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded { output: Value, latency_ms: u64 },
    /// `rejected` is set when the step failed before any attempt was made.
    Failed { failure: StepFailure, rejected: bool },
}

/// Result of dispatching one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step_name: String,
    pub outcome: StepOutcome,
    pub attempts: Vec<AttemptRecord>,
}

impl StepReport {
    fn rejected(step: &PlanStep, error: Error) -> Self {
        tracing::warn!(step = %step.name, error = %error, "Step rejected before dispatch");
        Self {
            step_name: step.name.clone(),
            outcome: StepOutcome::Failed {
                failure: StepFailure::from_error(&error),
                rejected: true,
            },
            attempts: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StepOutcome::Succeeded { .. })
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Attempts that failed and were followed by another attempt.
    pub fn retried_attempts(&self) -> impl Iterator<Item = &AttemptRecord> {
        let last = self.attempts.len().saturating_sub(1);
        self.attempts
            .iter()
            .enumerate()
            .filter(move |(i, a)| *i < last && a.error.is_some())
            .map(|(_, a)| a)
    }
}

/// Consecutive failure counts per tool.
#[derive(Debug, Default)]
struct CircuitBreaker {
    threshold: u32,
    failures: Mutex<HashMap<String, u32>>,
}

impl CircuitBreaker {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn counts(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.failures.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_open(&self, tool: &str) -> bool {
        self.threshold > 0 && self.counts().get(tool).copied().unwrap_or(0) >= self.threshold
    }

    fn record_success(&self, tool: &str) {
        self.counts().remove(tool);
    }

    fn record_failure(&self, tool: &str) {
        let mut counts = self.counts();
        let count = counts.entry(tool.to_string()).or_insert(0);
        *count += 1;
        if self.threshold > 0 && *count == self.threshold {
            tracing::warn!(tool, failures = *count, "Circuit breaker opened");
        }
    }
}

/// Executes plan steps. Cheap to clone; clones share queues and breaker state.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    config: Arc<AgentConfig>,
    queues: Arc<HashMap<String, Arc<Semaphore>>>,
    breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut queues: Vec<&String> = self.queues.keys().collect();
        queues.sort();
        f.debug_struct("Dispatcher")
            .field("tools", &self.registry.tool_names())
            .field("queues", &queues)
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher for `config` over the tools in `registry`.
    pub fn new(registry: Arc<ToolRegistry>, config: Arc<AgentConfig>) -> Self {
        let mut queues: HashMap<String, Arc<Semaphore>> = config
            .queues
            .iter()
            .map(|(name, limit)| (name.clone(), Arc::new(Semaphore::new((*limit).max(1)))))
            .collect();
        queues
            .entry(DEFAULT_QUEUE.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(config.default_concurrency.max(1))));

        Self {
            breaker: Arc::new(CircuitBreaker::new(config.circuit_breaker_threshold)),
            registry,
            config,
            queues: Arc::new(queues),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Queue a step runs on: its own, else the tool's configured queue,
    /// else the default queue. Unknown queue names fall back to the default.
    pub fn queue_for<'a>(&'a self, step: &'a PlanStep) -> &'a str {
        let named = step
            .queue
            .as_deref()
            .or_else(|| self.config.tool_queues.get(&step.name).map(String::as_str))
            .unwrap_or(DEFAULT_QUEUE);
        if self.queues.contains_key(named) {
            named
        } else {
            tracing::warn!(step = %step.name, queue = named, "Unknown queue, using default");
            DEFAULT_QUEUE
        }
    }

    /// Execute one step with its inputs as given.
    ///
    /// Never fails; every failure is described by the returned report.
    pub async fn execute(&self, step: &PlanStep) -> StepReport {
        if !self.config.allows(&step.name) {
            return StepReport::rejected(
                step,
                Error::Validation(format!("tool '{}' is not in the allow-list", step.name)),
            );
        }
        let Some(tool) = self.registry.get(&step.name) else {
            return StepReport::rejected(
                step,
                Error::Validation(format!("tool '{}' is not registered", step.name)),
            );
        };
        if self.breaker.is_open(&step.name) {
            return StepReport::rejected(
                step,
                Error::permanent(&step.name, "circuit open after repeated failures"),
            );
        }

        let queue = self.queue_for(step).to_string();
        let timeout = Duration::from_secs(step.timeout_secs);
        let input = Value::Object(step.inputs.clone());
        let max_attempts = step.retry_attempts.saturating_add(1);
        let mut attempts = Vec::new();

        for attempt in 1..=max_attempts {
            let result = match self.queues.get(&queue).cloned() {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        let started = Instant::now();
                        tracing::debug!(step = %step.name, attempt, %queue, "Invoking tool");
                        let result = with_timeout(timeout, tool.invoke(input.clone())).await;
                        (result, started.elapsed().as_millis() as u64)
                    }
                    Err(_) => (Err(Error::TaskJoin(format!("queue '{}' closed", queue))), 0),
                },
                None => (Err(Error::TaskJoin(format!("queue '{}' missing", queue))), 0),
            };

            match result {
                (Ok(output), latency_ms) => {
                    self.breaker.record_success(&step.name);
                    attempts.push(AttemptRecord {
                        attempt,
                        latency_ms,
                        error: None,
                        retryable: false,
                    });
                    tracing::debug!(step = %step.name, attempt, latency_ms, "Step succeeded");
                    return StepReport {
                        step_name: step.name.clone(),
                        outcome: StepOutcome::Succeeded { output, latency_ms },
                        attempts,
                    };
                }
                (Err(error), latency_ms) => {
                    self.breaker.record_failure(&step.name);
                    let retryable = error.is_retryable();
                    attempts.push(AttemptRecord {
                        attempt,
                        latency_ms,
                        error: Some(error.to_string()),
                        retryable,
                    });

                    let more = retryable && attempt < max_attempts && !self.breaker.is_open(&step.name);
                    if !more {
                        tracing::warn!(step = %step.name, attempt, error = %error, "Step failed");
                        return StepReport {
                            step_name: step.name.clone(),
                            outcome: StepOutcome::Failed {
                                failure: StepFailure::from_error(&error),
                                rejected: false,
                            },
                            attempts,
                        };
                    }

                    let delay = self.config.retry.delay(attempt);
                    tracing::warn!(
                        step = %step.name,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "Step attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        // max_attempts is at least 1, so the loop always returns.
        StepReport::rejected(step, Error::TaskJoin("no attempt was made".to_string()))
    }
}
