//! Planner: turns a task into a validated plan.
//!
//! Three modes are supported:
//! - scripted: fixed templates keyed by task kind
//! - heuristic: ordered rules over the payload and prior artifacts
//! - model: steps proposed by an injected [`ModelPlanner`], checked against
//!   the allow-list and the DAG invariant before they are accepted
//!
//! Every plan leaves here validated by [`PlanGraph`]. Plan identifiers and
//! creation markers are assigned by the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{AgentConfig, PlannerMode};
use crate::core::artifact::ArtifactSet;
use crate::core::dag::PlanGraph;
use crate::core::plan::{Plan, PlanMode, PlanStep};
use crate::core::task::{Task, TaskKind};
use crate::{Error, Result};

/// External planning collaborator used in `model` mode.
#[async_trait]
pub trait ModelPlanner: Send + Sync {
    /// Propose steps for `task`, restricted to `allowed_tools`.
    async fn propose(&self, task: &Task, allowed_tools: &[String]) -> Result<Vec<PlanStep>>;
}

/// Template timeouts in seconds.
fn template_timeout(tool: &str) -> Option<u64> {
    match tool {
        "search_papers" | "collect_results" => Some(30),
        "generate_ideas" | "refine_ideas" | "reviewer" => Some(60),
        "compile_writeup" => Some(120),
        "run_experiment" => Some(300),
        _ => None,
    }
}

/// Builds plans for tasks.
#[derive(Clone, Default)]
pub struct Planner {
    model: Option<Arc<dyn ModelPlanner>>,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("model", &self.model.is_some())
            .finish()
    }
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(model: Arc<dyn ModelPlanner>) -> Self {
        Self { model: Some(model) }
    }

    /// Build a plan for `task` in `mode`.
    ///
    /// # Errors
    /// Returns `Error::Plan` if the resulting steps are not a valid DAG, if
    /// a model-proposed step names a tool outside the allow-list, or if the
    /// task carries nothing to plan with.
    pub async fn build_plan(
        &self,
        task: &Task,
        mode: PlannerMode,
        config: &AgentConfig,
        artifacts: &ArtifactSet,
    ) -> Result<Plan> {
        let (plan_mode, steps) = match mode {
            PlannerMode::Scripted => (PlanMode::Scripted, scripted_steps(task, config)),
            PlannerMode::Heuristic => (PlanMode::Heuristic, heuristic_steps(task, config, artifacts)?),
            PlannerMode::Model => match &self.model {
                Some(model) => (PlanMode::Model, self.model_steps(model.as_ref(), task, config).await?),
                None => {
                    tracing::warn!(task = %task.id, "No model planner available, using heuristic planner");
                    (PlanMode::Heuristic, heuristic_steps(task, config, artifacts)?)
                }
            },
        };

        let plan = Plan::new(format!("plan-{}", task.id), task.id.clone(), plan_mode, steps);
        PlanGraph::build(&plan)?;
        tracing::debug!(
            task = %task.id,
            mode = %plan.mode,
            steps = ?plan.step_names(),
            "Plan built"
        );
        Ok(plan)
    }

    async fn model_steps(
        &self,
        model: &dyn ModelPlanner,
        task: &Task,
        config: &AgentConfig,
    ) -> Result<Vec<PlanStep>> {
        let allowed: Vec<String> = config.allowed_tools.iter().cloned().collect();
        let mut steps = model.propose(task, &allowed).await.map_err(|e| match e {
            Error::Plan(_) => e,
            other => Error::Plan(format!("model planner failed: {}", other)),
        })?;

        if steps.is_empty() {
            return Err(Error::Plan("model planner proposed no steps".to_string()));
        }
        if let Some(step) = steps.iter().find(|s| !config.allows(&s.name)) {
            return Err(Error::Plan(format!(
                "model planner proposed disallowed tool: {}",
                step.name
            )));
        }
        PlanGraph::from_steps(&steps)?;
        for step in &mut steps {
            step.reset();
        }
        Ok(steps)
    }
}

fn step(tool: &str, config: &AgentConfig) -> PlanStep {
    PlanStep::new(tool)
        .with_timeout(config.timeout_for(tool, template_timeout(tool)))
        .with_retries(config.default_retry_attempts)
}

fn topic(task: &Task) -> Value {
    task.payload
        .get("topic")
        .cloned()
        .unwrap_or_else(|| json!(""))
}

fn research_chain(task: &Task, config: &AgentConfig, prior_ideas: Option<&str>) -> Vec<PlanStep> {
    let mut steps = Vec::new();
    let generate = match prior_ideas {
        Some(location) => step("generate_ideas", config)
            .with_input("topic", topic(task))
            .with_input("context", json!(location)),
        None => {
            steps.push(
                step("search_papers", config)
                    .with_input("query", topic(task))
                    .with_input("max_results", json!(3)),
            );
            step("generate_ideas", config)
                .with_input("topic", topic(task))
                .with_input("context", json!("${steps.search_papers.papers}"))
                .depends_on("search_papers")
        }
    };
    steps.push(generate);
    steps.push(
        step("refine_ideas", config)
            .with_input("ideas", json!("${steps.generate_ideas.ideas}"))
            .depends_on("generate_ideas")
            .with_output("ideas"),
    );
    steps
}

fn writeup_chain(task: &Task, config: &AgentConfig, collect: bool) -> Vec<PlanStep> {
    let title = task
        .payload
        .get("title")
        .cloned()
        .unwrap_or_else(|| json!("Report"));
    let mut steps = Vec::new();
    let mut compile = step("compile_writeup", config)
        .with_input("title", title)
        .with_output("writeup");

    if collect {
        steps.push(
            step("collect_results", config)
                .with_input("experiment_ids", json!(task.payload_array("experiments"))),
        );
        compile = compile
            .with_input("sections", json!({"results": "${steps.collect_results.summary}"}))
            .depends_on("collect_results");
    } else {
        let sections = task.payload.get("sections").cloned().unwrap_or_else(|| json!({}));
        compile = compile.with_input("sections", sections);
    }
    steps.push(compile);
    steps.push(
        step("reviewer", config)
            .with_input("content", json!("${steps.compile_writeup.document}"))
            .with_input("review_type", json!("writeup"))
            .depends_on("compile_writeup")
            .with_output("review"),
    );
    steps
}

fn review_step(config: &AgentConfig, content: Value, review_type: &str) -> PlanStep {
    step("reviewer", config)
        .with_input("content", content)
        .with_input("review_type", json!(review_type))
        .with_output("review")
}

/// Fixed templates by task kind.
pub fn scripted_steps(task: &Task, config: &AgentConfig) -> Vec<PlanStep> {
    match task.kind {
        TaskKind::Research => research_chain(task, config, None),
        TaskKind::Writeup => writeup_chain(task, config, true),
        TaskKind::Review => {
            let content = task
                .payload
                .get("content")
                .cloned()
                .unwrap_or_else(|| Value::Object(task.payload.clone()));
            vec![review_step(config, content, "general")]
        }
        TaskKind::Custom => vec![review_step(
            config,
            Value::Object(task.payload.clone()),
            "custom",
        )],
    }
}

/// Rule-based planning over the payload and prior artifacts.
///
/// - research: skip the paper search when an `ideas` artifact already exists
/// - writeup: collect results only when `experiments` is non-empty
/// - review: review `content`, else the latest `writeup` artifact
/// - custom: `steps` becomes a chain, else a single review
pub fn heuristic_steps(task: &Task, config: &AgentConfig, artifacts: &ArtifactSet) -> Result<Vec<PlanStep>> {
    let steps = match task.kind {
        TaskKind::Research => {
            let prior = artifacts.latest("ideas").map(|a| a.location.as_str());
            research_chain(task, config, prior)
        }
        TaskKind::Writeup => {
            let collect = !task.payload_array("experiments").is_empty();
            writeup_chain(task, config, collect)
        }
        TaskKind::Review => {
            let content = match task.payload.get("content") {
                Some(content) => content.clone(),
                None => match artifacts.latest("writeup") {
                    Some(writeup) => json!(writeup.location),
                    None => {
                        return Err(Error::Plan(format!(
                            "review task {} has no content and no prior writeup",
                            task.id
                        )))
                    }
                },
            };
            vec![review_step(config, content, "general")]
        }
        TaskKind::Custom => match task.payload.get("steps").and_then(Value::as_array) {
            Some(entries) if !entries.is_empty() => custom_chain(entries, config)?,
            _ => vec![review_step(config, Value::Object(task.payload.clone()), "custom")],
        },
    };
    Ok(steps)
}

/// Steps listed in a custom payload.
///
/// Tool names chain to the previous entry. Step objects keep their own
/// `depends_on` when they declare one and chain otherwise.
fn custom_chain(entries: &[Value], config: &AgentConfig) -> Result<Vec<PlanStep>> {
    let mut steps: Vec<PlanStep> = Vec::with_capacity(entries.len());
    for entry in entries {
        let previous = steps.last().map(|s| s.name.clone());
        let mut next = match entry {
            Value::String(name) => step(name, config),
            Value::Object(_) => {
                let mut parsed: PlanStep = serde_json::from_value(entry.clone())
                    .map_err(|e| Error::Plan(format!("invalid step in payload: {}", e)))?;
                parsed.reset();
                parsed
            }
            other => return Err(Error::Plan(format!("invalid step in payload: {}", other))),
        };
        if next.depends_on.is_empty() {
            if let Some(previous) = previous {
                next.depends_on.push(previous);
            }
        }
        steps.push(next);
    }
    Ok(steps)
}
