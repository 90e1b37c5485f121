//! Plan graph: dependency structure of a plan's steps.
//!
//! The graph uses petgraph's `DiGraph` with one node per step and an edge
//! from each dependency to its dependent. Building it validates the plan:
//! step names are unique, dependencies exist, and the graph is acyclic.
//! Scheduling helpers work on the plan's step statuses directly.

use crate::core::plan::{Plan, PlanStep, StepStatus};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Validated dependency graph over the step names of one plan.
pub struct PlanGraph {
    graph: DiGraph<String, ()>,
}

impl PlanGraph {
    /// Build and validate the graph of `plan`.
    ///
    /// # Errors
    /// Returns `Error::Plan` if:
    /// - Two steps share a name
    /// - A step depends on a name that is not in the plan
    /// - The dependencies form a cycle
    pub fn build(plan: &Plan) -> Result<Self> {
        Self::from_steps(&plan.steps)
    }

    pub fn from_steps(steps: &[PlanStep]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index: HashMap<String, NodeIndex> = HashMap::new();

        for step in steps {
            if step.name.trim().is_empty() {
                return Err(Error::Plan("step name must not be empty".to_string()));
            }
            if index.contains_key(&step.name) {
                return Err(Error::Plan(format!("duplicate step name: {}", step.name)));
            }
            let node = graph.add_node(step.name.clone());
            index.insert(step.name.clone(), node);
        }

        for step in steps {
            let to = index[&step.name];
            for dep in &step.depends_on {
                let from = index.get(dep).ok_or_else(|| {
                    Error::Plan(format!("step {} depends on unknown step {}", step.name, dep))
                })?;
                graph.update_edge(*from, to, ());
            }
        }

        if is_cyclic_directed(&graph) {
            let at = toposort(&graph, None)
                .err()
                .and_then(|cycle| graph.node_weight(cycle.node_id()).cloned())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(Error::Plan(format!("dependency cycle detected at step: {}", at)));
        }

        Ok(Self { graph })
    }

    pub fn step_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }
}

impl std::fmt::Debug for PlanGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanGraph")
            .field("steps", &self.step_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

/// Fail every not-yet-started step that has a failed dependency.
///
/// Runs to a fixed point so failure travels down the whole chain. Returns
/// the names of the steps failed this way, in plan order.
pub fn propagate_failures(plan: &mut Plan) -> Vec<String> {
    let mut propagated = Vec::new();
    loop {
        let failed: HashSet<String> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.name.clone())
            .collect();

        let mut changed = false;
        for step in &mut plan.steps {
            if !matches!(step.status, StepStatus::Pending | StepStatus::Ready) {
                continue;
            }
            if let Some(dep) = step.depends_on.iter().find(|d| failed.contains(*d)) {
                step.status = StepStatus::Failed;
                step.last_error = Some(format!("dependency {} failed", dep));
                propagated.push(step.name.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    propagated
}

/// Steps whose dependencies have all succeeded and that have not started.
///
/// Failure is propagated first. Every returned step is marked `ready`;
/// steps already marked `ready` but not dispatched are returned again.
/// No ordering is implied among the returned steps beyond plan order.
pub fn ready_steps(plan: &mut Plan) -> Vec<PlanStep> {
    propagate_failures(plan);

    let succeeded: HashSet<String> = plan
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Succeeded)
        .map(|s| s.name.clone())
        .collect();

    let mut ready = Vec::new();
    for step in &mut plan.steps {
        if !matches!(step.status, StepStatus::Pending | StepStatus::Ready) {
            continue;
        }
        if step.depends_on.iter().all(|d| succeeded.contains(d)) {
            step.status = StepStatus::Ready;
            ready.push(step.clone());
        }
    }
    ready
}
