//! End-to-end runs of the acceptance scenarios.
//!
//! Each test drives a supervised instance through its handle, exactly as an
//! embedding application would, and checks the final run summary.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;

use orca::core::artifact::ArtifactKind;
use orca::core::history::{EntryKind, HistoryEntry, HistoryLog};
use orca::core::plan::{Plan, PlanMode, PlanStep, StepStatus};
use orca::core::task::{Task, TaskId, TaskKind};
use orca::memory::{MemoryCompactor, Summarizer};
use orca::orchestration::{builtin_registry, ToolRegistry};
use orca::{AgentConfig, PlannerMode, Result, Services};

use crate::fixtures::{entries_of, launch, recording_registry, test_config, RecordingTool};

/// Test: Scripted research pipeline
///
/// Given a research task with topic "X" and the scripted planner
/// When the instance drains its queue
/// Then search, generate and refine run once each, in dependency order,
///      and the refined ideas are registered as the "ideas" artifact
#[tokio::test]
async fn test_scripted_research_pipeline() {
    let (handle, run) = launch("research", Services::new(builtin_registry()));
    handle
        .configure(AgentConfig {
            planner_mode: PlannerMode::Scripted,
            ..test_config()
        })
        .await
        .unwrap();
    handle
        .enqueue_task(Task::new("t1", TaskKind::Research).with_field("topic", json!("X")))
        .await
        .unwrap();
    handle.shutdown_when_idle().await.unwrap();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.stats.tasks_completed, 1);
    assert_eq!(summary.stats.steps_executed, 3);
    assert_eq!(summary.stats.steps_failed, 0);

    let steps: Vec<&str> = entries_of(&summary, EntryKind::Step)
        .iter()
        .map(|e| e.name.as_str())
        .collect();
    assert_eq!(steps, ["search_papers", "generate_ideas", "refine_ideas"]);

    let plan = &summary.plans[0];
    assert_eq!(plan.mode, PlanMode::Scripted);
    assert!(plan.steps.iter().all(|s| s.status == StepStatus::Succeeded));

    let artifacts: Vec<_> = summary.artifacts.iter().collect();
    assert_eq!(artifacts.len(), 1);
    let ideas = artifacts[0];
    assert_eq!(ideas.name, "ideas");
    assert_eq!(ideas.produced_by, "refine_ideas");
    assert_eq!(ideas.kind, ArtifactKind::Reference);
    assert_eq!(ideas.location, format!("step://{}/refine_ideas/ideas", plan.id));

    let refine = entries_of(&summary, EntryKind::Step)
        .into_iter()
        .find(|e| e.name == "refine_ideas")
        .unwrap();
    assert_eq!(ideas.content_hash, refine.result_digest);
}

/// Test: Compaction under a tight budget
///
/// Given 20 history entries, a 500 character budget and keep_last = 2
/// When the compactor runs twice
/// Then the log holds one summary plus the last 2 entries verbatim, fits
///      the budget, and the second run changes nothing
#[test]
fn test_compaction_keeps_tail_within_budget() {
    let config = AgentConfig {
        memory_budget_chars: 500,
        safety_margin: 1.0,
        keep_last: 2,
        ..Default::default()
    };
    let mut history = HistoryLog::new();
    for i in 0..20 {
        history.append(HistoryEntry::new(EntryKind::Observation, &format!("obs-{:02}", i), "d"));
    }
    assert!(MemoryCompactor::needs_compaction(&history, &config));
    let tail = history.entries()[18..].to_vec();

    let compactor = MemoryCompactor::new();
    let report = compactor.maybe_compact(&mut history, &config).unwrap().unwrap();

    assert_eq!(history.len(), 3);
    assert!(history.entries()[0].is_summary());
    assert_eq!(&history.entries()[1..], tail.as_slice());
    assert!(history.size_estimate() < 500);
    assert_eq!(report.folded, 18);

    let once = history.clone();
    assert!(compactor.maybe_compact(&mut history, &config).unwrap().is_none());
    assert_eq!(history, once);
}

/// Test: Compaction inside a running instance
///
/// Given an instance with a small memory budget and a large injected memory
/// When a task finishes
/// Then the instance compacts its history and keeps the latest entries
#[tokio::test]
async fn test_instance_compacts_history_after_task() {
    let (registry, _) = recording_registry(&["reviewer"]);
    let (handle, run) = launch("compacting", Services::new(registry));

    let memory: Vec<HistoryEntry> = (0..20)
        .map(|i| HistoryEntry::new(EntryKind::Observation, &format!("note-{:02}", i), "d"))
        .collect();
    handle.inject_memory(memory).await.unwrap();
    handle
        .enqueue_task(Task::new("t1", TaskKind::Review).with_field("content", json!("draft")))
        .await
        .unwrap();
    handle
        .configure(AgentConfig {
            memory_budget_chars: 600,
            safety_margin: 1.0,
            keep_last: 2,
            ..test_config()
        })
        .await
        .unwrap();
    handle.shutdown_when_idle().await.unwrap();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.stats.tasks_completed, 1);
    assert!(summary.stats.compactions >= 1);
    assert!(summary.history[0].is_summary());
    assert!(!summary.history.iter().any(|e| e.name == "note-00"));
}

/// Summarizes every folded run as the number of entries it replaced.
struct CountingSummarizer;

impl Summarizer for CountingSummarizer {
    fn summarize(&self, head: &[HistoryEntry]) -> Result<String> {
        Ok(format!("{} entries folded", head.len()))
    }
}

/// Test: Instance compaction uses the installed summarizer
///
/// Given services carrying a compactor with a custom summarizer
/// When the instance compacts after a task
/// Then the summary entry holds that summarizer's text
#[tokio::test]
async fn test_instance_compaction_uses_custom_summarizer() {
    let (registry, _) = recording_registry(&["reviewer"]);
    let services = Services::new(registry)
        .with_compactor(MemoryCompactor::with_summarizer(Arc::new(CountingSummarizer)));
    let (handle, run) = launch("summarized", services);

    let memory: Vec<HistoryEntry> = (0..20)
        .map(|i| HistoryEntry::new(EntryKind::Observation, &format!("note-{:02}", i), "d"))
        .collect();
    handle.inject_memory(memory).await.unwrap();
    handle
        .enqueue_task(Task::new("t1", TaskKind::Review).with_field("content", json!("draft")))
        .await
        .unwrap();
    handle
        .configure(AgentConfig {
            memory_budget_chars: 600,
            safety_margin: 1.0,
            keep_last: 2,
            ..test_config()
        })
        .await
        .unwrap();
    handle.shutdown_when_idle().await.unwrap();

    let summary = run.await.unwrap().unwrap();
    assert!(summary.stats.compactions >= 1);
    let folded = &summary.history[0];
    assert!(folded.is_summary());
    assert!(folded.detail.as_deref().unwrap().ends_with("entries folded"));
}

/// Test: Artifact kinds follow the locations tools report
///
/// Given one tool answering with a file path and another with a URL
/// When a manual plan registers their outputs as artifacts
/// Then the artifacts keep those locations, typed as file and url
#[tokio::test]
async fn test_reported_locations_set_artifact_kinds() {
    let mut registry = ToolRegistry::new();
    registry.register(RecordingTool::new("download").responding(json!({"location": "/tmp/paper.pdf"})));
    registry.register(RecordingTool::new("publish").responding(json!({"location": "https://example.org/post"})));
    let (handle, run) = launch("located", Services::new(registry));

    let steps = vec![
        PlanStep::new("download").with_output("paper"),
        PlanStep::new("publish").depends_on("download").with_output("post"),
    ];
    handle.enqueue_task(Task::new("t1", TaskKind::Custom)).await.unwrap();
    handle
        .set_plan(Plan::new("located", TaskId::new("t1"), PlanMode::Manual, steps))
        .await
        .unwrap();
    handle.configure(test_config()).await.unwrap();
    handle.shutdown_when_idle().await.unwrap();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.stats.tasks_completed, 1);

    let paper = summary.artifacts.latest("paper").unwrap();
    assert_eq!(paper.kind, ArtifactKind::File);
    assert_eq!(paper.location, "/tmp/paper.pdf");
    assert_eq!(paper.produced_by, "download");

    let post = summary.artifacts.latest("post").unwrap();
    assert_eq!(post.kind, ArtifactKind::Url);
    assert_eq!(post.location, "https://example.org/post");
}

/// Test: Disallowed tool is never invoked
///
/// Given an allow-list without "rm_rf" and a plan whose step is "rm_rf"
/// When the plan is dispatched
/// Then the step fails with a validation error, the task fails, and the
///      tool is never called
#[tokio::test]
async fn test_disallowed_tool_rejected() {
    let tool = RecordingTool::new("rm_rf");
    let calls = tool.calls();
    let mut registry = ToolRegistry::new();
    registry.register(tool);
    let (handle, run) = launch("guarded", Services::new(registry));

    let task = Task::new("t1", TaskKind::Custom);
    let plan = Plan::new("manual", TaskId::new("t1"), PlanMode::Manual, vec![PlanStep::new("rm_rf")]);
    handle.enqueue_task(task).await.unwrap();
    handle.set_plan(plan).await.unwrap();
    handle
        .configure(AgentConfig {
            allowed_tools: BTreeSet::from(["search_papers".to_string()]),
            ..test_config()
        })
        .await
        .unwrap();
    handle.shutdown_when_idle().await.unwrap();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(calls.count(), 0);
    assert_eq!(summary.stats.tasks_failed, 1);
    assert_eq!(summary.stats.steps_executed, 0);
    assert_eq!(summary.plans[0].step("rm_rf").unwrap().status, StepStatus::Failed);

    let errors = entries_of(&summary, EntryKind::Error);
    let rejected = errors.iter().find(|e| e.name == "rm_rf").unwrap();
    assert!(rejected.has_tag("ValidationError"));
    assert!(rejected.has_tag("rejected"));
    assert!(rejected.error.as_deref().unwrap().contains("allow-list"));
}

/// Test: Disallowed tool from a heuristic custom plan
///
/// Given a custom task listing "rm_rf" after an allowed step
/// When the plan runs
/// Then the allowed step succeeds and only "rm_rf" is rejected
#[tokio::test]
async fn test_disallowed_tool_in_custom_chain() {
    let (registry, logs) = recording_registry(&["fetch", "rm_rf"]);
    let (handle, run) = launch("guarded-chain", Services::new(registry));
    handle
        .configure(AgentConfig {
            allowed_tools: BTreeSet::from(["fetch".to_string()]),
            ..test_config()
        })
        .await
        .unwrap();
    handle
        .enqueue_task(Task::new("t1", TaskKind::Custom).with_field("steps", json!(["fetch", "rm_rf"])))
        .await
        .unwrap();
    handle.shutdown_when_idle().await.unwrap();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(logs["fetch"].count(), 1);
    assert_eq!(logs["rm_rf"].count(), 0);
    let plan = &summary.plans[0];
    assert_eq!(plan.step("fetch").unwrap().status, StepStatus::Succeeded);
    assert_eq!(plan.step("rm_rf").unwrap().status, StepStatus::Failed);
    assert_eq!(summary.stats.tasks_failed, 1);
}

/// Test: Handles survive the run
///
/// Given a launched instance
/// When every handle is dropped after enqueueing work
/// Then the instance drains the queue and stops on its own
#[tokio::test]
async fn test_dropped_handles_drain_and_stop() {
    let (handle, run) = launch("orphaned", Services::new(builtin_registry()));
    handle.configure(test_config()).await.unwrap();
    handle
        .enqueue_task(Task::new("t1", TaskKind::Review).with_field("content", json!("a")))
        .await
        .unwrap();
    handle
        .enqueue_task(Task::new("t2", TaskKind::Review).with_field("content", json!("b")))
        .await
        .unwrap();
    drop(handle);

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.stats.tasks_completed, 2);
    assert!(summary.pending.is_empty());
}
