//! Integration tests for the instance lifecycle.
//!
//! Covers shutdown modes, restarts at the event threshold, resuming from
//! a file-backed snapshot, snapshot cadence, and degraded durability when
//! the store rejects writes or reads.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use orca::core::history::EntryKind;
use orca::core::task::{Task, TaskKind};
use orca::instance::{InstanceId, Supervisor};
use orca::orchestration::ToolRegistry;
use orca::state::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
use orca::{AgentConfig, Services};

use crate::fixtures::{
    entries_of, launch, recording_registry, test_config, FailingStore, RecordingTool, UnreadableStore,
};

fn review(id: &str) -> Task {
    Task::new(id, TaskKind::Review).with_field("content", json!(format!("draft {}", id)))
}

fn reviewer_services() -> Services {
    let (registry, _) = recording_registry(&["reviewer"]);
    Services::new(registry)
}

/// Test: Drain shutdown processes the whole queue in order
///
/// Given three queued review tasks
/// When shutdown_when_idle is requested
/// Then every task completes, in enqueue order, before the instance stops
#[tokio::test]
async fn test_drain_shutdown_processes_queue_in_order() {
    let (handle, run) = launch("drain", reviewer_services());
    for id in ["t1", "t2", "t3"] {
        handle.enqueue_task(review(id)).await.unwrap();
    }
    handle.configure(test_config()).await.unwrap();
    handle.shutdown_when_idle().await.unwrap();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.stats.tasks_completed, 3);
    assert!(summary.pending.is_empty());

    let order: Vec<&str> = summary.plans.iter().map(|p| p.task_id.as_str()).collect();
    assert_eq!(order, ["t1", "t2", "t3"]);
    let ids: Vec<&str> = summary.plans.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, ["plan-t1-1", "plan-t2-2", "plan-t3-3"]);
}

/// Test: Immediate shutdown leaves queued work pending
///
/// Given an unconfigured instance with queued tasks
/// When shutdown is requested
/// Then the instance stops without running anything and reports the
///      tasks as still pending
#[tokio::test]
async fn test_immediate_shutdown_keeps_pending_tasks() {
    let (handle, run) = launch("immediate", reviewer_services());
    handle.enqueue_task(review("t1")).await.unwrap();
    handle.enqueue_task(review("t2")).await.unwrap();
    handle.shutdown().await.unwrap();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.stats.steps_executed, 0);
    assert_eq!(summary.pending.len(), 2);
    assert!(handle.is_closed());
    assert!(handle.enqueue_task(review("t3")).await.is_err());
}

/// Test: Exactly one restart signal per instance
///
/// Given a restart threshold small enough to trigger several restarts
/// When the supervisor drains six tasks
/// Then every task completes, each retired instance wrote exactly one
///      restart marker, and the generation counts the restarts
#[tokio::test]
async fn test_each_restart_signalled_once() {
    let store = Arc::new(MemorySnapshotStore::new());
    let (handle, run) = launch("restarts", reviewer_services().with_store(store.clone()));
    handle
        .configure(AgentConfig {
            restart_threshold: 5,
            ..test_config()
        })
        .await
        .unwrap();
    for i in 0..6 {
        handle.enqueue_task(review(&format!("t{}", i))).await.unwrap();
    }
    handle.shutdown_when_idle().await.unwrap();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.stats.tasks_completed, 6);
    assert!(summary.generation >= 1);

    let snapshots = store.all(&InstanceId::from("restarts"));
    let restart_markers: Vec<usize> = snapshots
        .iter()
        .map(|s| s.state.history.iter().filter(|e| e.name == "restart").count())
        .filter(|&n| n > 0)
        .collect();
    assert!(restart_markers.iter().all(|&n| n == 1));
    assert_eq!(restart_markers.len() as u64, summary.generation);

    let generations: Vec<u64> = snapshots.iter().map(|s| s.state.generation).collect();
    assert!(generations.windows(2).all(|w| w[0] <= w[1]));
    let sequences: Vec<u64> = snapshots.iter().map(|s| s.sequence).collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

/// Test: Resume from a file snapshot
///
/// Given a run stopped with two tasks still queued, saved to disk
/// When a new supervisor starts with the same instance id and store
/// Then it resumes the queue and history and completes both tasks
#[tokio::test]
async fn test_resume_from_file_snapshot() {
    let dir = TempDir::new().unwrap();
    let id = InstanceId::from("resumable");

    let store = Arc::new(FileSnapshotStore::new(dir.path()));
    let (handle, run) = launch("resumable", reviewer_services().with_store(store.clone()));
    handle.enqueue_task(review("t1")).await.unwrap();
    handle.enqueue_task(review("t2")).await.unwrap();
    handle.shutdown().await.unwrap();
    let first = run.await.unwrap().unwrap();
    assert_eq!(first.pending.len(), 2);

    let stored = store.load(&id).await.unwrap().unwrap();
    assert_eq!(stored.state.pending.len(), 2);

    let store = Arc::new(FileSnapshotStore::new(dir.path()));
    let (handle, run) = Supervisor::new(id.clone(), reviewer_services().with_store(store.clone())).launch();
    handle.configure(test_config()).await.unwrap();
    handle.shutdown_when_idle().await.unwrap();
    let second = run.await.unwrap().unwrap();

    assert_eq!(second.stats.tasks_completed, 2);
    assert!(second.pending.is_empty());
    let enqueued = entries_of(&second, EntryKind::Metadata)
        .into_iter()
        .filter(|e| e.name == "enqueue_task")
        .count();
    assert_eq!(enqueued, 2);

    let seqs: Vec<u64> = second.history.iter().map(|e| e.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

/// Test: Snapshot cadence follows resolved steps
///
/// Given snapshot_interval = 2 and a four step custom chain
/// When the task runs to completion
/// Then snapshots are written after the second and fourth step, plus the
///      final snapshot on stop
#[tokio::test]
async fn test_snapshot_interval_cadence() {
    let store = Arc::new(MemorySnapshotStore::new());
    let (registry, _) = recording_registry(&["a", "b", "c", "d"]);
    let (handle, run) = launch("cadence", Services::new(registry).with_store(store.clone()));
    handle
        .enqueue_task(Task::new("t1", TaskKind::Custom).with_field("steps", json!(["a", "b", "c", "d"])))
        .await
        .unwrap();
    handle
        .configure(AgentConfig {
            snapshot_interval: Some(2),
            ..test_config()
        })
        .await
        .unwrap();
    handle.shutdown_when_idle().await.unwrap();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.stats.steps_executed, 4);

    let snapshots = store.all(&InstanceId::from("cadence"));
    assert_eq!(snapshots.len(), 3);
    assert_eq!(summary.stats.snapshots_saved, 3);
    let resolved: Vec<u64> = snapshots.iter().map(|s| s.state.stats.steps_resolved()).collect();
    assert_eq!(resolved, [2, 4, 4]);
}

/// Test: Failing store degrades durability without stopping the run
///
/// Given a snapshot store that rejects every write
/// When two tasks run
/// Then both complete, each failed save is recorded as a persistence
///      error, and the run reports degraded durability
#[tokio::test]
async fn test_failing_store_degrades_durability() {
    let store = Arc::new(FailingStore::default());
    let (handle, run) = launch("degraded", reviewer_services().with_store(store.clone()));
    handle.configure(test_config()).await.unwrap();
    handle.enqueue_task(review("t1")).await.unwrap();
    handle.enqueue_task(review("t2")).await.unwrap();
    handle.shutdown_when_idle().await.unwrap();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.stats.tasks_completed, 2);
    assert!(summary.stats.degraded_durability);
    assert_eq!(summary.stats.snapshots_saved, 0);

    let attempts = store.attempts.load(Ordering::SeqCst);
    assert!(attempts >= 2);
    let persistence_errors = entries_of(&summary, EntryKind::Error)
        .into_iter()
        .filter(|e| e.name == "snapshot" && e.has_tag("PersistenceError"))
        .count();
    assert!(persistence_errors >= 2);
}

/// Test: Unreadable snapshot keeps the run going in memory
///
/// Given a snapshot store whose reads fail
/// When a supervised run starts against it
/// Then the instance still accepts configuration and completes its task,
///      the failed read is recorded as a persistence error, and the run
///      reports degraded durability
#[tokio::test]
async fn test_unreadable_snapshot_continues_in_memory() {
    let store = Arc::new(UnreadableStore::default());
    let (handle, run) = launch("unreadable", reviewer_services().with_store(store.clone()));
    handle.configure(test_config()).await.unwrap();
    handle.enqueue_task(review("t1")).await.unwrap();
    handle.shutdown_when_idle().await.unwrap();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.stats.tasks_completed, 1);
    assert!(summary.stats.degraded_durability);
    assert!(summary.stats.errors >= 1);
    assert!(store.saves.load(Ordering::SeqCst) >= 1);

    let first = &summary.history[0];
    assert_eq!(first.kind, EntryKind::Error);
    assert_eq!(first.name, "snapshot");
    assert!(first.has_tag("PersistenceError"));
    assert!(first.error.as_deref().unwrap().contains("corrupt snapshot"));
}

/// Test: Transient tool failures are retried and observed
///
/// Given a tool that fails twice with a retryable error
/// When its step runs with two retries allowed
/// Then the step succeeds on the third attempt and both failed attempts
///      are recorded as retry observations
#[tokio::test]
async fn test_retries_recorded_as_observations() {
    let tool = RecordingTool::new("flaky").failing_first(2);
    let calls = tool.calls();
    let mut registry = ToolRegistry::new();
    registry.register(tool);
    let (handle, run) = launch("retries", Services::new(registry));
    handle.configure(test_config()).await.unwrap();
    handle
        .enqueue_task(Task::new("t1", TaskKind::Custom).with_field("steps", json!(["flaky"])))
        .await
        .unwrap();
    handle.shutdown_when_idle().await.unwrap();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(calls.count(), 3);
    assert_eq!(summary.stats.tasks_completed, 1);
    assert_eq!(summary.plans[0].step("flaky").unwrap().attempts, 3);

    let retries: Vec<_> = entries_of(&summary, EntryKind::Observation)
        .into_iter()
        .filter(|e| e.has_tag("retry"))
        .collect();
    assert_eq!(retries.len(), 2);
    assert!(retries.iter().all(|e| e.name == "flaky"));
    assert_eq!(entries_of(&summary, EntryKind::Step).len(), 1);
}
