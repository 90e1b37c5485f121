//! Property tests for history compaction and plan scheduling.

use proptest::prelude::*;

use orca::core::dag::{ready_steps, PlanGraph};
use orca::core::history::{EntryKind, HistoryEntry, HistoryLog};
use orca::core::plan::{Plan, PlanMode, PlanStep, StepStatus};
use orca::core::task::TaskId;
use orca::memory::compact;

fn history_of(n: usize) -> HistoryLog {
    let mut log = HistoryLog::new();
    for i in 0..n {
        log.append(HistoryEntry::new(EntryKind::Observation, &format!("entry-{}", i), "d"));
    }
    log
}

/// Steps named s0..sN where every dependency points to an earlier step.
fn dag_plan(deps: &[Vec<usize>]) -> Plan {
    let steps = deps
        .iter()
        .enumerate()
        .map(|(i, targets)| {
            let mut step = PlanStep::new(&format!("s{}", i));
            let mut seen: Vec<usize> = targets.iter().map(|t| t % i.max(1)).filter(|&t| t < i).collect();
            seen.sort_unstable();
            seen.dedup();
            for t in seen {
                step = step.depends_on(&format!("s{}", t));
            }
            step
        })
        .collect();
    Plan::new("p", TaskId::new("t"), PlanMode::Manual, steps)
}

proptest! {
    /// Compaction keeps the tail verbatim, and a second pass is a no-op.
    #[test]
    fn prop_compaction_tail_and_idempotence(
        n in 1usize..60,
        keep_last in 0usize..6,
        budget in 50usize..3000,
    ) {
        let mut log = history_of(n);
        let before = log.clone();

        let report = compact(&mut log, keep_last, budget).unwrap();
        match report {
            Some(report) => {
                prop_assert_eq!(log.len(), keep_last + 1);
                prop_assert!(log.entries()[0].is_summary());
                prop_assert_eq!(&log.entries()[1..], &before.entries()[n - keep_last..]);
                prop_assert_eq!(report.folded as usize, n - keep_last);
            }
            None => prop_assert_eq!(&log, &before),
        }

        let once = log.clone();
        prop_assert!(compact(&mut log, keep_last, budget).unwrap().is_none());
        prop_assert_eq!(&log, &once);
    }

    /// Driving any acyclic plan with arbitrary step outcomes always ends
    /// with every step terminal, and no step starts before its
    /// dependencies succeed.
    #[test]
    fn prop_ready_steps_always_reach_completion(
        deps in prop::collection::vec(prop::collection::vec(0usize..12, 0..3), 1..12),
        failures in prop::collection::vec(any::<bool>(), 12),
    ) {
        let mut plan = dag_plan(&deps);
        prop_assert!(PlanGraph::build(&plan).is_ok());

        let mut rounds = 0;
        loop {
            let ready = ready_steps(&mut plan);
            if ready.is_empty() {
                break;
            }
            for step in ready {
                for dep in &step.depends_on {
                    prop_assert_eq!(plan.step(dep).unwrap().status, StepStatus::Succeeded);
                }
                let index: usize = step.name[1..].parse().unwrap();
                let status = if failures[index] { StepStatus::Failed } else { StepStatus::Succeeded };
                plan.step_mut(&step.name).unwrap().status = status;
            }
            rounds += 1;
            prop_assert!(rounds <= deps.len());
        }

        prop_assert!(plan.is_complete());
        for step in &plan.steps {
            if step.depends_on.iter().any(|d| plan.step(d).unwrap().status == StepStatus::Failed) {
                prop_assert_eq!(step.status, StepStatus::Failed);
            }
        }
    }

    /// Closing a chain back onto its first step is always rejected.
    #[test]
    fn prop_cycles_rejected(len in 2usize..10) {
        let mut steps: Vec<PlanStep> = (0..len)
            .map(|i| {
                let step = PlanStep::new(&format!("s{}", i));
                if i == 0 { step } else { step.depends_on(&format!("s{}", i - 1)) }
            })
            .collect();
        steps[0] = PlanStep::new("s0").depends_on(&format!("s{}", len - 1));
        let plan = Plan::new("p", TaskId::new("t"), PlanMode::Manual, steps);
        prop_assert!(PlanGraph::build(&plan).is_err());
    }
}
