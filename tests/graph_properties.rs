// tests/graph_properties.rs

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;

use jobflow::dag::DependencyGraph;
use jobflow::task::model::{RetryPolicy, TaskStatus};
use jobflow::task::state::ActionOutcome;
use jobflow::types::{DependencyType, TaskId};
use jobflow_test_utils::task;

// Acyclic by construction: an edge always goes from a lower to a higher id.
fn forward_edges(max_tasks: u64) -> impl Strategy<Value = (u64, Vec<(u64, u64)>)> {
    (1..=max_tasks).prop_flat_map(|n| {
        let edges = proptest::collection::vec((0..n, 0..n), 0..(n as usize * 2))
            .prop_map(|pairs| {
                pairs
                    .into_iter()
                    .filter(|(a, b)| a != b)
                    .map(|(a, b)| (a.min(b), a.max(b)))
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect::<Vec<_>>()
            });
        (Just(n), edges)
    })
}

fn kind(flag: bool) -> DependencyType {
    if flag {
        DependencyType::SuccessRequired
    } else {
        DependencyType::CompletionRequired
    }
}

proptest! {
    #[test]
    fn topological_order_respects_every_edge((n, edges) in forward_edges(12)) {
        let graph = DependencyGraph::from_parts(
            (0..n).map(TaskId),
            edges.iter().map(|&(a, b)| (TaskId(a), TaskId(b), kind(a % 2 == 0))),
        ).unwrap();

        let order = graph.topological_order().unwrap();
        prop_assert_eq!(order.len() as u64, n);

        let position: HashMap<TaskId, usize> =
            order.iter().enumerate().map(|(i, t)| (*t, i)).collect();
        for &(a, b) in &edges {
            prop_assert!(position[&TaskId(a)] < position[&TaskId(b)]);
        }

        let waves = graph.waves().unwrap();
        let flattened: BTreeSet<TaskId> = waves.iter().flatten().copied().collect();
        prop_assert_eq!(flattened.len() as u64, n);
    }

    #[test]
    fn rejected_edges_leave_the_graph_unchanged(
        n in 2u64..10,
        attempts in proptest::collection::vec((0u64..10, 0u64..10, any::<bool>()), 0..40),
    ) {
        let mut graph = DependencyGraph::from_parts((0..n).map(TaskId), Vec::new()).unwrap();

        for (a, b, success) in attempts {
            let (a, b) = (TaskId(a % n), TaskId(b % n));
            let before = graph.edges();
            if graph.try_add_edge(a, b, kind(success)).is_err() {
                prop_assert_eq!(graph.edges(), before);
            }
            prop_assert!(!graph.has_cycle());
            prop_assert!(graph.topological_order().is_ok());
        }
    }

    #[test]
    fn retry_counter_is_bounded(max_retries in 0u32..6, failures in 1usize..10) {
        let mut t = task(1, "flaky");
        t.retry = RetryPolicy { max_retries, interval: Duration::from_millis(1) };
        t.begin_run().unwrap();

        let now = Utc::now();
        let mut attempts = 0;
        loop {
            t.start(now).unwrap();
            attempts += 1;
            let outcome = if attempts <= failures {
                ActionOutcome::Failed { error: "no".into() }
            } else {
                ActionOutcome::Succeeded { output: String::new() }
            };
            let transition = t.record_outcome(&outcome, now).unwrap();
            prop_assert!(t.current_retries <= max_retries);

            if transition.to != TaskStatus::Retry {
                break;
            }
            t.prepare_retry().unwrap();
        }

        let budget = max_retries.max(1) as usize;
        prop_assert!(attempts <= budget.max(failures.min(budget) + 1));
        if failures >= budget {
            prop_assert_eq!(t.status, TaskStatus::Failed);
            prop_assert_eq!(attempts, budget);
        } else {
            prop_assert_eq!(t.status, TaskStatus::Success);
            prop_assert_eq!(t.current_retries, 0);
        }
    }
}
