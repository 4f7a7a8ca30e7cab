use loanflow::tasks::FnOperation;
use loanflow::{LoanError, Operation, Task, TaskGraph, TaskOutcome};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

fn noop() -> Arc<dyn Operation> {
    Arc::new(FnOperation::new("noop", |_, _, _| async {
        Ok(TaskOutcome::completed("ok"))
    }))
}

fn task_name(i: usize) -> String {
    format!("t{:02}", i)
}

/// Task i may depend only on tasks before it, so the graph is acyclic
fn dag_strategy() -> impl Strategy<Value = (Vec<(u32, bool)>, u32)> {
    (1usize..12).prop_flat_map(|n| {
        (
            prop::collection::vec((any::<u32>(), any::<bool>()), n),
            any::<u32>(),
        )
    })
}

fn build(shape: &[(u32, bool)]) -> TaskGraph {
    let tasks = shape.iter().enumerate().map(|(i, (mask, concurrent))| {
        let deps: Vec<String> = (0..i).filter(|j| mask & (1 << j) != 0).map(task_name).collect();
        let mut task = Task::new(task_name(i), noop()).depends_on(deps);
        task.concurrent_safe = *concurrent;
        task
    });
    TaskGraph::from_tasks(tasks).unwrap()
}

proptest! {
    #[test]
    fn ready_sets_respect_dependencies((shape, completed_mask) in dag_strategy()) {
        let graph = build(&shape);
        let completed: BTreeSet<String> = (0..shape.len())
            .filter(|i| completed_mask & (1 << i) != 0)
            .map(task_name)
            .collect();

        let concurrent: BTreeSet<String> =
            graph.ready_tasks(&completed).into_iter().map(|t| t.name.clone()).collect();
        let sequential: BTreeSet<String> =
            graph.ready_sequential(&completed).into_iter().map(|t| t.name.clone()).collect();

        prop_assert!(concurrent.is_disjoint(&sequential));
        for task in graph.tasks() {
            let eligible = !completed.contains(&task.name)
                && task.dependencies.iter().all(|d| completed.contains(d));
            prop_assert_eq!(concurrent.contains(&task.name), eligible && task.concurrent_safe);
            prop_assert_eq!(sequential.contains(&task.name), eligible && !task.concurrent_safe);
        }
    }

    #[test]
    fn topological_order_puts_dependencies_first((shape, _) in dag_strategy()) {
        let graph = build(&shape);
        let order = graph.topological_order().unwrap();
        prop_assert_eq!(order.len(), graph.len());
        for task in graph.tasks() {
            let at = order.iter().position(|n| n == &task.name).unwrap();
            for dep in &task.dependencies {
                let dep_at = order.iter().position(|n| n == dep).unwrap();
                prop_assert!(dep_at < at);
            }
        }
    }

    #[test]
    fn completing_in_order_drains_the_graph((shape, _) in dag_strategy()) {
        let graph = build(&shape);
        let mut completed = BTreeSet::new();
        let mut rounds = 0;
        loop {
            let mut ready: Vec<String> =
                graph.ready_tasks(&completed).into_iter().map(|t| t.name.clone()).collect();
            if ready.is_empty() {
                ready = graph
                    .ready_sequential(&completed)
                    .into_iter()
                    .take(1)
                    .map(|t| t.name.clone())
                    .collect();
            }
            if ready.is_empty() {
                break;
            }
            completed.extend(ready);
            rounds += 1;
            prop_assert!(rounds <= graph.len());
        }
        prop_assert_eq!(completed, graph.names());
    }
}

#[test]
fn cycles_are_rejected() {
    let result = TaskGraph::from_tasks([
        Task::new("a", noop()).depends_on(["c"]),
        Task::new("b", noop()).depends_on(["a"]),
        Task::new("c", noop()).depends_on(["b"]),
    ]);
    assert!(matches!(result, Err(LoanError::CircularDependency { .. })));
}

#[test]
fn missing_dependencies_are_rejected() {
    let result = TaskGraph::from_tasks([Task::new("calculate_ratios", noop()).depends_on(["order_credit"])]);
    assert!(matches!(result, Err(LoanError::UnknownDependency { .. })));
}
