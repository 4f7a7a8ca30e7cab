use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Operation, OperationRegistry};
use crate::core::errors::{LoanError, Result};

/// A named operation plus its place in the graph
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub operation: Arc<dyn Operation>,
    pub dependencies: BTreeSet<String>,
    /// May share a batch with other ready tasks
    pub concurrent_safe: bool,
    pub estimated_duration: Duration,
    pub params: Value,
}

impl Task {
    /// Concurrent-safe task with no dependencies
    pub fn new(name: impl Into<String>, operation: Arc<dyn Operation>) -> Self {
        Self {
            name: name.into(),
            operation,
            dependencies: BTreeSet::new(),
            concurrent_safe: true,
            estimated_duration: Duration::ZERO,
            params: Value::Null,
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// Must run alone, never in a batch with other tasks
    pub fn sequential(mut self) -> Self {
        self.concurrent_safe = false;
        self
    }

    pub fn estimated(mut self, duration: Duration) -> Self {
        self.estimated_duration = duration;
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn is_ready(&self, completed: &BTreeSet<String>) -> bool {
        !completed.contains(&self.name) && self.dependencies.is_subset(completed)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("operation", &self.operation.name())
            .field("dependencies", &self.dependencies)
            .field("concurrent_safe", &self.concurrent_safe)
            .field("estimated_duration", &self.estimated_duration)
            .finish()
    }
}

/// Static description of the tasks for one workflow
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: BTreeMap<String, Task>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph and check it is well formed
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Result<Self> {
        let mut graph = Self::new();
        for task in tasks {
            graph.add(task)?;
        }
        graph.validate()?;
        Ok(graph)
    }

    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.name) {
            return Err(LoanError::configuration(format!(
                "task {} defined twice",
                task.name
            )));
        }
        self.tasks.insert(task.name.clone(), task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Task> {
        self.tasks.get(name).ok_or_else(|| LoanError::UnknownTask {
            name: name.to_string(),
        })
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.tasks.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Concurrent-safe tasks whose dependencies are all in `completed`
    /// and which are not completed themselves
    pub fn ready_tasks(&self, completed: &BTreeSet<String>) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|task| task.concurrent_safe && task.is_ready(completed))
            .collect()
    }

    /// Like [`ready_tasks`](Self::ready_tasks), for tasks that must run alone
    pub fn ready_sequential(&self, completed: &BTreeSet<String>) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|task| !task.concurrent_safe && task.is_ready(completed))
            .collect()
    }

    /// Every task that depends on `name`, directly or not
    pub fn dependents_of(&self, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![name.to_string()];
        while let Some(current) = frontier.pop() {
            for task in self.tasks.values() {
                if task.dependencies.contains(&current) && found.insert(task.name.clone()) {
                    frontier.push(task.name.clone());
                }
            }
        }
        found
    }

    /// Reject unknown dependencies and cycles
    pub fn validate(&self) -> Result<()> {
        self.topological_order().map(|_| ())
    }

    /// Task names with every task after all of its dependencies
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let indices: HashMap<&str, NodeIndex> = self
            .tasks
            .keys()
            .map(|name| (name.as_str(), graph.add_node(name.as_str())))
            .collect();

        for task in self.tasks.values() {
            for dependency in &task.dependencies {
                let from = indices.get(dependency.as_str()).ok_or_else(|| {
                    LoanError::UnknownDependency {
                        task: task.name.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                graph.add_edge(*from, indices[task.name.as_str()], ());
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| LoanError::CircularDependency {
            task: graph[cycle.node_id()].to_string(),
        })?;
        Ok(order.into_iter().map(|i| graph[i].to_string()).collect())
    }

    /// Build a graph from its YAML definition, binding operations by name
    pub fn from_yaml(yaml: &str, registry: &OperationRegistry) -> Result<Self> {
        let definition: TaskGraphDefinition = serde_yaml::from_str(yaml)?;
        definition.build(registry)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>, registry: &OperationRegistry) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| LoanError::io(format!("read task graph {}", path.display()), e))?;
        Self::from_yaml(&yaml, registry)
    }
}

/// Serialized form of a task graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGraphDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub tasks: Vec<TaskDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    /// Registered operation to run; defaults to the task name
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_concurrent_safe")]
    pub concurrent_safe: bool,
    #[serde(default)]
    pub estimated_duration_ms: u64,
    #[serde(default)]
    pub params: Value,
}

fn default_concurrent_safe() -> bool {
    true
}

impl TaskGraphDefinition {
    pub fn build(&self, registry: &OperationRegistry) -> Result<TaskGraph> {
        let mut tasks = Vec::with_capacity(self.tasks.len());
        for def in &self.tasks {
            let operation = registry.get(def.operation.as_deref().unwrap_or(&def.name))?;
            let mut task = Task::new(def.name.clone(), operation)
                .depends_on(def.dependencies.iter().cloned())
                .estimated(Duration::from_millis(def.estimated_duration_ms))
                .with_params(def.params.clone());
            task.concurrent_safe = def.concurrent_safe;
            tasks.push(task);
        }
        let graph = TaskGraph::from_tasks(tasks)?;
        debug!(
            "Loaded task graph {} with {} tasks",
            self.name.as_deref().unwrap_or("<unnamed>"),
            graph.len()
        );
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{FnOperation, TaskOutcome};

    fn noop(name: &str) -> Arc<dyn Operation> {
        Arc::new(FnOperation::new(name, |_, _, _| async {
            Ok(TaskOutcome::completed("ok"))
        }))
    }

    fn completed(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn names(tasks: Vec<&Task>) -> Vec<&str> {
        tasks.into_iter().map(|t| t.name.as_str()).collect()
    }

    fn sample_graph() -> TaskGraph {
        TaskGraph::from_tasks([
            Task::new("order_credit", noop("order_credit")),
            Task::new("verify_documents", noop("verify_documents")),
            Task::new("calculate_ratios", noop("calculate_ratios"))
                .depends_on(["order_credit"])
                .sequential(),
            Task::new("submit_to_underwriting", noop("submit_to_underwriting"))
                .depends_on(["calculate_ratios", "verify_documents"])
                .sequential(),
        ])
        .unwrap()
    }

    #[test]
    fn test_ready_sets() {
        let graph = sample_graph();

        assert_eq!(
            names(graph.ready_tasks(&completed(&[]))),
            vec!["order_credit", "verify_documents"]
        );
        assert!(graph.ready_sequential(&completed(&[])).is_empty());

        let done = completed(&["order_credit"]);
        assert_eq!(names(graph.ready_tasks(&done)), vec!["verify_documents"]);
        assert_eq!(names(graph.ready_sequential(&done)), vec!["calculate_ratios"]);

        let done = completed(&["order_credit", "verify_documents", "calculate_ratios"]);
        assert_eq!(names(graph.ready_sequential(&done)), vec!["submit_to_underwriting"]);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = TaskGraph::from_tasks([
            Task::new("calculate_ratios", noop("calculate_ratios")).depends_on(["order_credit"]),
        ])
        .unwrap_err();
        assert!(matches!(err, LoanError::UnknownDependency { .. }));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = TaskGraph::from_tasks([
            Task::new("a", noop("a")).depends_on(["c"]),
            Task::new("b", noop("b")).depends_on(["a"]),
            Task::new("c", noop("c")).depends_on(["b"]),
        ])
        .unwrap_err();
        assert!(matches!(err, LoanError::CircularDependency { .. }));
    }

    #[test]
    fn test_topological_order_and_dependents() {
        let graph = sample_graph();
        let order = graph.topological_order().unwrap();
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(position("order_credit") < position("calculate_ratios"));
        assert!(position("calculate_ratios") < position("submit_to_underwriting"));

        assert_eq!(
            graph.dependents_of("order_credit"),
            completed(&["calculate_ratios", "submit_to_underwriting"])
        );
    }

    #[test]
    fn test_from_yaml() {
        let mut registry = OperationRegistry::new();
        registry.register(noop("order_credit"));
        registry.register(noop("calculate_ratios"));

        let yaml = r#"
name: credit_only
tasks:
  - name: order_credit
    estimated_duration_ms: 1500
  - name: ratios
    operation: calculate_ratios
    dependencies: [order_credit]
    concurrent_safe: false
    params:
      actor: loan_processor
"#;
        let graph = TaskGraph::from_yaml(yaml, &registry).unwrap();
        let ratios = graph.get("ratios").unwrap();
        assert_eq!(ratios.operation.name(), "calculate_ratios");
        assert!(!ratios.concurrent_safe);
        assert_eq!(ratios.params["actor"], "loan_processor");
        assert_eq!(
            graph.get("order_credit").unwrap().estimated_duration,
            Duration::from_millis(1500)
        );

        let missing = "tasks:\n  - name: order_flood\n";
        assert!(matches!(
            TaskGraph::from_yaml(missing, &registry),
            Err(LoanError::UnknownOperation { .. })
        ));
    }
}
