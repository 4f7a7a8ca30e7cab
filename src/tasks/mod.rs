//! Named units of work against one loan, and the graph that orders them.

pub mod graph;

pub use graph::{Task, TaskDefinition, TaskGraph, TaskGraphDefinition};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::core::errors::{ExternalError, ExternalErrorKind, LoanError, Result};
use crate::external::{call_with_budget, ExternalRequest, ExternalResponse, ExternalSystem, ExternalSystems};
use crate::files::LoanFileManager;

/// What every operation gets to work with
#[derive(Clone)]
pub struct TaskContext {
    pub files: Arc<LoanFileManager>,
    pub systems: ExternalSystems,
    /// Budget for each external call
    pub external_timeout: Option<Duration>,
}

impl TaskContext {
    pub fn new(files: Arc<LoanFileManager>, systems: ExternalSystems) -> Self {
        Self {
            files,
            systems,
            external_timeout: None,
        }
    }

    pub fn with_external_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.external_timeout = timeout;
        self
    }

    /// Call an outside system with no loan lock held
    pub async fn call(
        &self,
        system: &dyn ExternalSystem,
        request: &ExternalRequest,
    ) -> std::result::Result<ExternalResponse, ExternalError> {
        call_with_budget(system, request, self.external_timeout).await
    }
}

/// Result of one task run that did not hit an infrastructure error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { summary: String },
    /// A classified external failure, already recorded on the loan file
    Failed {
        kind: ExternalErrorKind,
        summary: String,
    },
}

impl TaskOutcome {
    pub fn completed(summary: impl Into<String>) -> Self {
        Self::Completed {
            summary: summary.into(),
        }
    }

    pub fn failed(kind: ExternalErrorKind, summary: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            summary: summary.into(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn summary(&self) -> &str {
        match self {
            Self::Completed { summary } | Self::Failed { summary, .. } => summary,
        }
    }

    pub fn failure_kind(&self) -> Option<ExternalErrorKind> {
        match self {
            Self::Completed { .. } => None,
            Self::Failed { kind, .. } => Some(*kind),
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { summary } => write!(f, "completed: {}", summary),
            Self::Failed { kind, summary } => write!(f, "failed ({}): {}", kind, summary),
        }
    }
}

/// A unit of work against one loan.
///
/// Implementations catch their own classified external failures and report
/// them as [`TaskOutcome::Failed`]. Only infrastructure errors come back as
/// `Err`.
#[async_trait]
pub trait Operation: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &TaskContext, entity_id: &str, params: &Value) -> Result<TaskOutcome>;
}

type BoxedRun = dyn Fn(TaskContext, String, Value) -> futures::future::BoxFuture<'static, Result<TaskOutcome>>
    + Send
    + Sync;

/// Operation backed by an async closure
pub struct FnOperation {
    name: String,
    run: Box<BoxedRun>,
}

impl FnOperation {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskContext, String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutcome>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(move |ctx, id, params| Box::pin(f(ctx, id, params))),
        }
    }
}

#[async_trait]
impl Operation for FnOperation {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &TaskContext, entity_id: &str, params: &Value) -> Result<TaskOutcome> {
        (self.run)(ctx.clone(), entity_id.to_string(), params.clone()).await
    }
}

/// Binds operation names, as used in task graph definitions, to implementations
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the operation's own name, replacing any previous entry
    pub fn register(&mut self, operation: Arc<dyn Operation>) {
        self.operations
            .insert(operation.name().to_string(), operation);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Operation>> {
        self.operations
            .get(name)
            .cloned()
            .ok_or_else(|| LoanError::UnknownOperation {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StoreConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fn_operation() {
        let dir = TempDir::new().unwrap();
        let files = LoanFileManager::new(StoreConfig::development(dir.path())).unwrap();
        let ctx = TaskContext::new(files, ExternalSystems::instant());

        let echo = FnOperation::new("echo", |_ctx, id, params| async move {
            Ok(TaskOutcome::completed(format!("{} {}", id, params["word"])))
        });
        let outcome = echo
            .run(&ctx, "LN-4001", &serde_json::json!({"word": "hello"}))
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::completed("LN-4001 \"hello\""));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = OperationRegistry::new();
        registry.register(Arc::new(FnOperation::new("noop", |_, _, _| async {
            Ok(TaskOutcome::completed("ok"))
        })));

        assert!(registry.contains("noop"));
        assert!(matches!(
            registry.get("missing"),
            Err(LoanError::UnknownOperation { .. })
        ));
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = TaskOutcome::failed(ExternalErrorKind::Timeout, "Credit bureau timeout");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["kind"], "timeout");
        assert!(!outcome.is_completed());
        assert_eq!(outcome.failure_kind(), Some(ExternalErrorKind::Timeout));
    }
}
