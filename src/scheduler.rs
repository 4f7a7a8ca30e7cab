use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::core::config::{ExhaustedAction, SchedulerConfig};
use crate::core::errors::{ExternalErrorKind, LoanError, Result};
use crate::tasks::{Task, TaskContext, TaskGraph, TaskOutcome};

/// Per-task results of one batch, keyed by task name
pub type BatchResults = BTreeMap<String, Result<TaskOutcome>>;

/// Runs tasks for one loan. Never retries and never touches the loan itself.
pub struct Scheduler {
    ctx: TaskContext,
    semaphore: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(ctx: TaskContext, max_parallel: usize) -> Self {
        Self {
            ctx,
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
        }
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    /// Run `tasks` concurrently and collect every outcome.
    ///
    /// A task that errors or panics is reported under its own name; its
    /// siblings keep running.
    pub async fn run_batch(&self, tasks: &[&Task], entity_id: &str) -> BatchResults {
        info!(loan = %entity_id, tasks = tasks.len(), "Starting batch");
        let started = Instant::now();

        let handles: Vec<_> = tasks
            .iter()
            .map(|task| {
                let task = (*task).clone();
                let ctx = self.ctx.clone();
                let semaphore = self.semaphore.clone();
                let entity_id = entity_id.to_string();
                let name = task.name.clone();
                let handle = tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| LoanError::internal("scheduler semaphore closed"))?;
                    let started = Instant::now();
                    let result = task.operation.run(&ctx, &entity_id, &task.params).await;
                    debug!(
                        loan = %entity_id,
                        task = %task.name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Task finished"
                    );
                    result
                });
                (name, handle)
            })
            .collect();

        let (names, handles): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
        let joined = join_all(handles).await;

        let mut results = BatchResults::new();
        for (name, joined) in names.into_iter().zip(joined) {
            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(LoanError::TaskPanicked {
                    task: name.clone(),
                    reason: panic_message(e.into_panic()),
                }),
                Err(e) => Err(LoanError::internal(format!("task {} cancelled: {}", name, e))),
            };
            match &result {
                Ok(outcome) => info!(loan = %entity_id, task = %name, "{}", outcome),
                Err(e) => warn!(loan = %entity_id, task = %name, category = e.category(), "Task error: {}", e),
            }
            results.insert(name, result);
        }

        info!(
            loan = %entity_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch finished"
        );
        results
    }

    /// Run a single task with nothing else in flight from this caller
    pub async fn run_isolated(&self, task: &Task, entity_id: &str) -> Result<TaskOutcome> {
        let mut results = self.run_batch(&[task], entity_id).await;
        results
            .remove(&task.name)
            .unwrap_or_else(|| Err(LoanError::internal(format!("no result for task {}", task.name))))
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A task that used up its attempts or failed for good
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub attempts: u32,
    pub reason: String,
    /// Classified external failure, if that is what stopped the task
    pub kind: Option<ExternalErrorKind>,
    pub retryable: bool,
}

/// One attempt of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRun {
    pub task: String,
    pub attempt: u32,
    pub succeeded: bool,
    pub summary: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowReport {
    pub entity_id: String,
    pub completed: BTreeSet<String>,
    pub failed: BTreeMap<String, TaskFailure>,
    /// Never ran because something they depend on failed
    pub blocked: BTreeSet<String>,
    pub runs: Vec<TaskRun>,
    /// Task that stopped the workflow under `ExhaustedAction::Abort`
    pub aborted_by: Option<String>,
    pub elapsed_ms: u64,
}

impl WorkflowReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty() && self.aborted_by.is_none()
    }

    pub fn attempts(&self, task: &str) -> u32 {
        self.runs.iter().filter(|r| r.task == task).count() as u32
    }

    /// `Err(WorkflowAborted)` if the run was aborted
    pub fn into_result(self) -> Result<Self> {
        match &self.aborted_by {
            Some(task) => Err(LoanError::WorkflowAborted {
                entity_id: self.entity_id.clone(),
                task: task.clone(),
                reason: self
                    .failed
                    .get(task)
                    .map(|f| f.reason.clone())
                    .unwrap_or_default(),
            }),
            None => Ok(self),
        }
    }
}

/// The outer loop: ready tasks, run, record, retry.
///
/// Concurrent-safe ready tasks run together as one batch; tasks that must
/// run alone go one at a time once no batch is ready. A task counts as done
/// only when it returns `TaskOutcome::Completed`.
pub struct WorkflowDriver {
    scheduler: Scheduler,
    config: SchedulerConfig,
}

impl WorkflowDriver {
    /// Fails with `InvalidConfiguration` if `config` does not validate
    pub fn new(ctx: TaskContext, config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let ctx = match config.external_call_timeout() {
            Some(timeout) => ctx.with_external_timeout(Some(timeout)),
            None => ctx,
        };
        Ok(Self {
            scheduler: Scheduler::new(ctx, config.max_parallel),
            config,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn run(&self, graph: &TaskGraph, entity_id: &str) -> Result<WorkflowReport> {
        graph.validate()?;
        let started = Instant::now();
        let mut report = WorkflowReport {
            entity_id: entity_id.to_string(),
            ..Default::default()
        };
        let mut attempts: BTreeMap<String, u32> = BTreeMap::new();

        info!(loan = %entity_id, tasks = graph.len(), "Workflow started");
        loop {
            let pending = |task: &&Task| !report.failed.contains_key(&task.name);
            let batch: Vec<&Task> = graph
                .ready_tasks(&report.completed)
                .into_iter()
                .filter(pending)
                .collect();

            let results = if !batch.is_empty() {
                self.scheduler.run_batch(&batch, entity_id).await
            } else if let Some(task) = graph
                .ready_sequential(&report.completed)
                .into_iter()
                .find(pending)
            {
                let mut results = BatchResults::new();
                results.insert(
                    task.name.clone(),
                    self.scheduler.run_isolated(task, entity_id).await,
                );
                results
            } else {
                break;
            };

            let mut retry_delay = Duration::ZERO;
            for (name, result) in results {
                let attempt = attempts.entry(name.clone()).or_insert(0);
                *attempt += 1;
                let attempt = *attempt;

                let (kind, reason, retryable) = match result {
                    Ok(TaskOutcome::Completed { summary }) => {
                        report.runs.push(TaskRun {
                            task: name.clone(),
                            attempt,
                            succeeded: true,
                            summary,
                        });
                        report.completed.insert(name);
                        continue;
                    }
                    Ok(TaskOutcome::Failed { kind, summary }) => {
                        (Some(kind), summary, kind.is_retryable())
                    }
                    Err(e) => (e.external_kind(), e.to_string(), e.is_retryable()),
                };
                report.runs.push(TaskRun {
                    task: name.clone(),
                    attempt,
                    succeeded: false,
                    summary: reason.clone(),
                });

                if retryable && attempt < self.config.max_attempts {
                    let delay = self.config.retry_delay(attempt);
                    info!(loan = %entity_id, task = %name, attempt, delay_ms = delay.as_millis() as u64, "Retrying task");
                    retry_delay = retry_delay.max(delay);
                    continue;
                }

                warn!(loan = %entity_id, task = %name, attempt, "Task failed: {}", reason);
                report.failed.insert(
                    name.clone(),
                    TaskFailure {
                        attempts: attempt,
                        reason,
                        kind,
                        retryable,
                    },
                );
                if self.config.on_exhausted == ExhaustedAction::Abort && report.aborted_by.is_none() {
                    report.aborted_by = Some(name);
                }
            }

            if report.aborted_by.is_some() {
                break;
            }
            if !retry_delay.is_zero() {
                tokio::time::sleep(retry_delay).await;
            }
        }

        report.blocked = graph
            .names()
            .into_iter()
            .filter(|name| !report.completed.contains(name) && !report.failed.contains_key(name))
            .collect();
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            loan = %entity_id,
            completed = report.completed.len(),
            failed = report.failed.len(),
            blocked = report.blocked.len(),
            elapsed_ms = report.elapsed_ms,
            "Workflow finished"
        );
        Ok(report)
    }
}
