// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod telemetry;
}

// Loan file model and its persistence
pub mod record;
pub mod store;
pub mod guard;
pub mod files;

// Work against a loan: outside systems, task graph, scheduling
pub mod external;
pub mod tasks;
pub mod scheduler;
pub mod operations;

// Re-exports for convenience
pub use core::config::{ExhaustedAction, LoanflowConfig, SchedulerConfig, StoreConfig};
pub use core::errors::{ExternalError, ExternalErrorKind, LoanError, Result};
pub use core::telemetry::{init_tracing, try_init_tracing};
pub use external::{ExternalSystem, ExternalSystems, SimulatedSystem};
pub use files::LoanFileManager;
pub use guard::LockTable;
pub use operations::{closing_graph, loan_operations, loan_processing_graph, underwriting_graph};
pub use record::{Document, DocumentType, LoanFile, LoanStatus};
pub use scheduler::{Scheduler, WorkflowDriver, WorkflowReport};
pub use store::{RecordStore, StorageStats};
pub use tasks::{Operation, OperationRegistry, Task, TaskContext, TaskGraph, TaskOutcome};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::sample_loan_file;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_full_workflow() {
        try_init_tracing(tracing::Level::WARN);
        let dir = TempDir::new().unwrap();
        let files = LoanFileManager::new(StoreConfig::development(dir.path())).unwrap();
        files.create(sample_loan_file("LN-0100")).await.unwrap();

        let ctx = TaskContext::new(files.clone(), ExternalSystems::instant());
        let driver = WorkflowDriver::new(ctx, SchedulerConfig::default()).unwrap();
        let graph = loan_processing_graph().unwrap();

        let report = driver.run(&graph, "LN-0100").await.unwrap();
        assert!(report.is_success(), "{:?}", report);
        assert_eq!(report.completed.len(), 7);

        let file = files.snapshot("LN-0100").await.unwrap();
        assert_eq!(file.status, LoanStatus::Submitted);
        assert_eq!(file.documents.len(), 5);
        assert!(file.financial_metrics.dti_ratio.is_some());
    }
}
