use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Classified failure of a simulated external system call.
///
/// The classification decides what the caller may do next: timeouts and
/// maintenance windows are worth another attempt, invalid data is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalErrorKind {
    /// The dependency exceeded its time budget.
    Timeout,
    /// The dependency is down (maintenance window style).
    Unavailable,
    /// The request cannot succeed without new input from outside the system.
    InvalidData,
}

impl ExternalErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::InvalidData => "invalid_data",
        }
    }
}

impl fmt::Display for ExternalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised by an external system call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{system} {kind}: {message}")]
pub struct ExternalError {
    pub system: String,
    pub kind: ExternalErrorKind,
    pub message: String,
}

impl ExternalError {
    pub fn new(system: impl Into<String>, kind: ExternalErrorKind, message: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(system: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(system, ExternalErrorKind::Timeout, message)
    }

    pub fn unavailable(system: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(system, ExternalErrorKind::Unavailable, message)
    }

    pub fn invalid_data(system: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(system, ExternalErrorKind::InvalidData, message)
    }
}

/// Unified error type for the loan file store and scheduler
#[derive(Debug, Error)]
pub enum LoanError {
    // Record errors
    #[error("Loan file not found: {entity_id}")]
    RecordNotFound { entity_id: String },

    #[error("Loan file already exists: {entity_id}")]
    RecordAlreadyExists { entity_id: String },

    #[error("Loan file unreadable: {entity_id} ({path:?}): {reason}")]
    RecordUnreadable {
        entity_id: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Invalid loan number {entity_id:?}: {reason}")]
    InvalidEntityId { entity_id: String, reason: String },

    #[error("Invalid status transition for {entity_id}: {from} -> {to}")]
    InvalidTransition {
        entity_id: String,
        from: String,
        to: String,
    },

    #[error("Duplicate document id {document_id} in loan file {entity_id}")]
    DuplicateDocument { entity_id: String, document_id: String },

    #[error("Duplicate condition id {condition_id} in loan file {entity_id}")]
    DuplicateCondition { entity_id: String, condition_id: String },

    #[error("Unrecognized document type: {0}")]
    UnrecognizedDocumentType(String),

    #[error("Loan file {entity_id} still has {open} open condition(s)")]
    OpenConditions { entity_id: String, open: usize },

    // External call errors
    #[error("External call failed: {0}")]
    External(#[from] ExternalError),

    // Infrastructure errors
    #[error("Timed out after {waited:?} waiting for lock on {entity_id}")]
    LockTimeout { entity_id: String, waited: Duration },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // Task graph errors
    #[error("Unknown task: {name}")]
    UnknownTask { name: String },

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Circular dependency detected at task {task}")]
    CircularDependency { task: String },

    #[error("Unknown operation: {name}")]
    UnknownOperation { name: String },

    // Scheduler errors
    #[error("Task {task} panicked: {reason}")]
    TaskPanicked { task: String, reason: String },

    #[error("Workflow aborted for {entity_id}: task {task} failed - {reason}")]
    WorkflowAborted {
        entity_id: String,
        task: String,
        reason: String,
    },

    // Configuration errors
    #[error("Configuration invalid: {0}")]
    InvalidConfiguration(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LoanError {
    pub fn not_found(entity_id: impl Into<String>) -> Self {
        Self::RecordNotFound {
            entity_id: entity_id.into(),
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// The classified external failure carried by this error, if any
    pub fn external_kind(&self) -> Option<ExternalErrorKind> {
        match self {
            Self::External(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Check if the outer driver may retry the task that produced this error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::External(e) => e.kind.is_retryable(),
            Self::LockTimeout { .. } | Self::Io { .. } => true,

            // Fatal for the entity or the task
            Self::RecordNotFound { .. }
            | Self::RecordUnreadable { .. }
            | Self::Serialization { .. }
            | Self::InvalidEntityId { .. }
            | Self::InvalidTransition { .. }
            | Self::DuplicateDocument { .. }
            | Self::DuplicateCondition { .. }
            | Self::UnrecognizedDocumentType(_)
            | Self::OpenConditions { .. }
            | Self::InvalidConfiguration(_) => false,

            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::RecordNotFound { .. }
            | Self::RecordAlreadyExists { .. }
            | Self::RecordUnreadable { .. } => "record",
            Self::InvalidEntityId { .. }
            | Self::InvalidTransition { .. }
            | Self::DuplicateDocument { .. }
            | Self::DuplicateCondition { .. }
            | Self::UnrecognizedDocumentType(_)
            | Self::OpenConditions { .. } => "validation",
            Self::External(_) => "external",
            Self::LockTimeout { .. } => "concurrency",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::UnknownTask { .. }
            | Self::UnknownDependency { .. }
            | Self::CircularDependency { .. }
            | Self::UnknownOperation { .. } => "graph",
            Self::TaskPanicked { .. } | Self::WorkflowAborted { .. } => "scheduler",
            Self::InvalidConfiguration(_) => "configuration",
            Self::Internal(_) | Self::Other(_) => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, LoanError>;

impl From<std::io::Error> for LoanError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for LoanError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for LoanError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_classification() {
        assert!(ExternalErrorKind::Timeout.is_retryable());
        assert!(ExternalErrorKind::Unavailable.is_retryable());
        assert!(!ExternalErrorKind::InvalidData.is_retryable());
        assert_eq!(ExternalErrorKind::InvalidData.as_str(), "invalid_data");
    }

    #[test]
    fn test_error_retryable() {
        let timeout: LoanError = ExternalError::timeout("credit_bureau", "no answer").into();
        assert!(timeout.is_retryable());
        assert_eq!(timeout.external_kind(), Some(ExternalErrorKind::Timeout));

        let invalid: LoanError = ExternalError::invalid_data("credit_bureau", "thin file").into();
        assert!(!invalid.is_retryable());

        assert!(!LoanError::not_found("LN-1").is_retryable());
        let unreadable = LoanError::RecordUnreadable {
            entity_id: "LN-1".into(),
            path: PathBuf::from("active/LN-1.json"),
            reason: "truncated".into(),
        };
        assert!(!unreadable.is_retryable());
        assert_eq!(unreadable.category(), "record");
    }

    #[test]
    fn test_error_display() {
        let err: LoanError = ExternalError::unavailable("flood_service", "maintenance 2AM-4AM").into();
        let display = err.to_string();
        assert!(display.contains("flood_service"));
        assert!(display.contains("unavailable"));
        assert!(display.contains("maintenance"));
    }

    #[test]
    fn test_from_io() {
        let err: LoanError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert_eq!(err.category(), "io");
        assert!(err.is_retryable());
    }
}
