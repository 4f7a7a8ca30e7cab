use crate::core::errors::{LoanError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What the workflow driver does once a task has used up its attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedAction {
    /// Record the failure and keep running whatever does not depend on it
    Skip,
    /// Stop the workflow for this loan
    Abort,
}

/// Record store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory holding the active, archive and backup tiers
    pub base_dir: PathBuf,
    /// Audit entries kept in the live trail before rotation into the archive
    pub max_audit_entries: usize,
    /// Single-file size that triggers a warning
    pub max_file_size_bytes: u64,
    /// Total storage size that triggers a warning
    pub max_total_storage_bytes: u64,
    /// Backups older than this are purged by housekeeping
    pub backup_retention_days: u32,
    /// Minimum time between two housekeeping sweeps
    pub housekeeping_interval_secs: u64,
    /// Give up waiting for a per-loan lock after this long (None = wait forever)
    pub lock_timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./loan_files"),
            max_audit_entries: 100,
            max_file_size_bytes: 10 * 1024 * 1024,            // 10MB
            max_total_storage_bytes: 5 * 1024 * 1024 * 1024, // 5GB
            backup_retention_days: 30,
            housekeeping_interval_secs: 3600,
            lock_timeout_ms: None,
        }
    }
}

impl StoreConfig {
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::new()
    }

    /// Small thresholds and frequent housekeeping, for local runs
    pub fn development(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_audit_entries: 20,
            max_file_size_bytes: 256 * 1024,
            max_total_storage_bytes: 64 * 1024 * 1024,
            backup_retention_days: 1,
            housekeeping_interval_secs: 60,
            lock_timeout_ms: Some(30_000),
        }
    }

    pub fn backup_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.backup_retention_days) * 24 * 60 * 60)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(LoanError::configuration("base_dir cannot be empty"));
        }
        if self.max_audit_entries == 0 {
            return Err(LoanError::configuration(
                "max_audit_entries must be greater than 0",
            ));
        }
        if self.max_file_size_bytes == 0 {
            return Err(LoanError::configuration(
                "max_file_size_bytes must be greater than 0",
            ));
        }
        if self.max_total_storage_bytes < self.max_file_size_bytes {
            return Err(LoanError::configuration(
                "max_total_storage_bytes cannot be smaller than max_file_size_bytes",
            ));
        }
        if self.lock_timeout_ms == Some(0) {
            return Err(LoanError::configuration("lock_timeout_ms must be greater than 0"));
        }
        Ok(())
    }
}

/// Scheduler and workflow driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of tasks of one batch running at the same time
    pub max_parallel: usize,
    /// Attempts per task, first run included
    pub max_attempts: u32,
    /// Delay before a retry, multiplied by the attempt number
    pub retry_base_delay_ms: u64,
    pub on_exhausted: ExhaustedAction,
    /// Budget applied to every external call (None = the simulator's own latency)
    pub external_call_timeout_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 16,
            max_attempts: 3,
            retry_base_delay_ms: 500,
            on_exhausted: ExhaustedAction::Skip,
            external_call_timeout_ms: None,
        }
    }
}

impl SchedulerConfig {
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn external_call_timeout(&self) -> Option<Duration> {
        self.external_call_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(LoanError::configuration("max_parallel must be greater than 0"));
        }
        if self.max_attempts == 0 {
            return Err(LoanError::configuration("max_attempts must be greater than 0"));
        }
        if self.external_call_timeout_ms == Some(0) {
            return Err(LoanError::configuration(
                "external_call_timeout_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Top-level configuration, loadable from YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoanflowConfig {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
}

impl LoanflowConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| LoanError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.scheduler.validate()
    }
}

/// Builder for StoreConfig
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: StoreConfig::default(),
        }
    }

    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.base_dir = dir.into();
        self
    }

    pub fn max_audit_entries(mut self, max: usize) -> Self {
        self.config.max_audit_entries = max;
        self
    }

    pub fn size_limits(mut self, max_file_bytes: u64, max_total_bytes: u64) -> Self {
        self.config.max_file_size_bytes = max_file_bytes;
        self.config.max_total_storage_bytes = max_total_bytes;
        self
    }

    pub fn backup_retention_days(mut self, days: u32) -> Self {
        self.config.backup_retention_days = days;
        self
    }

    pub fn housekeeping_interval(mut self, interval: Duration) -> Self {
        self.config.housekeeping_interval_secs = interval.as_secs();
        self
    }

    pub fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.lock_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<StoreConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for StoreConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
