use std::sync::Arc;
use tracing::{info, warn};

use crate::core::config::StoreConfig;
use crate::core::errors::{ExternalError, LoanError, Result};
use crate::guard::LockTable;
use crate::record::LoanFile;
use crate::store::RecordStore;

/// The store and its lock table, shared by every task of the process.
///
/// Build one at startup and hand clones of the `Arc` to whoever needs it.
/// All reads and writes of a loan go through the per-loan lock:
///
/// ```text
/// snapshot(id)        lock, load, unlock
/// <external call>     no lock held
/// update(id, f)       lock, reload, f(&mut file), save, unlock
/// ```
pub struct LoanFileManager {
    store: RecordStore,
    locks: LockTable,
}

impl LoanFileManager {
    pub fn new(config: StoreConfig) -> Result<Arc<Self>> {
        let locks = LockTable::with_timeout(config.lock_timeout());
        let store = RecordStore::new(config)?;
        Ok(Arc::new(Self { store, locks }))
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Persist a brand new loan file
    pub async fn create(&self, mut file: LoanFile) -> Result<LoanFile> {
        let entity_id = file.loan_number.clone();
        self.locks
            .with_lock(&entity_id, || async {
                if self.store.exists(&entity_id) {
                    return Err(LoanError::RecordAlreadyExists {
                        entity_id: entity_id.clone(),
                    });
                }
                self.store.save(&mut file)?;
                info!(loan = %entity_id, "Created loan file");
                Ok(file)
            })
            .await
    }

    /// Current record, read under the lock and released before returning
    pub async fn snapshot(&self, entity_id: &str) -> Result<LoanFile> {
        self.locks
            .with_lock(entity_id, || async { self.store.load(entity_id) })
            .await
    }

    /// Reload, mutate and save `entity_id` as one critical section.
    ///
    /// `mutate` always sees the latest saved record. If it fails, nothing
    /// is written.
    pub async fn update<T, F>(&self, entity_id: &str, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut LoanFile) -> Result<T>,
    {
        self.locks
            .with_lock(entity_id, || async {
                let mut file = self.store.load(entity_id)?;
                let value = mutate(&mut file)?;
                self.store.save(&mut file)?;
                Ok(value)
            })
            .await
    }

    /// Record a classified external failure as an audit entry and a flag
    pub async fn record_failure(&self, entity_id: &str, actor: &str, action: &str, error: &ExternalError) -> Result<()> {
        warn!(loan = %entity_id, action, kind = %error.kind, "{}", error.message);
        self.update(entity_id, |file| {
            file.record_external_failure(actor, action, error);
            Ok(())
        })
        .await
    }

    /// Move the loan to the archive tier if it has reached a terminal status.
    /// Returns whether it was archived.
    pub async fn archive_if_terminal(&self, entity_id: &str) -> Result<bool> {
        self.locks
            .with_lock(entity_id, || async {
                let file = self.store.load(entity_id)?;
                if !file.status.is_terminal() {
                    return Ok(false);
                }
                self.store.archive(entity_id)?;
                Ok(true)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::sample_loan_file;
    use crate::record::LoanStatus;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> Arc<LoanFileManager> {
        LoanFileManager::new(StoreConfig::development(dir.path())).unwrap()
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let files = manager(&dir);
        files.create(sample_loan_file("LN-2001")).await.unwrap();

        let err = files.create(sample_loan_file("LN-2001")).await.unwrap_err();
        assert!(matches!(err, LoanError::RecordAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_failed_mutation_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let files = manager(&dir);
        files.create(sample_loan_file("LN-2002")).await.unwrap();

        let result: Result<()> = files
            .update("LN-2002", |file| {
                file.add_flag("never saved");
                Err(LoanError::internal("rejected"))
            })
            .await;
        assert!(result.is_err());

        let file = files.snapshot("LN-2002").await.unwrap();
        assert!(file.flags.is_empty());
        assert_eq!(files.store().write_count("LN-2002"), 1);
    }

    #[tokio::test]
    async fn test_record_failure() {
        let dir = TempDir::new().unwrap();
        let files = manager(&dir);
        files.create(sample_loan_file("LN-2003")).await.unwrap();

        let error = ExternalError::timeout("credit_bureau", "Credit bureau timeout");
        files
            .record_failure("LN-2003", "loan_processor", "credit_order", &error)
            .await
            .unwrap();

        let file = files.snapshot("LN-2003").await.unwrap();
        let entry = file.audit_trail.last().unwrap();
        assert_eq!(entry.action, "credit_order_failed");
        assert_eq!(entry.metadata["error_kind"], serde_json::json!("timeout"));
        assert_eq!(file.status, LoanStatus::Received);
    }

    #[tokio::test]
    async fn test_archive_if_terminal() {
        let dir = TempDir::new().unwrap();
        let files = manager(&dir);
        files.create(sample_loan_file("LN-2004")).await.unwrap();
        assert!(!files.archive_if_terminal("LN-2004").await.unwrap());

        files
            .update("LN-2004", |file| {
                file.update_status(LoanStatus::Withdrawn, "borrower", "Borrower withdrew")
            })
            .await
            .unwrap();
        assert!(files.archive_if_terminal("LN-2004").await.unwrap());
        assert_eq!(files.store().list_archived().unwrap(), vec!["LN-2004".to_string()]);
        assert_eq!(files.snapshot("LN-2004").await.unwrap().status, LoanStatus::Withdrawn);
    }
}
