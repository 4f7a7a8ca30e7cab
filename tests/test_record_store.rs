mod common;

use loanflow::record::AuditEntry;
use loanflow::store::compress;
use loanflow::{LoanError, LoanStatus, RecordStore, StoreConfig};
use pretty_assertions::assert_eq;
use std::fs;
use tempfile::TempDir;

fn store_with_cap(dir: &TempDir, cap: usize) -> RecordStore {
    let config = StoreConfig::builder()
        .base_dir(dir.path())
        .max_audit_entries(cap)
        .build()
        .unwrap();
    RecordStore::new(config).unwrap()
}

fn non_decreasing(entries: &[AuditEntry]) -> bool {
    entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp)
}

#[test]
fn test_every_overwrite_backs_up_previous_version() {
    let dir = TempDir::new().unwrap();
    let store = store_with_cap(&dir, 100);
    let mut file = common::loan_file("LN-7001");

    store.save(&mut file).unwrap();
    let mut previous_flags = Vec::new();
    for i in 0..5 {
        let before = store.backups("LN-7001").unwrap().len();
        previous_flags.push(file.flags.len());
        file.add_flag(format!("flag {}", i));
        store.save(&mut file).unwrap();
        assert_eq!(store.backups("LN-7001").unwrap().len(), before + 1);
    }

    // Backups, oldest first, hold each version that was overwritten
    let backups = store.backups("LN-7001").unwrap();
    let restored: Vec<usize> = backups
        .iter()
        .map(|path| {
            let bytes = compress::read_gz(path).unwrap();
            serde_json::from_slice::<loanflow::LoanFile>(&bytes).unwrap().flags.len()
        })
        .collect();
    assert_eq!(restored, previous_flags);
    assert_eq!(store.write_count("LN-7001"), 6);
}

#[test]
fn test_rotation_preserves_every_status_change() {
    let dir = TempDir::new().unwrap();
    let store = store_with_cap(&dir, 3);
    let mut file = common::loan_file("LN-7002");
    store.save(&mut file).unwrap();

    let path = [
        LoanStatus::DocumentsCollecting,
        LoanStatus::DocumentsComplete,
        LoanStatus::CreditOrdered,
        LoanStatus::Submitted,
        LoanStatus::ConditionsPending,
        LoanStatus::ConditionsSubmitted,
        LoanStatus::Submitted,
        LoanStatus::Approved,
        LoanStatus::ClearToClose,
    ];
    for status in path {
        file = store.load("LN-7002").unwrap();
        file.update_status(status, "underwriter", format!("to {}", status)).unwrap();
        store.save(&mut file).unwrap();

        let live = store.load("LN-7002").unwrap().audit_trail;
        assert!(live.len() <= 3);
        assert!(non_decreasing(&live));
    }

    let history = store.audit_history("LN-7002").unwrap();
    assert!(non_decreasing(&history));
    let changes: Vec<LoanStatus> = history
        .iter()
        .filter(|e| e.is_status_change())
        .filter_map(|e| e.status_after)
        .collect();
    assert_eq!(changes, path.to_vec());
    assert_eq!(history.len(), path.len() + 1);
}

#[test]
fn test_unreadable_record_is_not_replaced_by_a_default() {
    let dir = TempDir::new().unwrap();
    let store = store_with_cap(&dir, 100);
    let mut file = common::loan_file("LN-7003");
    store.save(&mut file).unwrap();

    let path = store.active_path("LN-7003");
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    match store.load("LN-7003") {
        Err(LoanError::RecordUnreadable { entity_id, path: reported, .. }) => {
            assert_eq!(entity_id, "LN-7003");
            assert_eq!(reported, path);
        }
        other => panic!("expected RecordUnreadable, got {:?}", other),
    }
}

#[test]
fn test_archived_records_still_load() {
    let dir = TempDir::new().unwrap();
    let store = store_with_cap(&dir, 100);
    let mut file = common::loan_file("LN-7004");
    file.update_status(LoanStatus::Withdrawn, "borrower", "Rate too high").unwrap();
    store.save(&mut file).unwrap();
    store.archive("LN-7004").unwrap();

    assert!(!store.active_path("LN-7004").exists());
    assert_eq!(store.load("LN-7004").unwrap(), file);

    let stats = store.storage_stats().unwrap();
    assert_eq!(stats.active_files, 0);
    assert_eq!(stats.archived_files, 1);
}

#[test]
fn test_writes_leave_no_staging_files() {
    let dir = TempDir::new().unwrap();
    let store = store_with_cap(&dir, 2);
    let mut file = common::loan_file("LN-7005");
    for i in 0..5 {
        file.add_audit_entry("system", "note", format!("{}", i));
        store.save(&mut file).unwrap();
    }

    for tier in ["active", "archive", "backups"] {
        for entry in fs::read_dir(dir.path().join(tier)).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().to_string();
            assert!(!name.starts_with(".tmp"), "staging file left in {}: {}", tier, name);
        }
    }
    assert_eq!(store.list().unwrap(), vec!["LN-7005".to_string()]);
}
