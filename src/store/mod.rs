//! Durable loan file storage.
//!
//! Layout under `base_dir`:
//!
//! ```text
//! active/{id}.json                          live record, pretty JSON
//! archive/{id}.json.gz                      record of a closed loan
//! archive/{id}_audit_archive.json.gz        audit entries rotated out of the live trail
//! backups/{id}_backup_YYYYMMDD_HHMMSS.json.gz
//! ```
//!
//! The store does no locking of its own. Callers serialize access per loan
//! through [`crate::guard::LockTable`].

pub mod compress;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::core::config::StoreConfig;
use crate::core::errors::{LoanError, Result};
use crate::record::{AuditEntry, LoanFile};

const ACTIVE_DIR: &str = "active";
const ARCHIVE_DIR: &str = "archive";
const BACKUP_DIR: &str = "backups";
const AUDIT_ARCHIVE_SUFFIX: &str = "_audit_archive.json.gz";

/// Point-in-time view of the storage tiers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub active_files: usize,
    pub archived_files: usize,
    pub audit_archives: usize,
    pub backup_files: usize,
    pub active_bytes: u64,
    pub archive_bytes: u64,
    pub backup_bytes: u64,
    pub total_bytes: u64,
    /// Saves performed by this store instance
    pub total_writes: u64,
}

/// Outcome of one housekeeping sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub purged_backups: usize,
    pub total_bytes: u64,
    pub over_limit: bool,
}

pub struct RecordStore {
    config: StoreConfig,
    active_dir: PathBuf,
    archive_dir: PathBuf,
    backup_dir: PathBuf,
    write_counts: DashMap<String, u64>,
    /// Unix millis of the last housekeeping sweep
    last_housekeeping: AtomicI64,
}

impl RecordStore {
    /// Validate the configuration and create the tier directories
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let active_dir = config.base_dir.join(ACTIVE_DIR);
        let archive_dir = config.base_dir.join(ARCHIVE_DIR);
        let backup_dir = config.base_dir.join(BACKUP_DIR);
        for dir in [&active_dir, &archive_dir, &backup_dir] {
            fs::create_dir_all(dir)
                .map_err(|e| LoanError::io(format!("create directory {}", dir.display()), e))?;
        }

        info!("Record store ready at {}", config.base_dir.display());
        Ok(Self {
            config,
            active_dir,
            archive_dir,
            backup_dir,
            write_counts: DashMap::new(),
            last_housekeeping: AtomicI64::new(Utc::now().timestamp_millis()),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn active_path(&self, entity_id: &str) -> PathBuf {
        self.active_dir.join(format!("{}.json", entity_id))
    }

    pub fn archive_path(&self, entity_id: &str) -> PathBuf {
        self.archive_dir.join(format!("{}.json.gz", entity_id))
    }

    pub fn audit_archive_path(&self, entity_id: &str) -> PathBuf {
        self.archive_dir
            .join(format!("{}{}", entity_id, AUDIT_ARCHIVE_SUFFIX))
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn exists(&self, entity_id: &str) -> bool {
        self.active_path(entity_id).exists() || self.archive_path(entity_id).exists()
    }

    /// Load a record from the active tier, falling back to the archive tier
    pub fn load(&self, entity_id: &str) -> Result<LoanFile> {
        validate_entity_id(entity_id)?;

        let active = self.active_path(entity_id);
        match fs::read(&active) {
            Ok(bytes) => return parse_record(entity_id, &active, &bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(unreadable(entity_id, &active, e)),
        }

        let archived = self.archive_path(entity_id);
        match compress::read_gz(&archived) {
            Ok(bytes) => {
                debug!("Loan {} loaded from archive tier", entity_id);
                parse_record(entity_id, &archived, &bytes)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(LoanError::not_found(entity_id)),
            Err(e) => Err(unreadable(entity_id, &archived, e)),
        }
    }

    /// Persist `file` to the active tier.
    ///
    /// Backs up the previous version, rotates audit overflow into the
    /// audit archive, then replaces the active file atomically. Rotation
    /// trims `file.audit_trail` in place.
    pub fn save(&self, file: &mut LoanFile) -> Result<PathBuf> {
        let entity_id = file.loan_number.clone();
        validate_entity_id(&entity_id)?;
        let target = self.active_path(&entity_id);

        if target.exists() {
            self.create_backup(&entity_id)?;
        }
        self.rotate_audit_trail(file)?;

        let bytes = serde_json::to_vec_pretty(&*file)?;
        compress::write_atomic(&target, &bytes)
            .map_err(|e| LoanError::io(format!("write {}", target.display()), e))?;

        let count = {
            let mut entry = self.write_counts.entry(entity_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        info!(
            loan = %entity_id,
            write = count,
            path = %target.display(),
            "Saved loan file"
        );

        let size = bytes.len() as u64;
        if size > self.config.max_file_size_bytes {
            warn!(
                loan = %entity_id,
                size_bytes = size,
                limit_bytes = self.config.max_file_size_bytes,
                "Loan file exceeds size threshold"
            );
        }

        self.maybe_housekeeping();
        Ok(target)
    }

    /// Compressed, timestamped copy of the current active file
    pub fn create_backup(&self, entity_id: &str) -> Result<PathBuf> {
        validate_entity_id(entity_id)?;
        let source = self.active_path(entity_id);
        let stem = format!("{}_backup_{}", entity_id, Utc::now().format("%Y%m%d_%H%M%S"));
        let backup = compress::gzip_copy_new(&source, &self.backup_dir, &stem).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                LoanError::not_found(entity_id)
            } else {
                LoanError::io(format!("back up {}", source.display()), e)
            }
        })?;
        debug!("Backed up loan {} to {}", entity_id, backup.display());
        Ok(backup)
    }

    /// Backup files of one loan, oldest first
    pub fn backups(&self, entity_id: &str) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}_backup_", entity_id);
        let mut found: Vec<PathBuf> = self
            .dir_entries(&self.backup_dir)?
            .into_iter()
            .filter(|path| file_name(path).is_some_and(|name| name.starts_with(&prefix)))
            .collect();
        found.sort_by_key(|path| backup_sort_key(path));
        Ok(found)
    }

    // Overflow goes to the audit archive before it leaves the live trail.
    // Entries already present in the archive tail (left behind by a save
    // that failed after rotating) are not appended twice.
    fn rotate_audit_trail(&self, file: &mut LoanFile) -> Result<()> {
        let max = self.config.max_audit_entries;
        if file.audit_trail.len() <= max {
            return Ok(());
        }
        let overflow = file.audit_trail.len() - max;
        let entity_id = file.loan_number.clone();

        let mut archived = self.archived_audit_entries(&entity_id)?;
        let before = archived.len();
        let last_archived = archived.last().map(|e| e.timestamp);
        let last_sequence = archived.iter().map(|e| e.sequence).max().unwrap_or(0);
        for entry in &file.audit_trail[..overflow] {
            if already_archived(&archived[..before], last_archived, last_sequence, entry) {
                continue;
            }
            archived.push(entry.clone());
        }

        if archived.len() > before {
            let path = self.audit_archive_path(&entity_id);
            let bytes = serde_json::to_vec(&archived)?;
            compress::write_gz_atomic(&path, &bytes)
                .map_err(|e| LoanError::io(format!("write {}", path.display()), e))?;
        }
        file.audit_trail.drain(..overflow);

        info!(
            loan = %entity_id,
            rotated = overflow,
            archived_total = archived.len(),
            "Rotated audit entries into archive"
        );
        Ok(())
    }

    /// Audit entries rotated out of the live trail, oldest first
    pub fn archived_audit_entries(&self, entity_id: &str) -> Result<Vec<AuditEntry>> {
        validate_entity_id(entity_id)?;
        let path = self.audit_archive_path(entity_id);
        match compress::read_gz(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| unreadable(entity_id, &path, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(unreadable(entity_id, &path, e)),
        }
    }

    /// Archived audit entries followed by the live trail
    pub fn audit_history(&self, entity_id: &str) -> Result<Vec<AuditEntry>> {
        let mut history = self.archived_audit_entries(entity_id)?;
        history.extend(self.load(entity_id)?.audit_trail);
        Ok(history)
    }

    /// Move a loan from the active tier to the archive tier
    pub fn archive(&self, entity_id: &str) -> Result<PathBuf> {
        validate_entity_id(entity_id)?;
        let active = self.active_path(entity_id);
        let target = self.archive_path(entity_id);

        let bytes = match fs::read(&active) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return if target.exists() {
                    Ok(target)
                } else {
                    Err(LoanError::not_found(entity_id))
                };
            }
            Err(e) => return Err(unreadable(entity_id, &active, e)),
        };
        // Refuse to archive something that would not load back
        parse_record(entity_id, &active, &bytes)?;

        compress::write_gz_atomic(&target, &bytes)
            .map_err(|e| LoanError::io(format!("write {}", target.display()), e))?;
        fs::remove_file(&active)
            .map_err(|e| LoanError::io(format!("remove {}", active.display()), e))?;

        info!("Archived loan {} to {}", entity_id, target.display());
        Ok(target)
    }

    /// Loan numbers in the active tier, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .dir_entries(&self.active_dir)?
            .iter()
            .filter_map(|path| file_name(path)?.strip_suffix(".json").map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Loan numbers in the archive tier, sorted
    pub fn list_archived(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .dir_entries(&self.archive_dir)?
            .iter()
            .filter_map(|path| {
                let name = file_name(path)?;
                if name.ends_with(AUDIT_ARCHIVE_SUFFIX) {
                    return None;
                }
                name.strip_suffix(".json.gz").map(str::to_string)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn storage_stats(&self) -> Result<StorageStats> {
        let mut stats = StorageStats {
            total_writes: self.write_counts.iter().map(|e| *e.value()).sum(),
            ..Default::default()
        };

        for path in self.dir_entries(&self.active_dir)? {
            stats.active_files += 1;
            stats.active_bytes += file_size(&path);
        }
        for path in self.dir_entries(&self.archive_dir)? {
            if file_name(&path).is_some_and(|n| n.ends_with(AUDIT_ARCHIVE_SUFFIX)) {
                stats.audit_archives += 1;
            } else {
                stats.archived_files += 1;
            }
            stats.archive_bytes += file_size(&path);
        }
        for path in self.dir_entries(&self.backup_dir)? {
            stats.backup_files += 1;
            stats.backup_bytes += file_size(&path);
        }
        stats.total_bytes = stats.active_bytes + stats.archive_bytes + stats.backup_bytes;
        Ok(stats)
    }

    /// Saves performed for one loan by this store instance
    pub fn write_count(&self, entity_id: &str) -> u64 {
        self.write_counts.get(entity_id).map(|c| *c).unwrap_or(0)
    }

    pub fn write_counts(&self) -> BTreeMap<String, u64> {
        self.write_counts
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Delete backups older than the retention period
    pub fn purge_old_backups(&self) -> Result<usize> {
        let retention = self.config.backup_retention();
        let now = SystemTime::now();
        let mut purged = 0;

        for path in self.dir_entries(&self.backup_dir)? {
            let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!("Cannot stat backup {}: {}", path.display(), e);
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age > retention {
                match fs::remove_file(&path) {
                    Ok(()) => purged += 1,
                    Err(e) => warn!("Cannot remove backup {}: {}", path.display(), e),
                }
            }
        }

        if purged > 0 {
            info!("Purged {} backups older than {} days", purged, self.config.backup_retention_days);
        }
        Ok(purged)
    }

    /// Purge old backups and check total storage against its threshold
    pub fn run_housekeeping(&self) -> Result<HousekeepingReport> {
        let purged_backups = self.purge_old_backups()?;
        let stats = self.storage_stats()?;
        let over_limit = stats.total_bytes > self.config.max_total_storage_bytes;
        if over_limit {
            warn!(
                total_bytes = stats.total_bytes,
                limit_bytes = self.config.max_total_storage_bytes,
                "Loan file storage exceeds threshold"
            );
        }
        self.last_housekeeping
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        Ok(HousekeepingReport {
            purged_backups,
            total_bytes: stats.total_bytes,
            over_limit,
        })
    }

    /// When housekeeping last ran
    pub fn last_housekeeping(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.last_housekeeping.load(Ordering::Acquire))
    }

    // At most one sweep per interval, whichever save gets there first
    fn maybe_housekeeping(&self) {
        let now = Utc::now().timestamp_millis();
        let last = self.last_housekeeping.load(Ordering::Acquire);
        let interval = self.config.housekeeping_interval().as_millis() as i64;
        if now.saturating_sub(last) < interval {
            return;
        }
        if self
            .last_housekeeping
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Err(e) = self.run_housekeeping() {
            warn!("Housekeeping failed: {}", e);
        }
    }

    fn dir_entries(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(dir)
            .map_err(|e| LoanError::io(format!("list {}", dir.display()), e))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| LoanError::io(format!("list {}", dir.display()), e))?;
            let path = entry.path();
            if path.is_file() && !is_staging_file(&path) {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

/// Loan numbers become file names, so they must not escape the tier directory
pub fn validate_entity_id(entity_id: &str) -> Result<()> {
    let reason = if entity_id.trim().is_empty() {
        Some("must not be empty")
    } else if entity_id.contains(['/', '\\', '\0']) {
        Some("must not contain path separators")
    } else if entity_id.starts_with('.') {
        Some("must not start with '.'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(LoanError::InvalidEntityId {
            entity_id: entity_id.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

fn parse_record(entity_id: &str, path: &Path, bytes: &[u8]) -> Result<LoanFile> {
    let file: LoanFile = serde_json::from_slice(bytes).map_err(|e| unreadable(entity_id, path, e))?;
    if file.loan_number != entity_id {
        return Err(LoanError::RecordUnreadable {
            entity_id: entity_id.to_string(),
            path: path.to_path_buf(),
            reason: format!("file holds loan {}", file.loan_number),
        });
    }
    Ok(file)
}

fn unreadable(entity_id: &str, path: &Path, reason: impl std::fmt::Display) -> LoanError {
    LoanError::RecordUnreadable {
        entity_id: entity_id.to_string(),
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

// Sequenced entries compare by sequence alone. Unsequenced ones fall back to
// timestamp and content, which cannot tell identical entries apart.
fn already_archived(
    archived: &[AuditEntry],
    last_archived: Option<DateTime<Utc>>,
    last_sequence: u64,
    entry: &AuditEntry,
) -> bool {
    if entry.sequence > 0 {
        return entry.sequence <= last_sequence;
    }
    match last_archived {
        None => false,
        Some(last) if entry.timestamp < last => true,
        Some(last) if entry.timestamp == last => archived
            .iter()
            .rev()
            .take_while(|a| a.timestamp == last)
            .any(|a| a == entry),
        Some(_) => false,
    }
}

// "{id}_backup_{stamp}[-{n}].json.gz" ordered by stamp, then collision suffix
fn backup_sort_key(path: &Path) -> (String, u32) {
    let stem = file_name(path)
        .and_then(|n| n.strip_suffix(".json.gz"))
        .and_then(|n| n.rsplit_once("_backup_").map(|(_, stamp)| stamp))
        .unwrap_or_default();
    match stem.split_once('-') {
        Some((stamp, n)) => (stamp.to_string(), n.parse().unwrap_or(0)),
        None => (stem.to_string(), 0),
    }
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name()?.to_str()
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

// NamedTempFile stages writes as ".tmpXXXX" in the target directory
fn is_staging_file(path: &Path) -> bool {
    file_name(path).is_some_and(|n| n.starts_with(".tmp"))
}
