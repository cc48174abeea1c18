use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::backup::Backup;
use rusqlite::Connection;
use serde::Serialize;

use crate::error::SchemaGuardError;

const BACKUP_PREFIX: &str = "backup_";
const BACKUP_EXTENSION: &str = "db";
const PAGES_PER_STEP: i32 = 256;
const STEP_PAUSE: Duration = Duration::from_millis(0);

/// Reference to a database snapshot on disk. Records keep the path, never the content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRef {
    path: PathBuf,
    created_at: i64,
    size_bytes: u64,
}

impl BackupRef {
    pub fn from_path(path: &Path) -> Result<Self, SchemaGuardError> {
        let metadata = fs::metadata(path).map_err(|_| SchemaGuardError::BackupMissing {
            path: path.to_path_buf(),
        })?;
        let created_at = metadata
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp())
            .unwrap_or_default();

        Ok(BackupRef {
            path: path.to_path_buf(),
            created_at,
            size_bytes: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_string(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

/// Snapshots the database before a batch and restores it as a last resort.
///
/// Uses the SQLite online backup API rather than copying files so the snapshot is
/// consistent even with WAL enabled or an in-memory database.
#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
    enabled: bool,
    retention_days: u32,
    auto_cleanup: bool,
}

impl BackupManager {
    pub fn new<P: Into<PathBuf>>(dir: P, enabled: bool, retention_days: u32, auto_cleanup: bool) -> Self {
        BackupManager {
            dir: dir.into(),
            enabled,
            retention_days,
            auto_cleanup,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    pub fn auto_cleanup(&self) -> bool {
        self.auto_cleanup
    }

    pub fn create_backup(&self, conn: &Connection) -> Result<BackupRef, SchemaGuardError> {
        fs::create_dir_all(&self.dir)?;

        let path = self.next_backup_path();
        {
            let mut dst = Connection::open(&path)?;
            let backup = Backup::new(conn, &mut dst)?;
            backup.run_to_completion(PAGES_PER_STEP, STEP_PAUSE, None)?;
        }
        info!("Created backup at: {}", path.display());

        if self.auto_cleanup {
            if let Err(e) = self.prune() {
                warn!("Backup cleanup failed: {}", e);
            }
        }

        BackupRef::from_path(&path)
    }

    /// Overwrite the live database with the snapshot. Everything is rewound, including the
    /// migration history, so callers must re-record anything they want to keep.
    pub fn restore(conn: &mut Connection, backup: &BackupRef) -> Result<(), SchemaGuardError> {
        if !backup.path().is_file() {
            return Err(SchemaGuardError::BackupMissing {
                path: backup.path().to_path_buf(),
            });
        }

        info!("Restoring database from backup: {}", backup.path().display());
        let src = Connection::open(backup.path())?;
        let restore = Backup::new(&src, conn)?;
        restore.run_to_completion(PAGES_PER_STEP, STEP_PAUSE, None)?;

        Ok(())
    }

    /// Backups in this manager's directory, oldest first.
    pub fn list(&self) -> Result<Vec<BackupRef>, SchemaGuardError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if Self::is_backup_file(&path) {
                backups.push(BackupRef::from_path(&path)?);
            }
        }

        // Names embed the timestamp, so name order is creation order
        backups.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(backups)
    }

    pub fn latest(&self) -> Result<Option<BackupRef>, SchemaGuardError> {
        Ok(self.list()?.pop())
    }

    /// Delete backups older than the retention window. The newest backup is always kept.
    pub fn prune(&self) -> Result<Vec<PathBuf>, SchemaGuardError> {
        let retention = Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60);
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .map(|t| DateTime::<Utc>::from(t).timestamp())
            .unwrap_or(i64::MIN);

        let mut backups = self.list()?;
        backups.pop();

        let mut removed = Vec::new();
        for backup in backups {
            if backup.created_at < cutoff {
                fs::remove_file(backup.path())?;
                info!("Removed expired backup: {}", backup.path().display());
                removed.push(backup.path);
            }
        }

        Ok(removed)
    }

    fn next_backup_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let mut path = self
            .dir
            .join(format!("{}{}.{}", BACKUP_PREFIX, stamp, BACKUP_EXTENSION));

        // Two backups within the same millisecond get a numeric suffix
        let mut n = 1;
        while path.exists() {
            path = self
                .dir
                .join(format!("{}{}_{}.{}", BACKUP_PREFIX, stamp, n, BACKUP_EXTENSION));
            n += 1;
        }
        path
    }

    fn is_backup_file(path: &Path) -> bool {
        path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(&format!(".{}", BACKUP_EXTENSION)))
                .unwrap_or(false)
    }
}
