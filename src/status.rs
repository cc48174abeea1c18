use rusqlite::Connection;
use serde::Serialize;

use crate::backup::{BackupManager, BackupRef};
use crate::error::SchemaGuardError;
use crate::history::MigrationRecord;

/// Snapshot of the migration state. Computed on demand, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatusReport {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_migrations: Vec<String>,
    pub failed_migrations: Vec<MigrationRecord>,
    pub interrupted_migrations: Vec<MigrationRecord>,
    pub last_migration: Option<MigrationRecord>,
    pub database_health: DatabaseHealth,
    pub backup_status: BackupStatus,
    pub dry_run: bool,
}

impl MigrationStatusReport {
    pub fn is_up_to_date(&self) -> bool {
        self.pending_migrations.is_empty() && self.interrupted_migrations.is_empty()
    }

    /// Human-readable summary for the command line.
    pub fn print(&self) {
        println!("Current version:  {}", self.current_version);
        println!("Target version:   {}", self.target_version);
        if self.dry_run {
            println!("Mode:             dry-run");
        }

        if self.pending_migrations.is_empty() {
            println!("Pending:          none");
        } else {
            println!("Pending:          {}", self.pending_migrations.len());
            for filename in &self.pending_migrations {
                println!("  {}", filename);
            }
        }

        if !self.failed_migrations.is_empty() {
            println!("Failed:           {}", self.failed_migrations.len());
            for record in &self.failed_migrations {
                println!(
                    "  {} (retries: {}): {}",
                    record.filename,
                    record.retry_count,
                    record.error_message.as_deref().unwrap_or("-")
                );
            }
        }

        if !self.interrupted_migrations.is_empty() {
            println!("Interrupted:      {}", self.interrupted_migrations.len());
            for record in &self.interrupted_migrations {
                println!("  {} (run 'resolve {}' after review)", record.filename, record.version);
            }
        }

        if let Some(last) = &self.last_migration {
            println!("Last migration:   {} [{}]", last.filename, last.status);
        }

        let health = &self.database_health;
        println!(
            "Database:         SQLite {}, {} tables, {} indexes, {} bytes",
            health.sqlite_version, health.table_count, health.index_count, health.size_bytes
        );

        let backups = &self.backup_status;
        if !backups.enabled {
            println!("Backups:          disabled");
        } else {
            match &backups.latest {
                Some(latest) => println!(
                    "Backups:          {} (latest {})",
                    backups.count,
                    latest.path().display()
                ),
                None => println!("Backups:          none yet"),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHealth {
    pub sqlite_version: String,
    pub table_count: i64,
    pub index_count: i64,
    pub size_bytes: i64,
}

impl DatabaseHealth {
    pub fn collect(conn: &Connection) -> Result<Self, SchemaGuardError> {
        let sqlite_version: String = conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
        let table_count: i64 = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )?;
        let index_count: i64 = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'index' AND name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        Ok(DatabaseHealth {
            sqlite_version,
            table_count,
            index_count,
            size_bytes: page_count * page_size,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupStatus {
    pub enabled: bool,
    pub dir: String,
    pub retention_days: u32,
    pub count: usize,
    pub latest: Option<BackupRef>,
}

impl BackupStatus {
    pub fn collect(backups: &BackupManager) -> Result<Self, SchemaGuardError> {
        Ok(BackupStatus {
            enabled: backups.is_enabled(),
            dir: backups.dir().to_string_lossy().into_owned(),
            retention_days: backups.retention_days(),
            count: backups.list()?.len(),
            latest: backups.latest()?,
        })
    }
}
