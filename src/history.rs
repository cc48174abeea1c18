use chrono::Utc;
use log::warn;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::SchemaGuardError;

/// Lifecycle state of a migration record, stored as text in `migration_records.status`.
///
/// ```text
/// pending -> running -> completed -> rolled_back
///               |  ^
///               v  | (retry)
///             failed -> rolled_back
/// ```
#[derive(AsRefStr, Display, EnumString, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl RecordStatus {
    pub fn can_transition_to(self, next: RecordStatus) -> bool {
        use RecordStatus::*;

        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Running)
                | (Failed, RolledBack)
                | (Completed, RolledBack)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: i64,
    pub version: i64,
    pub filename: String,
    pub checksum: String,
    pub status: RecordStatus,
    pub executed_at: Option<i64>,
    pub execution_time_ms: i64,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub backup_path: Option<String>,
    pub rollback_sql: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MigrationRecord {
    /// A fresh, not yet persisted record in the `pending` state.
    pub fn new(
        version: i64,
        filename: &str,
        checksum: &str,
        backup_path: Option<String>,
        rollback_sql: Option<String>,
    ) -> Self {
        let now = Utc::now().timestamp();

        MigrationRecord {
            id: 0,
            version,
            filename: filename.to_owned(),
            checksum: checksum.to_owned(),
            status: RecordStatus::Pending,
            executed_at: None,
            execution_time_ms: 0,
            error_message: None,
            retry_count: 0,
            backup_path,
            rollback_sql,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: RecordStatus) -> Result<(), SchemaGuardError> {
        if !self.status.can_transition_to(next) {
            return Err(SchemaGuardError::InvalidTransition {
                version: self.version,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status_str: String = row.get(4)?;
        let status = status_str.parse::<RecordStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(MigrationRecord {
            id: row.get(0)?,
            version: row.get(1)?,
            filename: row.get(2)?,
            checksum: row.get(3)?,
            status,
            executed_at: row.get(5)?,
            execution_time_ms: row.get(6)?,
            error_message: row.get(7)?,
            retry_count: row.get(8)?,
            backup_path: row.get(9)?,
            rollback_sql: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }
}

const RECORD_COLUMNS: &str = "id, version, filename, checksum, status, executed_at, execution_time_ms,
    error_message, retry_count, backup_path, rollback_sql, created_at, updated_at";

/// Durable log of every migration attempt. The only component whose state outlives the
/// process; "current version" and the idempotency check are both answered from here.
pub struct HistoryStore;

impl HistoryStore {
    pub fn insert(conn: &Connection, record: &mut MigrationRecord) -> Result<(), SchemaGuardError> {
        let id: i64 = conn.query_row(
            "INSERT INTO migration_records (version, filename, checksum, status, executed_at, execution_time_ms,
                error_message, retry_count, backup_path, rollback_sql, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             RETURNING id",
            params![
                record.version,
                record.filename,
                record.checksum,
                record.status.as_ref(),
                record.executed_at,
                record.execution_time_ms,
                record.error_message,
                record.retry_count,
                record.backup_path,
                record.rollback_sql,
                record.created_at,
                record.updated_at,
            ],
            |row| row.get(0),
        )?;

        record.id = id;
        Ok(())
    }

    /// Persist the mutable fields of an existing record, bumping `updated_at`.
    pub fn save(conn: &Connection, record: &mut MigrationRecord) -> Result<(), SchemaGuardError> {
        record.updated_at = Utc::now().timestamp();

        let rows = conn.execute(
            "UPDATE migration_records SET
                status = ?1,
                executed_at = ?2,
                execution_time_ms = ?3,
                error_message = ?4,
                retry_count = ?5,
                backup_path = ?6,
                rollback_sql = ?7,
                updated_at = ?8
             WHERE id = ?9",
            params![
                record.status.as_ref(),
                record.executed_at,
                record.execution_time_ms,
                record.error_message,
                record.retry_count,
                record.backup_path,
                record.rollback_sql,
                record.updated_at,
                record.id,
            ],
        )?;

        if rows != 1 {
            return Err(SchemaGuardError::Error(format!(
                "Migration record {} (version {}) not found",
                record.id, record.version
            )));
        }

        Ok(())
    }

    /// Write a record back under its original id. Used after a backup restore, which
    /// rewinds this table along with everything else.
    pub fn reinstate(conn: &Connection, record: &MigrationRecord) -> Result<(), SchemaGuardError> {
        conn.execute(
            "INSERT OR REPLACE INTO migration_records (id, version, filename, checksum, status, executed_at,
                execution_time_ms, error_message, retry_count, backup_path, rollback_sql, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.id,
                record.version,
                record.filename,
                record.checksum,
                record.status.as_ref(),
                record.executed_at,
                record.execution_time_ms,
                record.error_message,
                record.retry_count,
                record.backup_path,
                record.rollback_sql,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Highest version with a completed record, or 0.
    pub fn current_version(conn: &Connection) -> Result<i64, SchemaGuardError> {
        let version: Option<i64> = conn.query_row(
            "SELECT MAX(version) FROM migration_records WHERE status = 'completed'",
            [],
            |row| row.get(0),
        )?;
        Ok(version.unwrap_or(0))
    }

    pub fn is_executed(conn: &Connection, version: i64, checksum: &str) -> Result<bool, SchemaGuardError> {
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM migration_records
             WHERE version = ?1 AND checksum = ?2 AND status = 'completed'",
            params![version, checksum],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn has_completed(conn: &Connection, version: i64) -> Result<bool, SchemaGuardError> {
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM migration_records WHERE version = ? AND status = 'completed'",
            [version],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn failed_records(conn: &Connection) -> Result<Vec<MigrationRecord>, SchemaGuardError> {
        Self::query_records(
            conn,
            "WHERE status = 'failed' ORDER BY version ASC, id ASC",
            params![],
        )
    }

    pub fn running_records(conn: &Connection) -> Result<Vec<MigrationRecord>, SchemaGuardError> {
        Self::query_records(
            conn,
            "WHERE status = 'running' ORDER BY version ASC, id ASC",
            params![],
        )
    }

    /// The most recently touched record.
    pub fn last_record(conn: &Connection) -> Result<Option<MigrationRecord>, SchemaGuardError> {
        let sql = format!(
            "SELECT {} FROM migration_records ORDER BY updated_at DESC, id DESC LIMIT 1",
            RECORD_COLUMNS
        );
        let record = conn.query_row(&sql, [], MigrationRecord::from_row).optional()?;
        Ok(record)
    }

    /// Completed records for a version, newest first.
    pub fn completed_for_version(
        conn: &Connection,
        version: i64,
    ) -> Result<Vec<MigrationRecord>, SchemaGuardError> {
        Self::query_records(
            conn,
            "WHERE version = ?1 AND status = 'completed' ORDER BY id DESC",
            params![version],
        )
    }

    /// Distinct versions that are currently applied, highest first.
    pub fn applied_versions_desc(conn: &Connection) -> Result<Vec<i64>, SchemaGuardError> {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT version FROM migration_records
             WHERE status = 'completed'
             ORDER BY version DESC",
        )?;

        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut versions = Vec::new();
        for row in rows {
            versions.push(row?);
        }
        Ok(versions)
    }

    pub fn records_for_backup(
        conn: &Connection,
        backup_path: &str,
    ) -> Result<Vec<MigrationRecord>, SchemaGuardError> {
        Self::query_records(
            conn,
            "WHERE backup_path = ?1 ORDER BY id ASC",
            params![backup_path],
        )
    }

    pub fn all_records(conn: &Connection) -> Result<Vec<MigrationRecord>, SchemaGuardError> {
        Self::query_records(conn, "ORDER BY id ASC", params![])
    }

    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<MigrationRecord>, SchemaGuardError> {
        let sql = format!("SELECT {} FROM migration_records WHERE id = ?", RECORD_COLUMNS);
        let record = conn.query_row(&sql, [id], MigrationRecord::from_row).optional()?;
        Ok(record)
    }

    fn query_records(
        conn: &Connection,
        clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<MigrationRecord>, SchemaGuardError> {
        let sql = format!("SELECT {} FROM migration_records {}", RECORD_COLUMNS, clause);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, MigrationRecord::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            match row {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("Skipping unreadable migration record: {}", e);
                }
            }
        }
        Ok(records)
    }
}
