use log::{debug, warn};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::error::SchemaGuardError;
use crate::schema::CREATE_SCHEMA_SQL;

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Owns the connection the migration manager operates on. The bookkeeping schema is
/// created on open; the managed schema is whatever the migrations build.
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, SchemaGuardError> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(SchemaGuardError::Error(format!(
                    "Database folder '{}' does not exist or is not a directory",
                    parent.display()
                )));
            }
        }

        let conn = Connection::open(db_path)?;
        debug!("Database opened at: {}", db_path.display());

        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, SchemaGuardError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection, creating the bookkeeping tables if needed.
    pub fn from_connection(conn: Connection) -> Result<Self, SchemaGuardError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self { conn };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<(), SchemaGuardError> {
        self.conn.execute_batch(CREATE_SCHEMA_SQL)?;
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn close(self) -> Result<(), SchemaGuardError> {
        self.conn.close().map_err(|(_, err)| SchemaGuardError::DatabaseError(err))
    }

    /// Version of the managed schema as recorded by the engine.
    pub fn schema_version(conn: &Connection) -> Result<i64, SchemaGuardError> {
        match Self::get_meta_value(conn, SCHEMA_VERSION_KEY)? {
            Some(value) => value.parse::<i64>().map_err(|_| {
                SchemaGuardError::Error(format!("Invalid schema_version value in database: '{}'", value))
            }),
            None => Ok(0),
        }
    }

    pub fn set_schema_version(conn: &Connection, version: i64) -> Result<(), SchemaGuardError> {
        Self::set_meta_value(conn, SCHEMA_VERSION_KEY, &version.to_string())
    }

    pub fn get_meta_value(conn: &Connection, key: &str) -> Result<Option<String>, SchemaGuardError> {
        let value = conn
            .query_row("SELECT value FROM meta WHERE key = ?", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_meta_value(conn: &Connection, key: &str, value: &str) -> Result<(), SchemaGuardError> {
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    /// Run `func` inside a `BEGIN IMMEDIATE` transaction, committing on success and rolling
    /// back on any error.
    pub fn immediate_transaction<T, F>(conn: &Connection, func: F) -> Result<T, SchemaGuardError>
    where
        F: FnOnce(&Connection) -> Result<T, SchemaGuardError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;

        match func(conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    warn!("Rollback after failed transaction also failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_bookkeeping_schema() {
        let db = Database::open_in_memory().unwrap();

        let count: i64 = db
            .conn()
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name IN ('meta', 'migration_records')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(Database::schema_version(db.conn()).unwrap(), 0);
    }

    #[test]
    fn test_schema_version_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.db");

        let db = Database::open(&path).unwrap();
        Database::set_schema_version(db.conn(), 7).unwrap();
        db.close().unwrap();

        let db = Database::open(&path).unwrap();
        assert_eq!(Database::schema_version(db.conn()).unwrap(), 7);
    }

    #[test]
    fn test_open_rejects_missing_folder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("app.db");

        assert!(Database::open(&path).is_err());
    }

    #[test]
    fn test_immediate_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();

        let result: Result<(), SchemaGuardError> = Database::immediate_transaction(db.conn(), |conn| {
            Database::set_meta_value(conn, "probe", "1")?;
            Err(SchemaGuardError::Error("boom".into()))
        });

        assert!(result.is_err());
        assert_eq!(Database::get_meta_value(db.conn(), "probe").unwrap(), None);
        assert!(db.conn().is_autocommit());
    }
}
