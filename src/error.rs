use rusqlite::Error as RusqliteError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaGuardError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into SchemaGuardError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Pattern error: {0}")]
    PatternError(#[from] regex::Error),

    #[error("Config error: {0}")]
    ConfigError(#[from] Box<figment::Error>),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors

    #[error("Duplicate migration version {version}: '{first}' and '{second}'")]
    DuplicateVersion {
        version: i64,
        first: String,
        second: String,
    },

    #[error("Invalid status transition for version {version}: {from} -> {to}")]
    InvalidTransition { version: i64, from: String, to: String },

    #[error("Validation rule '{rule}' failed for {filename}: {message}")]
    Validation {
        filename: String,
        rule: String,
        message: String,
    },

    #[error("Pre-migration hook failed for {filename}: {message}")]
    Hook { filename: String, message: String },

    #[error("Migration {filename} failed: {message}")]
    Execution {
        version: i64,
        filename: String,
        message: String,
    },

    #[error("Migration {filename} timed out after {millis} ms: {message}")]
    Timeout {
        version: i64,
        filename: String,
        millis: u128,
        message: String,
    },

    #[error("Critical error in migration {filename}, batch aborted: {message}")]
    Critical { filename: String, message: String },

    #[error("Migration {filename} failed after {attempts} retry attempts: {message}")]
    RetriesExhausted {
        filename: String,
        attempts: u32,
        message: String,
    },

    #[error("Manual intervention required for migration {filename}: {message}")]
    ManualIntervention { filename: String, message: String },

    #[error("Rollback of version {version} failed: {message}")]
    RollbackFailed { version: i64, message: String },

    #[error("Backup not found: {}", path.display())]
    BackupMissing { path: PathBuf },

    #[error("Restore from backup {} failed: {message}. Manual intervention required", path.display())]
    BackupRestoreFailed { path: PathBuf, message: String },

    #[error("Migration {filename} failed and versions {reverted:?} were rolled back: {message}")]
    RolledBack {
        filename: String,
        reverted: Vec<i64>,
        message: String,
    },

    #[error("Migration {filename} failed and the database was restored from {}: {message}", backup.display())]
    RestoredFromBackup {
        filename: String,
        backup: PathBuf,
        message: String,
    },

    #[error("Migration(s) {versions:?} were interrupted while running and need manual review")]
    InterruptedMigration { versions: Vec<i64> },
}

impl SchemaGuardError {
    /// Errors raised by the database while a migration's statements ran. These are the
    /// only errors the recovery engine is allowed to act on.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            SchemaGuardError::Execution { .. } | SchemaGuardError::Timeout { .. }
        )
    }

    /// The database's own message for execution failures, without the filename prefix,
    /// so error patterns can't match on a migration's name.
    pub fn failure_message(&self) -> String {
        match self {
            SchemaGuardError::Execution { message, .. } | SchemaGuardError::Timeout { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }
}

impl From<figment::Error> for SchemaGuardError {
    fn from(err: figment::Error) -> Self {
        SchemaGuardError::ConfigError(Box::new(err))
    }
}
