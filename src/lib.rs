//! Idempotent, recoverable schema migrations for SQLite.
//!
//! A [`MigrationManager`] applies the numbered SQL files in a directory to a database,
//! records every attempt in a `migration_records` table, and reacts to failures with
//! configurable recovery strategies (skip, retry, rollback, manual) backed by
//! pre-batch snapshots.

pub mod backup;
pub mod catalog;
pub mod config;
pub mod database;
pub mod error;
pub mod executor;
pub mod hash;
pub mod history;
pub mod hooks;
pub mod manager;
pub mod recovery;
mod schema;
pub mod status;
pub mod validation;

pub use backup::{BackupManager, BackupRef};
pub use catalog::{Catalog, MigrationFile, MigrationSource};
pub use config::Config;
pub use database::Database;
pub use error::SchemaGuardError;
pub use history::{HistoryStore, MigrationRecord, RecordStatus};
pub use manager::{MigrateReport, MigrationManager};
pub use recovery::{RecoveryAction, RecoveryStrategy};
pub use status::MigrationStatusReport;
pub use validation::{ForbidPattern, RequirePattern, RuleScope, ValidationRule};
