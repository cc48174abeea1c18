use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use serde::Serialize;

use crate::backup::{BackupManager, BackupRef};
use crate::catalog::{Catalog, MigrationFile};
use crate::config::Config;
use crate::database::Database;
use crate::error::SchemaGuardError;
use crate::executor::{Executor, RunOutcome};
use crate::history::{HistoryStore, RecordStatus};
use crate::hooks::{HookRegistry, PostMigrationHook, PreMigrationHook};
use crate::recovery::{RecoveryEngine, RecoveryOutcome, RecoveryStrategy};
use crate::status::{BackupStatus, DatabaseHealth, MigrationStatusReport};
use crate::validation::{ValidationEngine, ValidationRule};

/// What a call to [`MigrationManager::migrate`] did, by version.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MigrateReport {
    pub applied: Vec<i64>,
    /// Applied only after one or more retries. Also listed in `applied`.
    pub recovered: Vec<i64>,
    /// Failed, tolerated by a skip strategy. These stay pending.
    pub skipped: Vec<i64>,
    pub already_applied: Vec<i64>,
    /// Dry-run only: would have been applied.
    pub would_apply: Vec<i64>,
    pub backup: Option<PathBuf>,
    pub dry_run: bool,
}

struct ManagerState {
    db: Database,
    hooks: HookRegistry,
    validation: ValidationEngine,
    recovery: RecoveryEngine,
    dry_run: bool,
    statement_timeout: Option<Duration>,
}

/// Entry point for applying, reverting and inspecting migrations on one database.
///
/// Every operation takes the manager's lock for its full duration, so calls from multiple
/// threads are serialized. Hooks run while the lock is held and must not call back into
/// the manager. Nothing here coordinates between processes.
pub struct MigrationManager {
    state: Mutex<ManagerState>,
    catalog: Catalog,
    backups: BackupManager,
}

impl MigrationManager {
    /// Open the database named in `config` and build a manager for it.
    pub fn open(config: &Config) -> Result<Self, SchemaGuardError> {
        let db = Database::open(&config.database.path)?;
        Self::new(db, config)
    }

    pub fn new(db: Database, config: &Config) -> Result<Self, SchemaGuardError> {
        let catalog = Catalog::new(&config.migrations.dir, &config.migrations.extension);
        if !catalog.dir().is_dir() {
            fs::create_dir_all(catalog.dir())?;
            info!("Created migrations directory: {}", catalog.dir().display());
        }

        let backups = BackupManager::new(
            &config.backup.dir,
            config.backup.enabled,
            config.backup.retention_days,
            config.backup.auto_cleanup,
        );

        let validation = ValidationEngine::with_defaults(&config.validation.disabled_rules)?;

        let mut recovery = RecoveryEngine::with_defaults(config.recovery.enabled, config.recovery.auto_rollback)?;
        for strategy in &config.recovery.strategies {
            recovery.register(RecoveryStrategy::from_config(strategy)?);
        }
        debug!(
            "Recovery enabled: {}, auto-rollback: {}, strategies: {:?}",
            recovery.is_enabled(),
            recovery.auto_rollback_enabled(),
            recovery.strategy_names()
        );

        let state = ManagerState {
            db,
            hooks: HookRegistry::new(),
            validation,
            recovery,
            dry_run: config.migrations.dry_run,
            statement_timeout: config.migrations.statement_timeout_secs.map(Duration::from_secs),
        };

        Ok(MigrationManager {
            state: Mutex::new(state),
            catalog,
            backups,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        // A panicking hook poisons the lock; the state itself is still consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Apply every pending migration in ascending version order.
    ///
    /// Stops at the first failure recovery can't absorb. A failure that recovery answers
    /// with a rollback or a backup restore also stops the batch and is returned as
    /// [`SchemaGuardError::RolledBack`] or [`SchemaGuardError::RestoredFromBackup`].
    pub fn migrate(&self) -> Result<MigrateReport, SchemaGuardError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let _tmr = timer!(Level::Info; "MigrationManager::migrate");

        Self::ensure_not_interrupted(&state.db)?;

        let current = Database::schema_version(state.db.conn())?;
        let pending = self.catalog.list_pending(current, state.db.conn())?;

        let mut report = MigrateReport {
            dry_run: state.dry_run,
            ..Default::default()
        };

        if pending.is_empty() {
            info!("Database is up to date at version {}", current);
            return Ok(report);
        }
        info!(
            "Found {} pending migration(s), current version {}",
            pending.len(),
            current
        );
        debug!(
            "{} pre-hook(s), {} post-hook(s) registered",
            state.hooks.pre_hook_count(),
            state.hooks.post_hook_count()
        );

        let backup = if self.backups.is_enabled() && !state.dry_run {
            Some(self.backups.create_backup(state.db.conn())?)
        } else {
            None
        };
        report.backup = backup.as_ref().map(|b| b.path().to_path_buf());

        let ManagerState {
            db,
            hooks,
            validation,
            recovery,
            dry_run,
            statement_timeout,
        } = state;
        let mut executor = Executor::new(db.conn_mut(), &self.catalog, validation, hooks)
            .dry_run(*dry_run)
            .statement_timeout(*statement_timeout);

        for file in &pending {
            Self::run_one(&mut executor, recovery, file, backup.as_ref(), &mut report)?;
        }

        if report.dry_run {
            info!("[dry-run] {} migration(s) would be applied", report.would_apply.len());
        } else {
            info!(
                "Migration batch finished: {} applied, {} skipped",
                report.applied.len(),
                report.skipped.len()
            );
        }

        Ok(report)
    }

    fn run_one(
        executor: &mut Executor<'_>,
        recovery: &RecoveryEngine,
        file: &MigrationFile,
        backup: Option<&BackupRef>,
        report: &mut MigrateReport,
    ) -> Result<(), SchemaGuardError> {
        let version = file.version();

        let (source, mut record, error) = match executor.run_migration(file, backup)? {
            RunOutcome::AlreadyApplied => {
                report.already_applied.push(version);
                return Ok(());
            }
            RunOutcome::WouldApply { .. } => {
                report.would_apply.push(version);
                return Ok(());
            }
            RunOutcome::Completed { .. } => {
                report.applied.push(version);
                return Ok(());
            }
            RunOutcome::Failed { source, record, error } => (source, record, error),
        };

        let outcome = recovery.handle(executor, &source, &mut record, error, backup)?;
        let message = record.error_message.clone().unwrap_or_default();

        match outcome {
            RecoveryOutcome::Skipped { .. } => {
                report.skipped.push(version);
                Ok(())
            }
            RecoveryOutcome::Recovered { attempts } => {
                info!("Migration {} succeeded after {} retries", file.filename(), attempts);
                report.applied.push(version);
                report.recovered.push(version);
                Ok(())
            }
            RecoveryOutcome::RolledBack { reverted } => Err(SchemaGuardError::RolledBack {
                filename: file.filename().to_owned(),
                reverted,
                message,
            }),
            RecoveryOutcome::RestoredFromBackup { backup } => Err(SchemaGuardError::RestoredFromBackup {
                filename: file.filename().to_owned(),
                backup,
                message,
            }),
        }
    }

    fn ensure_not_interrupted(db: &Database) -> Result<(), SchemaGuardError> {
        let running = HistoryStore::running_records(db.conn())?;
        if running.is_empty() {
            return Ok(());
        }

        let versions: Vec<i64> = running.iter().map(|r| r.version).collect();
        for record in &running {
            error!(
                "Migration {} was left running by an earlier process. Inspect the schema, then resolve it",
                record.filename
            );
        }
        Err(SchemaGuardError::InterruptedMigration { versions })
    }

    /// Revert the `steps` most recently applied versions, newest first. Returns the
    /// reverted versions. There is no backup fallback here: a failed revert is returned
    /// as [`SchemaGuardError::RollbackFailed`].
    pub fn rollback(&self, steps: u32) -> Result<Vec<i64>, SchemaGuardError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        Self::ensure_not_interrupted(&state.db)?;
        info!("Rolling back {} step(s)", steps);

        let reverted = Executor::new(state.db.conn_mut(), &self.catalog, &state.validation, &state.hooks)
            .dry_run(state.dry_run)
            .statement_timeout(state.statement_timeout)
            .rollback_steps(steps)?;

        info!("Rolled back versions {:?}", reverted);
        Ok(reverted)
    }

    /// Revert every applied version.
    pub fn reset(&self) -> Result<Vec<i64>, SchemaGuardError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        Self::ensure_not_interrupted(&state.db)?;
        warn!("Resetting database: reverting all applied migrations");

        let reverted = Executor::new(state.db.conn_mut(), &self.catalog, &state.validation, &state.hooks)
            .dry_run(state.dry_run)
            .statement_timeout(state.statement_timeout)
            .rollback_all()?;

        info!("Reset complete, reverted {:?}", reverted);
        Ok(reverted)
    }

    pub fn status(&self) -> Result<MigrationStatusReport, SchemaGuardError> {
        let state = self.lock();
        let conn = state.db.conn();

        let current_version = Database::schema_version(conn)?;
        let pending_migrations = self
            .catalog
            .list_pending(current_version, conn)?
            .iter()
            .map(|f| f.filename().to_owned())
            .collect();

        Ok(MigrationStatusReport {
            current_version,
            target_version: self.catalog.target_version()?,
            pending_migrations,
            failed_migrations: HistoryStore::failed_records(conn)?,
            interrupted_migrations: HistoryStore::running_records(conn)?,
            last_migration: HistoryStore::last_record(conn)?,
            database_health: DatabaseHealth::collect(conn)?,
            backup_status: BackupStatus::collect(&self.backups)?,
            dry_run: state.dry_run,
        })
    }

    /// Write an empty migration template as the next version. Names may contain letters,
    /// digits, `_` and `-`; spaces become underscores. Existing files are never replaced.
    pub fn create_migration(&self, name: &str) -> Result<PathBuf, SchemaGuardError> {
        let _guard = self.lock();

        let name = name.trim().replace(' ', "_");
        let version = self.catalog.target_version()? + 1;
        let filename = format!("{:03}_{}.{}", version, name, self.catalog.extension());

        if MigrationFile::parse_filename(&filename, self.catalog.extension()).is_none() {
            return Err(SchemaGuardError::Error(format!(
                "Invalid migration name '{}': use letters, digits, '_' and '-'",
                name
            )));
        }

        let path = self.catalog.dir().join(&filename);
        let template = format!(
            "-- Migration: {}\n-- Created: {}\n\n-- +migrate Up\nBEGIN;\n\nCOMMIT;\n\n-- +migrate Down\nBEGIN;\n\nCOMMIT;\n",
            name,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        );

        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(template.as_bytes())?;

        info!("Created migration: {}", path.display());
        Ok(path)
    }

    /// Mark a migration left `running` by a crashed process as `failed`, after the operator
    /// has checked what it did. Returns the number of records resolved.
    pub fn resolve_interrupted(&self, version: i64) -> Result<usize, SchemaGuardError> {
        let state = self.lock();
        let conn = state.db.conn();

        let running: Vec<_> = HistoryStore::running_records(conn)?
            .into_iter()
            .filter(|r| r.version == version)
            .collect();
        if running.is_empty() {
            return Err(SchemaGuardError::Error(format!(
                "No interrupted migration found for version {}",
                version
            )));
        }

        let count = running.len();
        Database::immediate_transaction(conn, |conn| {
            for mut record in running {
                record.transition(RecordStatus::Failed)?;
                record.error_message = Some("interrupted; resolved by operator".to_owned());
                HistoryStore::save(conn, &mut record)?;
            }
            Ok(())
        })?;

        info!("Resolved {} interrupted record(s) for version {}", count, version);
        Ok(count)
    }

    pub fn add_pre_hook(&self, hook: PreMigrationHook) {
        self.lock().hooks.add_pre_hook(hook);
    }

    pub fn add_post_hook(&self, hook: PostMigrationHook) {
        self.lock().hooks.add_post_hook(hook);
    }

    pub fn add_validation_rule(&self, rule: Box<dyn ValidationRule>) {
        self.lock().validation.add_rule(rule);
    }

    /// Registered strategies are tried before the built-in ones.
    pub fn add_recovery_strategy(&self, strategy: RecoveryStrategy) {
        self.lock().recovery.register(strategy);
    }

    pub fn set_dry_run_mode(&self, enabled: bool) {
        self.lock().dry_run = enabled;
        info!("Dry-run mode {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn set_statement_timeout(&self, timeout: Option<Duration>) {
        self.lock().statement_timeout = timeout;
    }

    pub fn list_backups(&self) -> Result<Vec<BackupRef>, SchemaGuardError> {
        let _guard = self.lock();
        self.backups.list()
    }

    pub fn prune_backups(&self) -> Result<Vec<PathBuf>, SchemaGuardError> {
        let _guard = self.lock();
        self.backups.prune()
    }

    pub fn close(self) -> Result<(), SchemaGuardError> {
        let state = self.state.into_inner().unwrap_or_else(|e| e.into_inner());
        state.db.close()
    }
}
