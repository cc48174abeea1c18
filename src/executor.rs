use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, RecvTimeoutError};
use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use rusqlite::Connection;

use crate::backup::{BackupManager, BackupRef};
use crate::catalog::{is_blank_sql, Catalog, MigrationFile, MigrationSource};
use crate::database::Database;
use crate::error::SchemaGuardError;
use crate::hash::Hash;
use crate::history::{HistoryStore, MigrationRecord, RecordStatus};
use crate::hooks::HookRegistry;
use crate::recovery::RecoveryTarget;
use crate::validation::{RuleViolation, ValidationEngine};

/// Result of running a single migration file.
#[derive(Debug)]
pub enum RunOutcome {
    /// This exact content already has a completed record.
    AlreadyApplied,
    /// Dry-run: validation and hooks passed, nothing was executed or recorded.
    WouldApply { advisories: Vec<RuleViolation> },
    Completed { record: MigrationRecord },
    /// The apply block failed. The record is persisted as `failed` and is handed to
    /// recovery together with the source it was run from.
    Failed {
        source: MigrationSource,
        record: MigrationRecord,
        error: SchemaGuardError,
    },
}

/// Runs migrations against one connection and keeps the history store in step with every
/// state change. Borrowed from the manager for the duration of one operation.
pub struct Executor<'a> {
    conn: &'a mut Connection,
    catalog: &'a Catalog,
    validation: &'a ValidationEngine,
    hooks: &'a HookRegistry,
    dry_run: bool,
    statement_timeout: Option<Duration>,
}

impl<'a> Executor<'a> {
    pub fn new(
        conn: &'a mut Connection,
        catalog: &'a Catalog,
        validation: &'a ValidationEngine,
        hooks: &'a HookRegistry,
    ) -> Self {
        Executor {
            conn,
            catalog,
            validation,
            hooks,
            dry_run: false,
            statement_timeout: None,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn run_migration(
        &mut self,
        file: &MigrationFile,
        backup: Option<&BackupRef>,
    ) -> Result<RunOutcome, SchemaGuardError> {
        let source = file.load()?;

        if HistoryStore::is_executed(self.conn, source.version(), source.checksum())? {
            debug!("Migration {} already applied", source.filename());
            return Ok(RunOutcome::AlreadyApplied);
        }

        if let Some(previous) = HistoryStore::completed_for_version(self.conn, source.version())?.first() {
            warn!(
                "Migration {} changed since it was applied (checksum {} -> {})",
                source.filename(),
                Hash::short_checksum(&previous.checksum),
                Hash::short_checksum(source.checksum())
            );
        }

        let advisories = self.validation.validate(&source)?;

        if self.dry_run {
            self.hooks.run_pre(source.version(), source.filename())?;
            self.hooks
                .run_post(source.version(), source.filename(), true, Duration::ZERO);
            info!("[dry-run] Would apply migration {}", source.filename());
            return Ok(RunOutcome::WouldApply { advisories });
        }

        let rollback_sql = source.has_revert().then(|| source.revert_sql().to_owned());
        let mut record = MigrationRecord::new(
            source.version(),
            source.filename(),
            source.checksum(),
            backup.map(BackupRef::path_string),
            rollback_sql,
        );
        HistoryStore::insert(self.conn, &mut record)?;

        if let Err(e) = self.hooks.run_pre(source.version(), source.filename()) {
            error!("Pre-migration hook failed for {}: {}", source.filename(), e);
            record.error_message = Some(e.to_string());
            HistoryStore::save(self.conn, &mut record)?;
            return Err(e);
        }

        record.transition(RecordStatus::Running)?;
        HistoryStore::save(self.conn, &mut record)?;

        info!("Applying migration {}", source.filename());
        match self.attempt(&source, &mut record) {
            Ok(()) => Ok(RunOutcome::Completed { record }),
            Err(error) if error.is_execution_failure() => Ok(RunOutcome::Failed {
                source,
                record,
                error,
            }),
            Err(e) => Err(e),
        }
    }

    /// Execute the apply block for a record that is already `running` and persist the
    /// result. On failure the record is left `failed` and the execution error returned.
    fn attempt(&mut self, source: &MigrationSource, record: &mut MigrationRecord) -> Result<(), SchemaGuardError> {
        let start = Instant::now();
        let result = {
            let _tmr = timer!(Level::Debug; "Executor::apply", "{}", source.filename());
            self.execute_block(source.version(), source.filename(), source.apply_sql())
        };
        let elapsed = start.elapsed();

        record.executed_at = Some(Utc::now().timestamp());
        record.execution_time_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);

        match result {
            Ok(()) => {
                record.transition(RecordStatus::Completed)?;
                record.error_message = None;

                Database::immediate_transaction(self.conn, |conn| {
                    HistoryStore::save(conn, record)?;
                    if record.version > Database::schema_version(conn)? {
                        Database::set_schema_version(conn, record.version)?;
                    }
                    Ok(())
                })?;

                info!(
                    "Migration {} completed in {} ms",
                    source.filename(),
                    record.execution_time_ms
                );
                self.hooks
                    .run_post(source.version(), source.filename(), true, elapsed);
                Ok(())
            }
            Err(e) => {
                error!("Migration {} failed: {}", source.filename(), e.failure_message());
                record.transition(RecordStatus::Failed)?;
                record.error_message = Some(e.failure_message());
                HistoryStore::save(self.conn, record)?;

                self.hooks
                    .run_post(source.version(), source.filename(), false, elapsed);
                Err(e)
            }
        }
    }

    /// Run a block of statements, bounded by the statement timeout when one is set. A
    /// transaction the block leaves open is rolled back, so a failed or unterminated block
    /// never leaves partial changes behind.
    fn execute_block(&self, version: i64, filename: &str, sql: &str) -> Result<(), SchemaGuardError> {
        if is_blank_sql(sql) {
            return Ok(());
        }

        let (result, timed_out) = match self.statement_timeout {
            None => (self.conn.execute_batch(sql), false),
            Some(timeout) => self.execute_with_watchdog(sql, timeout),
        };

        let result = match result {
            Ok(()) if !self.conn.is_autocommit() => Err("migration left a transaction open".to_owned()),
            Ok(()) => Ok(()),
            Err(e) => Err(e.to_string()),
        };

        let Err(message) = result else {
            return Ok(());
        };

        if !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("Rolling back the open transaction of {} failed: {}", filename, e);
            }
        }

        if timed_out {
            let millis = self.statement_timeout.map(|t| t.as_millis()).unwrap_or_default();
            Err(SchemaGuardError::Timeout {
                version,
                filename: filename.to_owned(),
                millis,
                message,
            })
        } else {
            Err(SchemaGuardError::Execution {
                version,
                filename: filename.to_owned(),
                message,
            })
        }
    }

    /// A watchdog thread interrupts the connection unless the batch reports back first.
    fn execute_with_watchdog(&self, sql: &str, timeout: Duration) -> (rusqlite::Result<()>, bool) {
        let interrupt = self.conn.get_interrupt_handle();
        let fired = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = bounded::<()>(1);

        let watchdog = {
            let fired = Arc::clone(&fired);
            thread::spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(timeout) {
                    fired.store(true, Ordering::Release);
                    interrupt.interrupt();
                }
            })
        };

        let result = self.conn.execute_batch(sql);
        let _ = done_tx.send(());
        if watchdog.join().is_err() {
            warn!("Statement timeout watchdog panicked");
        }

        let timed_out = result.is_err() && fired.load(Ordering::Acquire);
        (result, timed_out)
    }

    /// Revert one applied version and mark its completed records `rolled_back`.
    ///
    /// The revert SQL captured when the migration ran is preferred over the file on disk,
    /// which may have changed or disappeared since.
    pub fn revert_version(&mut self, version: i64) -> Result<(), SchemaGuardError> {
        let records = HistoryStore::completed_for_version(self.conn, version)?;
        let Some(latest) = records.first() else {
            return Err(SchemaGuardError::RollbackFailed {
                version,
                message: "version is not applied".to_owned(),
            });
        };
        let filename = latest.filename.clone();

        let revert_sql = match latest.rollback_sql.as_deref().filter(|sql| !is_blank_sql(sql)) {
            Some(sql) => sql.to_owned(),
            None => self.revert_sql_from_file(version)?,
        };

        if self.dry_run {
            info!("[dry-run] Would revert migration {}", filename);
            return Ok(());
        }

        info!("Reverting migration {}", filename);
        {
            let _tmr = timer!(Level::Debug; "Executor::revert", "{}", filename);
            self.execute_block(version, &filename, &revert_sql)
                .map_err(|e| SchemaGuardError::RollbackFailed {
                    version,
                    message: e.failure_message(),
                })?;
        }

        Database::immediate_transaction(self.conn, |conn| {
            for mut record in records {
                record.transition(RecordStatus::RolledBack)?;
                HistoryStore::save(conn, &mut record)?;
            }
            let current = HistoryStore::current_version(conn)?;
            Database::set_schema_version(conn, current)
        })?;

        info!("Reverted migration {}", filename);
        Ok(())
    }

    fn revert_sql_from_file(&self, version: i64) -> Result<String, SchemaGuardError> {
        let source = match self.catalog.find(version)? {
            Some(file) => file.load()?,
            None => {
                return Err(SchemaGuardError::RollbackFailed {
                    version,
                    message: "no stored revert SQL and the migration file is missing".to_owned(),
                })
            }
        };

        if !source.has_revert() {
            return Err(SchemaGuardError::RollbackFailed {
                version,
                message: format!("{} has no revert block", source.filename()),
            });
        }
        Ok(source.revert_sql().to_owned())
    }

    /// Revert the `steps` most recently applied versions, newest first. Stops at the first
    /// failure; versions reverted before it stay reverted.
    pub fn rollback_steps(&mut self, steps: u32) -> Result<Vec<i64>, SchemaGuardError> {
        let versions: Vec<i64> = HistoryStore::applied_versions_desc(self.conn)?
            .into_iter()
            .take(steps as usize)
            .collect();

        let mut reverted = Vec::with_capacity(versions.len());
        for version in versions {
            self.revert_version(version)?;
            reverted.push(version);
        }
        Ok(reverted)
    }

    /// Revert every applied version, newest first.
    pub fn rollback_all(&mut self) -> Result<Vec<i64>, SchemaGuardError> {
        let applied = HistoryStore::applied_versions_desc(self.conn)?.len();
        self.rollback_steps(u32::try_from(applied).unwrap_or(u32::MAX))
    }
}

impl RecoveryTarget for Executor<'_> {
    fn retry(&mut self, source: &MigrationSource, record: &mut MigrationRecord) -> Result<(), SchemaGuardError> {
        record.transition(RecordStatus::Running)?;
        record.retry_count += 1;
        HistoryStore::save(self.conn, record)?;

        self.attempt(source, record)
    }

    fn revert_latest(&mut self, steps: u32) -> Result<Vec<i64>, SchemaGuardError> {
        self.rollback_steps(steps)
    }

    fn mark_rolled_back(&mut self, record: &mut MigrationRecord) -> Result<(), SchemaGuardError> {
        record.transition(RecordStatus::RolledBack)?;
        HistoryStore::save(self.conn, record)
    }

    fn restore_backup(&mut self, backup: &BackupRef) -> Result<(), SchemaGuardError> {
        // The restore rewinds migration_records too. Keep the batch's audit trail.
        let batch = HistoryStore::records_for_backup(self.conn, &backup.path_string())?;

        BackupManager::restore(self.conn, backup)?;

        Database::immediate_transaction(self.conn, |conn| {
            for mut record in batch {
                let next = match record.status {
                    RecordStatus::Completed | RecordStatus::Failed => Some(RecordStatus::RolledBack),
                    RecordStatus::Running => Some(RecordStatus::Failed),
                    RecordStatus::Pending | RecordStatus::RolledBack => None,
                };
                if let Some(next) = next {
                    record.transition(next)?;
                    record.updated_at = Utc::now().timestamp();
                }
                HistoryStore::reinstate(conn, &record)?;
            }
            let current = HistoryStore::current_version(conn)?;
            Database::set_schema_version(conn, current)
        })?;

        info!("Database restored from {}", backup.path().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        db: Database,
        catalog: Catalog,
        validation: ValidationEngine,
        hooks: HookRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            fs::create_dir(dir.path().join("migrations")).unwrap();
            let catalog = Catalog::new(dir.path().join("migrations"), "sql");

            Fixture {
                db: Database::open(dir.path().join("test.db")).unwrap(),
                dir,
                catalog,
                validation: ValidationEngine::with_defaults(&[]).unwrap(),
                hooks: HookRegistry::new(),
            }
        }

        fn write(&self, name: &str, apply: &str, revert: &str) -> MigrationFile {
            let path = self.catalog.dir().join(name);
            fs::write(
                &path,
                format!(
                    "-- +migrate Up\nBEGIN;\n{}\nCOMMIT;\n-- +migrate Down\nBEGIN;\n{}\nCOMMIT;\n",
                    apply, revert
                ),
            )
            .unwrap();
            MigrationFile::from_path(&path, "sql").unwrap()
        }

        fn executor(&mut self) -> Executor<'_> {
            Executor::new(self.db.conn_mut(), &self.catalog, &self.validation, &self.hooks)
        }
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            > 0
    }

    fn backup_in(dir: &Path, conn: &Connection) -> BackupRef {
        BackupManager::new(dir.join("backups"), true, 30, false)
            .create_backup(conn)
            .unwrap()
    }

    #[test]
    fn test_completed_migration_advances_version() {
        let mut fx = Fixture::new();
        let file = fx.write(
            "001_widgets.sql",
            "CREATE TABLE IF NOT EXISTS widgets (id INTEGER PRIMARY KEY);",
            "DROP TABLE widgets;",
        );

        let outcome = fx.executor().run_migration(&file, None).unwrap();

        let record = match outcome {
            RunOutcome::Completed { record } => record,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(record.status, RecordStatus::Completed);
        assert!(record.executed_at.is_some());
        assert!(record.rollback_sql.as_deref().unwrap().contains("DROP TABLE widgets"));
        assert!(table_exists(fx.db.conn(), "widgets"));
        assert_eq!(Database::schema_version(fx.db.conn()).unwrap(), 1);

        let again = fx.executor().run_migration(&file, None).unwrap();
        assert!(matches!(again, RunOutcome::AlreadyApplied));
    }

    #[test]
    fn test_failed_migration_rolls_back_open_transaction() {
        let mut fx = Fixture::new();
        let file = fx.write(
            "001_broken.sql",
            "CREATE TABLE IF NOT EXISTS half (id INTEGER);\nINSERT INTO missing_table VALUES (1);",
            "",
        );

        let outcome = fx.executor().run_migration(&file, None).unwrap();

        match outcome {
            RunOutcome::Failed { record, error, .. } => {
                assert_eq!(record.status, RecordStatus::Failed);
                assert!(error.failure_message().contains("no such table"));
                assert_eq!(record.error_message, Some(error.failure_message()));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(fx.db.conn().is_autocommit());
        assert!(!table_exists(fx.db.conn(), "half"));
        assert_eq!(Database::schema_version(fx.db.conn()).unwrap(), 0);
    }

    #[test]
    fn test_validation_failure_creates_no_record() {
        let mut fx = Fixture::new();
        let file = fx.write("001_drop.sql", "DROP TABLE users;", "");

        let err = fx.executor().run_migration(&file, None).unwrap_err();

        assert!(matches!(err, SchemaGuardError::Validation { ref rule, .. } if rule == "no_drop_table"));
        assert!(HistoryStore::all_records(fx.db.conn()).unwrap().is_empty());
    }

    #[test]
    fn test_pre_hook_failure_leaves_record_pending() {
        let mut fx = Fixture::new();
        fx.hooks
            .add_pre_hook(Box::new(|_, _| Err(SchemaGuardError::Error("maintenance window closed".into()))));
        let file = fx.write(
            "001_widgets.sql",
            "CREATE TABLE IF NOT EXISTS widgets (id INTEGER);",
            "",
        );

        let err = fx.executor().run_migration(&file, None).unwrap_err();

        assert!(matches!(err, SchemaGuardError::Hook { .. }));
        let records = HistoryStore::all_records(fx.db.conn()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Pending);
        assert!(records[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("maintenance window closed"));
        assert!(!table_exists(fx.db.conn(), "widgets"));
    }

    #[test]
    fn test_post_hooks_see_success_and_failure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut fx = Fixture::new();
        {
            let seen = Arc::clone(&seen);
            fx.hooks.add_post_hook(Box::new(move |version, _, success, _| {
                seen.lock().unwrap().push((version, success));
                Ok(())
            }));
        }
        let good = fx.write("001_good.sql", "CREATE TABLE IF NOT EXISTS a (x INTEGER);", "");
        let bad = fx.write("002_bad.sql", "INSERT INTO nowhere VALUES (1);", "");

        fx.executor().run_migration(&good, None).unwrap();
        fx.executor().run_migration(&bad, None).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(1, true), (2, false)]);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let mut fx = Fixture::new();
        let file = fx.write("001_widgets.sql", "CREATE TABLE widgets (id INTEGER);", "");

        let outcome = fx.executor().dry_run(true).run_migration(&file, None).unwrap();

        match outcome {
            RunOutcome::WouldApply { advisories } => {
                assert_eq!(advisories.len(), 1);
                assert_eq!(advisories[0].rule, "require_if_not_exists");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!table_exists(fx.db.conn(), "widgets"));
        assert!(HistoryStore::all_records(fx.db.conn()).unwrap().is_empty());
    }

    #[test]
    fn test_unterminated_transaction_is_a_failure() {
        let mut fx = Fixture::new();
        fx.validation = ValidationEngine::empty();
        let path = fx.catalog.dir().join("001_open.sql");
        fs::write(&path, "BEGIN;\nCREATE TABLE dangling (id INTEGER);\n").unwrap();
        let file = MigrationFile::from_path(&path, "sql").unwrap();

        let outcome = fx.executor().run_migration(&file, None).unwrap();

        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert!(fx.db.conn().is_autocommit());
        assert!(!table_exists(fx.db.conn(), "dangling"));
    }

    #[test]
    fn test_statement_timeout_interrupts_long_migration() {
        let mut fx = Fixture::new();
        let file = fx.write(
            "001_slow.sql",
            "CREATE TABLE IF NOT EXISTS probe (n INTEGER);\n\
             INSERT INTO probe SELECT count(*) FROM (WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c LIMIT 1000000000) SELECT x FROM c);",
            "",
        );

        let outcome = fx
            .executor()
            .statement_timeout(Some(Duration::from_millis(100)))
            .run_migration(&file, None)
            .unwrap();

        match outcome {
            RunOutcome::Failed { error, .. } => {
                assert!(matches!(error, SchemaGuardError::Timeout { millis: 100, .. }));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(fx.db.conn().is_autocommit());
    }

    #[test]
    fn test_revert_prefers_stored_sql() {
        let mut fx = Fixture::new();
        let file = fx.write(
            "001_widgets.sql",
            "CREATE TABLE IF NOT EXISTS widgets (id INTEGER);",
            "DROP TABLE widgets;",
        );
        fx.executor().run_migration(&file, None).unwrap();

        // The file loses its revert block after it ran
        fs::write(file.path(), "-- +migrate Up\nBEGIN;\nSELECT 1;\nCOMMIT;\n").unwrap();

        let reverted = fx.executor().rollback_steps(1).unwrap();

        assert_eq!(reverted, vec![1]);
        assert!(!table_exists(fx.db.conn(), "widgets"));
        assert_eq!(Database::schema_version(fx.db.conn()).unwrap(), 0);
        let records = HistoryStore::all_records(fx.db.conn()).unwrap();
        assert_eq!(records[0].status, RecordStatus::RolledBack);
    }

    #[test]
    fn test_revert_without_revert_block_fails() {
        let mut fx = Fixture::new();
        let path = fx.catalog.dir().join("001_widgets.sql");
        fs::write(&path, "BEGIN;\nCREATE TABLE IF NOT EXISTS widgets (id INTEGER);\nCOMMIT;\n").unwrap();
        let file = MigrationFile::from_path(&path, "sql").unwrap();
        fx.executor().run_migration(&file, None).unwrap();

        let err = fx.executor().rollback_steps(1).unwrap_err();

        assert!(matches!(err, SchemaGuardError::RollbackFailed { version: 1, .. }));
        assert!(err.to_string().contains("no revert block"));
        assert!(table_exists(fx.db.conn(), "widgets"));
        assert_eq!(Database::schema_version(fx.db.conn()).unwrap(), 1);
    }

    #[test]
    fn test_rollback_steps_newest_first() {
        let mut fx = Fixture::new();
        let one = fx.write("001_a.sql", "CREATE TABLE IF NOT EXISTS a (x INTEGER);", "DROP TABLE a;");
        let two = fx.write("002_b.sql", "CREATE TABLE IF NOT EXISTS b (x INTEGER);", "DROP TABLE b;");
        let three = fx.write("003_c.sql", "CREATE TABLE IF NOT EXISTS c (x INTEGER);", "DROP TABLE c;");
        for file in [&one, &two, &three] {
            fx.executor().run_migration(file, None).unwrap();
        }

        let reverted = fx.executor().rollback_steps(2).unwrap();

        assert_eq!(reverted, vec![3, 2]);
        assert!(table_exists(fx.db.conn(), "a"));
        assert!(!table_exists(fx.db.conn(), "b"));
        assert_eq!(Database::schema_version(fx.db.conn()).unwrap(), 1);

        let reverted = fx.executor().rollback_all().unwrap();
        assert_eq!(reverted, vec![1]);
        assert_eq!(Database::schema_version(fx.db.conn()).unwrap(), 0);
    }

    #[test]
    fn test_retry_increments_retry_count() {
        let mut fx = Fixture::new();
        let file = fx.write("001_late.sql", "INSERT INTO late VALUES (1);", "");

        let (source, mut record) = match fx.executor().run_migration(&file, None).unwrap() {
            RunOutcome::Failed { source, record, .. } => (source, record),
            other => panic!("unexpected outcome: {:?}", other),
        };

        fx.db
            .conn()
            .execute_batch("CREATE TABLE late (x INTEGER);")
            .unwrap();
        fx.executor().retry(&source, &mut record).unwrap();

        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.retry_count, 1);
        let stored = HistoryStore::get_by_id(fx.db.conn(), record.id).unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.status, RecordStatus::Completed);
    }

    #[test]
    fn test_restore_backup_keeps_batch_history() {
        let mut fx = Fixture::new();
        let backup = backup_in(fx.dir.path(), fx.db.conn());
        let one = fx.write("001_a.sql", "CREATE TABLE IF NOT EXISTS a (x INTEGER);", "DROP TABLE a;");
        let two = fx.write("002_b.sql", "INSERT INTO nowhere VALUES (1);", "");

        fx.executor().run_migration(&one, Some(&backup)).unwrap();
        fx.executor().run_migration(&two, Some(&backup)).unwrap();

        fx.executor().restore_backup(&backup).unwrap();

        assert!(!table_exists(fx.db.conn(), "a"));
        assert_eq!(Database::schema_version(fx.db.conn()).unwrap(), 0);
        let records = HistoryStore::all_records(fx.db.conn()).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == RecordStatus::RolledBack));
        assert!(records
            .iter()
            .all(|r| r.backup_path.as_deref() == Some(backup.path_string().as_str())));
    }
}
