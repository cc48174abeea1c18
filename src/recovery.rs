use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::backup::BackupRef;
use crate::catalog::MigrationSource;
use crate::config::StrategyConfig;
use crate::error::SchemaGuardError;
use crate::history::{MigrationRecord, RecordStatus};

/// Failures no strategy may paper over. The batch stops as soon as one is seen.
static CRITICAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"database corruption|database disk image is malformed|disk full|database or disk is full|out of memory|permission denied|connection refused",
    )
    .unwrap()
});

#[derive(AsRefStr, Display, EnumString, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    Skip,
    Retry,
    Rollback,
    Manual,
}

#[derive(Debug, Clone)]
pub struct RecoveryStrategy {
    name: String,
    error_pattern: Regex,
    action: RecoveryAction,
    max_retries: u32,
    retry_delay: Duration,
    rollback_steps: u32,
    notify_on_failure: bool,
}

impl RecoveryStrategy {
    /// Patterns are matched case-insensitively against the database's error message.
    pub fn new(name: &str, error_pattern: &str, action: RecoveryAction) -> Result<Self, SchemaGuardError> {
        let error_pattern = Regex::new(&format!("(?i){}", error_pattern))?;

        Ok(RecoveryStrategy {
            name: name.to_owned(),
            error_pattern,
            action,
            max_retries: 0,
            retry_delay: Duration::ZERO,
            rollback_steps: 1,
            notify_on_failure: false,
        })
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_rollback_steps(mut self, rollback_steps: u32) -> Self {
        self.rollback_steps = rollback_steps.max(1);
        self
    }

    pub fn with_notify(mut self, notify_on_failure: bool) -> Self {
        self.notify_on_failure = notify_on_failure;
        self
    }

    pub fn from_config(config: &StrategyConfig) -> Result<Self, SchemaGuardError> {
        Ok(Self::new(&config.name, &config.error_pattern, config.action)?
            .with_retries(config.max_retries, Duration::from_millis(config.retry_delay_ms))
            .with_rollback_steps(config.rollback_steps)
            .with_notify(config.notify_on_failure))
    }

    /// Used when nothing matches and auto-rollback is on.
    pub fn auto_rollback() -> Result<Self, SchemaGuardError> {
        Ok(Self::new("auto_rollback", "", RecoveryAction::Rollback)?.with_notify(true))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> RecoveryAction {
        self.action
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn rollback_steps(&self) -> u32 {
        self.rollback_steps
    }

    pub fn notify_on_failure(&self) -> bool {
        self.notify_on_failure
    }

    pub fn matches(&self, message: &str) -> bool {
        self.error_pattern.is_match(&message.to_lowercase())
    }
}

/// How a failed migration was dealt with when recovery did not end in an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The failure was tolerated. The record stays `failed` and will be tried again next run.
    Skipped { strategy: String },
    /// A retry attempt completed the migration.
    Recovered { attempts: u32 },
    /// Earlier versions were reverted and the failed record marked `rolled_back`.
    RolledBack { reverted: Vec<i64> },
    /// A revert step failed and the database was restored from the batch's backup.
    RestoredFromBackup { backup: PathBuf },
}

/// The side effects recovery needs. Implemented by the executor.
pub trait RecoveryTarget {
    /// Move `record` from `failed` back to `running` and run the apply block once more.
    fn retry(&mut self, source: &MigrationSource, record: &mut MigrationRecord) -> Result<(), SchemaGuardError>;

    /// Revert up to `steps` of the most recently applied versions, newest first.
    fn revert_latest(&mut self, steps: u32) -> Result<Vec<i64>, SchemaGuardError>;

    fn mark_rolled_back(&mut self, record: &mut MigrationRecord) -> Result<(), SchemaGuardError>;

    /// Restore the snapshot, keeping the history recorded since it was taken.
    fn restore_backup(&mut self, backup: &BackupRef) -> Result<(), SchemaGuardError>;
}

/// Maps execution failures to strategies and carries them out.
pub struct RecoveryEngine {
    enabled: bool,
    auto_rollback: bool,
    custom: Vec<RecoveryStrategy>,
    builtin: Vec<RecoveryStrategy>,
}

impl RecoveryEngine {
    pub fn with_defaults(enabled: bool, auto_rollback: bool) -> Result<Self, SchemaGuardError> {
        let builtin = vec![
            RecoveryStrategy::new("table_exists", r"table .* already exists", RecoveryAction::Skip)?,
            RecoveryStrategy::new("index_exists", r"index .* already exists", RecoveryAction::Skip)?,
            RecoveryStrategy::new(
                "column_exists",
                r"duplicate column name|column .* already exists",
                RecoveryAction::Skip,
            )?,
            RecoveryStrategy::new("constraint_exists", r"constraint .* already exists", RecoveryAction::Skip)?,
            RecoveryStrategy::new("lock_timeout", r"database (?:table )?is locked", RecoveryAction::Retry)?
                .with_retries(5, Duration::from_secs(10))
                .with_notify(true),
            RecoveryStrategy::new("syntax_error", r"syntax error", RecoveryAction::Manual)?.with_notify(true),
            RecoveryStrategy::new("foreign_key_constraint", r"foreign key constraint", RecoveryAction::Rollback)?
                .with_rollback_steps(1)
                .with_notify(true),
        ];

        Ok(RecoveryEngine {
            enabled,
            auto_rollback,
            custom: Vec::new(),
            builtin,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn auto_rollback_enabled(&self) -> bool {
        self.auto_rollback
    }

    /// Registered strategies are consulted before the built-ins, in registration order.
    pub fn register(&mut self, strategy: RecoveryStrategy) {
        self.custom.push(strategy);
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.custom.iter().chain(self.builtin.iter()).map(|s| s.name()).collect()
    }

    pub fn is_critical(&self, message: &str) -> bool {
        CRITICAL_RE.is_match(&message.to_lowercase())
    }

    pub fn select(&self, message: &str) -> Option<&RecoveryStrategy> {
        self.custom
            .iter()
            .chain(self.builtin.iter())
            .find(|s| s.matches(message))
    }

    /// Decide what to do about a failed migration and do it.
    ///
    /// `record` must be the `failed` record for `source`. Errors other than execution
    /// failures are returned unchanged.
    pub fn handle(
        &self,
        target: &mut dyn RecoveryTarget,
        source: &MigrationSource,
        record: &mut MigrationRecord,
        error: SchemaGuardError,
        backup: Option<&BackupRef>,
    ) -> Result<RecoveryOutcome, SchemaGuardError> {
        if !error.is_execution_failure() {
            return Err(error);
        }

        let message = error.failure_message();
        if self.is_critical(&message) {
            error!("Critical error in {}: {}", source.filename(), message);
            return Err(SchemaGuardError::Critical {
                filename: source.filename().to_owned(),
                message,
            });
        }

        if !self.enabled {
            return Err(error);
        }

        let fallback;
        let strategy = match self.select(&message) {
            Some(strategy) => strategy,
            None if self.auto_rollback => {
                fallback = RecoveryStrategy::auto_rollback()?;
                &fallback
            }
            None => return Err(error),
        };

        info!(
            "Applying recovery strategy '{}' ({}) to {}",
            strategy.name(),
            strategy.action(),
            source.filename()
        );

        let result = match strategy.action() {
            RecoveryAction::Skip => {
                warn!("Skipping failed migration {}: {}", source.filename(), message);
                Ok(RecoveryOutcome::Skipped {
                    strategy: strategy.name().to_owned(),
                })
            }
            RecoveryAction::Retry => self.retry(target, strategy, source, record, message),
            RecoveryAction::Rollback => Self::rollback(target, strategy, record, backup),
            RecoveryAction::Manual => Err(SchemaGuardError::ManualIntervention {
                filename: source.filename().to_owned(),
                message,
            }),
        };

        if let Err(e) = &result {
            if strategy.notify_on_failure() {
                error!(
                    target: "schemaguard::notify",
                    "Recovery '{}' for {} did not succeed: {}",
                    strategy.name(),
                    source.filename(),
                    e
                );
            }
        }

        result
    }

    fn retry(
        &self,
        target: &mut dyn RecoveryTarget,
        strategy: &RecoveryStrategy,
        source: &MigrationSource,
        record: &mut MigrationRecord,
        mut last_message: String,
    ) -> Result<RecoveryOutcome, SchemaGuardError> {
        for attempt in 1..=strategy.max_retries() {
            info!(
                "Retrying {} in {:?} (attempt {}/{})",
                source.filename(),
                strategy.retry_delay(),
                attempt,
                strategy.max_retries()
            );
            thread::sleep(strategy.retry_delay());

            match target.retry(source, record) {
                Ok(()) => return Ok(RecoveryOutcome::Recovered { attempts: attempt }),
                Err(e) if e.is_execution_failure() => {
                    let message = e.failure_message();
                    if self.is_critical(&message) {
                        error!("Critical error while retrying {}: {}", source.filename(), message);
                        return Err(SchemaGuardError::Critical {
                            filename: source.filename().to_owned(),
                            message,
                        });
                    }
                    warn!("Retry {} of {} failed: {}", attempt, source.filename(), message);
                    last_message = message;
                }
                Err(e) => return Err(e),
            }
        }

        Err(SchemaGuardError::RetriesExhausted {
            filename: source.filename().to_owned(),
            attempts: strategy.max_retries(),
            message: last_message,
        })
    }

    fn rollback(
        target: &mut dyn RecoveryTarget,
        strategy: &RecoveryStrategy,
        record: &mut MigrationRecord,
        backup: Option<&BackupRef>,
    ) -> Result<RecoveryOutcome, SchemaGuardError> {
        let revert_err = match target.revert_latest(strategy.rollback_steps()) {
            Ok(reverted) => {
                target.mark_rolled_back(record)?;
                return Ok(RecoveryOutcome::RolledBack { reverted });
            }
            Err(e) => e,
        };

        let Some(backup) = backup else {
            return Err(match revert_err {
                e @ SchemaGuardError::RollbackFailed { .. } => e,
                other => SchemaGuardError::RollbackFailed {
                    version: record.version,
                    message: other.to_string(),
                },
            });
        };

        error!(
            "Rollback failed ({}), restoring from backup {}",
            revert_err,
            backup.path().display()
        );
        target
            .restore_backup(backup)
            .map_err(|e| SchemaGuardError::BackupRestoreFailed {
                path: backup.path().to_path_buf(),
                message: e.to_string(),
            })?;

        // The restore re-records this attempt as rolled back
        if record.status == RecordStatus::Failed {
            record.transition(RecordStatus::RolledBack)?;
        }

        Ok(RecoveryOutcome::RestoredFromBackup {
            backup: backup.path().to_path_buf(),
        })
    }
}
