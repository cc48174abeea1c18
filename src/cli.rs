use std::path::PathBuf;

use clap::{Parser, Subcommand};
use flexi_logger::{Logger, LoggerHandle};
use log::{debug, error, info, warn};

use schemaguard::{Config, MigrationManager, SchemaGuardError};

#[derive(Parser)]
#[command(
    name = "schemaguard",
    version,
    about = "SchemaGuard: idempotent, recoverable schema migrations for SQLite"
)]
pub struct Cli {
    /// Configuration file (default: config.toml in the platform config directory)
    #[arg(long = "config", short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overrides [database] path
    #[arg(long = "db", global = true)]
    pub db: Option<PathBuf>,

    /// Migrations directory, overrides [migrations] dir
    #[arg(long = "migrations-dir", short = 'm', global = true)]
    pub migrations_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Apply all pending migrations
    Migrate {
        /// Validate and report without executing anything
        #[arg(long = "dry-run", default_value_t = false)]
        dry_run: bool,
    },

    /// Revert the most recently applied migrations
    Rollback {
        /// Number of versions to revert
        #[arg(long = "steps", short = 'n', default_value_t = 1)]
        steps: u32,
    },

    /// Revert every applied migration
    Reset,

    /// Show current and target versions, pending and failed migrations
    Status {
        /// Print the report as JSON
        #[arg(long = "json", default_value_t = false)]
        json: bool,
    },

    /// Create an empty migration file as the next version
    Create {
        /// Migration name; spaces become underscores
        name: String,
    },

    /// Mark an interrupted (still running) migration as failed after manual review
    Resolve {
        /// Version of the interrupted migration
        version: i64,
    },

    /// List database backups
    Backups {
        /// Delete backups older than the retention window first
        #[arg(long = "prune", default_value_t = false)]
        prune: bool,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), SchemaGuardError> {
        let args = Cli::parse();

        let mut config = Config::load_config(args.config.as_deref())?;
        if let Some(db) = args.db {
            config.database.path = db;
        }
        if let Some(dir) = args.migrations_dir {
            config.migrations.dir = dir;
        }

        // Held until the command finishes so buffered log lines are flushed
        let _logger = Self::setup_logging(&config);
        debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

        let result = MigrationManager::open(&config).and_then(|manager| {
            let result = Self::run_command(&manager, args.command);
            let closed = manager.close();
            result.and(closed)
        });

        if let Err(err) = &result {
            error!("{:?}", err);
        }
        result
    }

    /// `RUST_LOG` takes precedence over the configured level.
    fn setup_logging(config: &Config) -> Option<LoggerHandle> {
        let spec = format!("schemaguard={}", config.logging.schemaguard);

        match Logger::try_with_env_or_str(&spec).and_then(|logger| logger.log_to_stderr().start()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                eprintln!("Failed to initialize logging: {}", e);
                None
            }
        }
    }

    fn run_command(manager: &MigrationManager, command: Command) -> Result<(), SchemaGuardError> {
        match command {
            Command::Migrate { dry_run } => {
                if dry_run {
                    manager.set_dry_run_mode(true);
                }
                let report = manager.migrate()?;

                if report.dry_run {
                    println!("Would apply: {:?}", report.would_apply);
                } else {
                    println!("Applied: {:?}", report.applied);
                }
                if !report.skipped.is_empty() {
                    println!("Skipped (still pending): {:?}", report.skipped);
                }
                if let Some(backup) = report.backup {
                    println!("Backup: {}", backup.display());
                }
                Ok(())
            }
            Command::Rollback { steps } => {
                let reverted = manager.rollback(steps)?;
                println!("Reverted: {:?}", reverted);
                Ok(())
            }
            Command::Reset => {
                warn!("Reverting all applied migrations");
                let reverted = manager.reset()?;
                println!("Reverted: {:?}", reverted);
                Ok(())
            }
            Command::Status { json } => {
                let report = manager.status()?;
                if json {
                    let out = serde_json::to_string_pretty(&report)
                        .map_err(|e| SchemaGuardError::Error(format!("Failed to serialize status: {}", e)))?;
                    println!("{}", out);
                } else {
                    report.print();
                }
                Ok(())
            }
            Command::Create { name } => {
                let path = manager.create_migration(&name)?;
                println!("{}", path.display());
                Ok(())
            }
            Command::Resolve { version } => {
                let count = manager.resolve_interrupted(version)?;
                info!("Resolved {} record(s) for version {}", count, version);
                println!("Marked version {} as failed; it will run again on the next migrate", version);
                Ok(())
            }
            Command::Backups { prune } => {
                if prune {
                    for removed in manager.prune_backups()? {
                        println!("Removed {}", removed.display());
                    }
                }
                for backup in manager.list_backups()? {
                    println!("{}  {} bytes", backup.path().display(), backup.size_bytes());
                }
                Ok(())
            }
        }
    }
}
