use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::SchemaGuardError;
use crate::recovery::RecoveryAction;

const ENV_PREFIX: &str = "SCHEMAGUARD_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub schemaguard: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const SCHEMAGUARD_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            schemaguard: Self::SCHEMAGUARD_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.schemaguard.clone();
        self.schemaguard = self.schemaguard.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.schemaguard.as_str()) {
            eprintln!(
                "Config error: schemaguard log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::SCHEMAGUARD_LEVEL
            );
            self.schemaguard = Self::SCHEMAGUARD_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: PathBuf::from("schemaguard.db"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MigrationsConfig {
    pub dir: PathBuf,
    pub extension: String,
    /// Upper bound for a single migration's apply or revert block. Unset means no limit.
    pub statement_timeout_secs: Option<u64>,
    pub dry_run: bool,
}

impl MigrationsConfig {
    const EXTENSION: &str = "sql";

    fn default() -> Self {
        MigrationsConfig {
            dir: PathBuf::from("migrations"),
            extension: Self::EXTENSION.to_owned(),
            statement_timeout_secs: None,
            dry_run: false,
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.extension.clone();
        self.extension = self.extension.trim().trim_start_matches('.').to_ascii_lowercase();
        if self.extension.is_empty() || !self.extension.chars().all(|c| c.is_ascii_alphanumeric()) {
            eprintln!(
                "Config error: migration extension of '{}' is invalid - using default of '{}'",
                str_original,
                Self::EXTENSION
            );
            self.extension = Self::EXTENSION.to_owned();
        }

        if self.statement_timeout_secs == Some(0) {
            eprintln!("Config error: statement_timeout_secs of 0 is invalid - disabling the timeout");
            self.statement_timeout_secs = None;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupConfig {
    /// Snapshot the database before each batch of migrations
    pub enabled: bool,
    pub dir: PathBuf,
    pub retention_days: u32,
    pub auto_cleanup: bool,
}

impl BackupConfig {
    fn default() -> Self {
        BackupConfig {
            enabled: true,
            dir: PathBuf::from("backups"),
            retention_days: 30,
            auto_cleanup: true,
        }
    }
}

/// A recovery strategy declared in configuration. These take precedence over the
/// built-in strategies.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    pub name: String,
    pub error_pattern: String,
    pub action: RecoveryAction,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_delay_ms: u64,
    #[serde(default = "StrategyConfig::default_rollback_steps")]
    pub rollback_steps: u32,
    #[serde(default)]
    pub notify_on_failure: bool,
}

impl StrategyConfig {
    fn default_rollback_steps() -> u32 {
        1
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecoveryConfig {
    pub enabled: bool,
    /// Roll back one step when a failure matches no strategy
    pub auto_rollback: bool,
    pub strategies: Vec<StrategyConfig>,
}

impl RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            enabled: true,
            auto_rollback: true,
            strategies: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ValidationConfig {
    pub disabled_rules: Vec<String>,
}

impl ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            disabled_rules: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub migrations: MigrationsConfig,
    pub backup: BackupConfig,
    pub recovery: RecoveryConfig,
    pub validation: ValidationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            migrations: MigrationsConfig::default(),
            backup: BackupConfig::default(),
            recovery: RecoveryConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl Config {
    /// Location of the config file when none is given on the command line.
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "schemaguard").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Loads configuration from the given TOML file, or from the default location.
    ///
    /// Defaults are merged with the file (if it exists) and then with `SCHEMAGUARD_`
    /// environment variables, using `__` between nested keys
    /// (`SCHEMAGUARD_BACKUP__ENABLED=false`). When the default location is used and no file
    /// exists yet, the default configuration is written there.
    pub fn load_config(config_path: Option<&Path>) -> Result<Self, SchemaGuardError> {
        let default_config = Config::default();

        let config_path = match config_path {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let path = Self::default_config_path();
                if let Some(path) = &path {
                    Self::write_default_if_missing(path, &default_config);
                }
                path
            }
        };

        let mut figment = Figment::from(Serialized::defaults(default_config));
        if let Some(path) = &config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Config = figment.extract()?;
        config.ensure_valid();

        Ok(config)
    }

    fn write_default_if_missing(config_path: &Path, default_config: &Config) {
        if config_path.exists() {
            return;
        }

        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
                return;
            }
        }

        match toml::to_string_pretty(default_config) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(e) => eprintln!("Failed to serialize default config: {}", e),
        }
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.migrations.ensure_valid();
    }
}
