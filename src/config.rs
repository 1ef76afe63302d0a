use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

/// Overrides `[database] path` when set.
pub const DB_PATH_ENV: &str = "LOGLOADER_DB";

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub follow: FollowConfig,
    #[serde(default)]
    pub parser: ParserConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite file, or `:memory:`
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FollowConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ParserConfig {
    /// Tried in order. Empty means the built-in combined and common log
    /// formats.
    #[serde(default)]
    pub patterns: Vec<String>,
}

const DEFAULT_DB_PATH: &str = "weblogs.db";
const DEFAULT_POOL_SIZE: u32 = 10;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_BATCH_SIZE: usize = 1_000;
const DEFAULT_INTERVAL_SECS: u64 = 5;

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_owned()
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_interval_secs() -> u64 {
    DEFAULT_INTERVAL_SECS
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: default_db_path(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            batch_size: default_batch_size(),
        }
    }
}

impl Default for FollowConfig {
    fn default() -> Self {
        FollowConfig {
            interval_secs: default_interval_secs(),
        }
    }
}

impl Config {
    /// Reads the TOML file at `path`. A missing file yields the defaults,
    /// the database path can still be overridden from the environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match fs::read_to_string(path) {
            Ok(raw) => Self::from_toml(&raw)?,
            Err(e) if e.kind() == ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(Error::io(path, e)),
        };
        if let Ok(db_path) = std::env::var(DB_PATH_ENV) {
            if !db_path.trim().is_empty() {
                config.database.path = db_path;
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(Error::Config("database.path cannot be empty".to_owned()));
        }
        if self.database.pool_size == 0 {
            return Err(Error::Config("database.pool_size must be at least 1".to_owned()));
        }
        if self.ingest.batch_size == 0 {
            return Err(Error::Config("ingest.batch_size must be at least 1".to_owned()));
        }
        if self.follow.interval_secs == 0 {
            return Err(Error::Config("follow.interval_secs must be at least 1".to_owned()));
        }
        Ok(())
    }

    pub fn follow_interval(&self) -> Duration {
        Duration::from_secs(self.follow.interval_secs)
    }
}
