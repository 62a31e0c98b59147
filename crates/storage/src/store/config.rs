#![forbid(unsafe_code)]

use std::str::FromStr;
use std::time::Duration;

use sv_core::retention::DEFAULT_MAX_VERSION_COUNT;

pub const ENV_POOL_SIZE: &str = "SPACEVAULT_POOL_SIZE";
pub const ENV_READER_POOL_SIZE: &str = "SPACEVAULT_READER_POOL_SIZE";
pub const ENV_STATEMENT_TIMEOUT_SECS: &str = "SPACEVAULT_STATEMENT_TIMEOUT_SECS";
pub const ENV_MAX_RETRIES: &str = "SPACEVAULT_MAX_RETRIES";
pub const ENV_BUSY_TIMEOUT_MS: &str = "SPACEVAULT_BUSY_TIMEOUT_MS";
pub const ENV_DEFAULT_MAX_VERSION_COUNT: &str = "SPACEVAULT_DEFAULT_MAX_VERSION_COUNT";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    pub db_file_name: String,
    /// Writer connections. SQLite serializes writers, so more than a few only queue.
    pub pool_size: usize,
    pub reader_pool_size: usize,
    pub statement_timeout: Duration,
    pub max_retries: u32,
    pub busy_timeout: Duration,
    /// How often the watchdog looks for attempts past their deadline.
    pub watchdog_tick: Duration,
    /// Retention floor for collections without an explicit count.
    pub default_max_version_count: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_file_name: "spacevault.db".to_string(),
            pool_size: 4,
            reader_pool_size: 8,
            statement_timeout: Duration::from_secs(25),
            max_retries: 2,
            busy_timeout: Duration::from_millis(50),
            watchdog_tick: Duration::from_millis(10),
            default_max_version_count: DEFAULT_MAX_VERSION_COUNT,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides_from(|key| std::env::var(key).ok());
        config
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_from(|key| std::env::var(key).ok());
    }

    /// `lookup` maps a variable name to its raw value. Invalid values are
    /// logged and ignored.
    pub fn apply_env_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = parse_override::<usize>(&lookup, ENV_POOL_SIZE) {
            if value == 0 {
                tracing::warn!("invalid {ENV_POOL_SIZE}, ignoring: must be positive");
            } else {
                self.pool_size = value;
            }
        }
        if let Some(value) = parse_override::<usize>(&lookup, ENV_READER_POOL_SIZE) {
            if value == 0 {
                tracing::warn!("invalid {ENV_READER_POOL_SIZE}, ignoring: must be positive");
            } else {
                self.reader_pool_size = value;
            }
        }
        if let Some(secs) = parse_override::<u64>(&lookup, ENV_STATEMENT_TIMEOUT_SECS) {
            self.statement_timeout = Duration::from_secs(secs);
        }
        if let Some(value) = parse_override::<u32>(&lookup, ENV_MAX_RETRIES) {
            self.max_retries = value;
        }
        if let Some(ms) = parse_override::<u64>(&lookup, ENV_BUSY_TIMEOUT_MS) {
            self.busy_timeout = Duration::from_millis(ms);
        }
        if let Some(value) = parse_override::<u32>(&lookup, ENV_DEFAULT_MAX_VERSION_COUNT) {
            self.default_max_version_count = value;
        }
    }
}

fn parse_override<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("invalid {key}, ignoring: {err}");
            None
        }
    }
}
