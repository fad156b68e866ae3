use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::db::connectors::DEFAULT_SQLSERVER_PORT;
use crate::db::pool::PoolSettings;
use crate::security::redact_value;

/// Passphrase used when `ENCRYPTION_KEY` is unset. Development only.
pub const DEV_ENCRYPTION_KEY: &str = "sqlaudit-dev-encryption-key";

/// Runtime configuration of the audit engine.
#[derive(Clone, PartialEq)]
pub struct AppConfig {
    /// Directory holding the embedded store.
    pub db_path: PathBuf,
    pub encryption_key: String,
    pub log_level: String,
    pub default_port: u16,
    pub pool: PoolSettings,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("db_path", &self.db_path)
            .field("encryption_key", &redact_value(&self.encryption_key))
            .field("log_level", &self.log_level)
            .field("default_port", &self.default_port)
            .field("pool", &self.pool)
            .finish()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data"),
            encryption_key: DEV_ENCRYPTION_KEY.to_string(),
            log_level: "info".to_string(),
            default_port: DEFAULT_SQLSERVER_PORT,
            pool: PoolSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the process environment, after applying a
    /// `.env` file if one is present.
    ///
    /// | Env Var                     | Default                  |
    /// |-----------------------------|--------------------------|
    /// | `DB_PATH`                   | `./data`                 |
    /// | `ENCRYPTION_KEY`            | dev-only passphrase      |
    /// | `LOG_LEVEL`                 | `info`                   |
    /// | `MSSQL_DEFAULT_PORT`        | `1433`                   |
    /// | `POOL_MAX_OPEN`             | `10`                     |
    /// | `POOL_MAX_IDLE`             | `5`                      |
    /// | `POOL_MAX_LIFETIME_SECS`    | `3600`                   |
    /// | `PING_TIMEOUT_SECS`         | `5`                      |
    /// | `CONNECT_PING_TIMEOUT_SECS` | `10`                     |
    /// | `QUERY_TIMEOUT_SECS`        | `30`                     |
    ///
    /// Unparseable numbers fall back to their default with a warning.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let encryption_key = match text("ENCRYPTION_KEY") {
            Some(key) => key,
            None => {
                log::warn!("ENCRYPTION_KEY not set, using the development key");
                defaults.encryption_key.clone()
            }
        };

        let pool = PoolSettings {
            max_open: number(&lookup, "POOL_MAX_OPEN", defaults.pool.max_open),
            max_idle: number(&lookup, "POOL_MAX_IDLE", defaults.pool.max_idle),
            max_lifetime: seconds(&lookup, "POOL_MAX_LIFETIME_SECS", defaults.pool.max_lifetime),
            ping_timeout: seconds(&lookup, "PING_TIMEOUT_SECS", defaults.pool.ping_timeout),
            connect_ping_timeout: seconds(
                &lookup,
                "CONNECT_PING_TIMEOUT_SECS",
                defaults.pool.connect_ping_timeout,
            ),
            query_timeout: seconds(&lookup, "QUERY_TIMEOUT_SECS", defaults.pool.query_timeout),
        };

        Self {
            db_path: text("DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            encryption_key,
            log_level: text("LOG_LEVEL").unwrap_or(defaults.log_level),
            default_port: number(&lookup, "MSSQL_DEFAULT_PORT", defaults.default_port),
            pool,
        }
    }
}

fn number<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Invalid {}={:?}, using {}", key, raw, default);
                default
            }
        },
    }
}

fn seconds<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_secs(number(lookup, key, default.as_secs()))
}
