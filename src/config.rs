use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::postgres::ConnectionInfo;
use crate::{Error, Result};

#[derive(Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Passwords keyed by subscription name or host address.
    #[serde(default, skip_serializing)]
    pub secrets: HashMap<String, String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut secret_keys: Vec<&String> = self.secrets.keys().collect();
        secret_keys.sort();
        f.debug_struct("Config")
            .field("postgres", &self.postgres)
            .field("monitoring", &self.monitoring)
            .field("logging", &self.logging)
            .field("secrets", &secret_keys)
            .finish()
    }
}

/// The seed connection.
#[derive(Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            database: default_database(),
            username: default_username(),
            password: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Hosts probed concurrently.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Connections per host.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_overall_timeout")]
    pub overall_timeout_secs: u64,
    /// Pause between the two write-position reads of the rate sample.
    #[serde(default = "default_wal_sample_interval")]
    pub wal_sample_interval_ms: u64,
    #[serde(default)]
    pub follow_replication_peers: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            pool_size: default_pool_size(),
            acquire_timeout_secs: default_acquire_timeout(),
            overall_timeout_secs: default_overall_timeout(),
            wal_sample_interval_ms: default_wal_sample_interval(),
            follow_replication_peers: false,
        }
    }
}

impl MonitoringConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_secs)
    }

    pub fn wal_sample_interval(&self) -> Duration {
        Duration::from_millis(self.wal_sample_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Loads `path` (when present) layered under `PG_REPTOOL_*` environment
    /// variables, e.g. `PG_REPTOOL_MONITORING__MAX_WORKERS=4`.
    ///
    /// A missing file is an error only when `required` is set.
    pub fn from_file<P: AsRef<Path>>(path: P, required: bool) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(required))
            .add_source(
                config::Environment::with_prefix("PG_REPTOOL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.postgres.connect_timeout_secs)
    }

    /// Credentials for the seed host.
    ///
    /// Fails when no seed host or no password is configured: without them no
    /// partial result is meaningful.
    pub fn seed_connection(&self) -> Result<ConnectionInfo> {
        let host = self
            .postgres
            .host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                Error::Config(
                    "no seed host configured (use --start-host, PGHOST or postgres.host)"
                        .to_string(),
                )
            })?;
        let password = self.postgres.password.clone().ok_or_else(|| {
            Error::Config(
                "no password configured for the seed host (set PGPASSWORD or postgres.password)"
                    .to_string(),
            )
        })?;

        Ok(ConnectionInfo {
            host: Some(host.to_string()),
            user: Some(self.postgres.username.clone()),
            password: Some(password),
            port: Some(self.postgres.port),
            database: Some(self.postgres.database.clone()),
        })
    }

    /// Checks everything a run needs before any host is contacted.
    pub fn validate(&self) -> Result<()> {
        self.seed_connection()?;
        if self.monitoring.max_workers == 0 {
            return Err(Error::Config("monitoring.max_workers must be at least 1".to_string()));
        }
        if self.monitoring.pool_size == 0 {
            return Err(Error::Config("monitoring.pool_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_username() -> String {
    "postgres".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_workers() -> usize {
    10
}

fn default_pool_size() -> usize {
    5
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_overall_timeout() -> u64 {
    300
}

fn default_wal_sample_interval() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}
