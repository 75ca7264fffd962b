//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup, fails fast on malformed values.
//! The store password and the assembled connection URL are wrapped in
//! `secrecy::SecretString` so they never reach logs.

pub mod secrets;

use crate::error::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Where the backing store lives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Full URL; when set, host/port/db/password are ignored.
    pub url: Option<SecretString>,
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<SecretString>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            db: 0,
            password: None,
        }
    }
}

impl StoreConfig {
    /// `redis://[:password@]host:port/db`, or the explicit URL.
    pub fn connection_url(&self) -> SecretString {
        if let Some(ref url) = self.url {
            return url.clone();
        }
        let auth = match self.password {
            Some(ref pw) => format!(":{}@", pw.expose_secret()),
            None => String::new(),
        };
        SecretString::from(format!(
            "redis://{auth}{}:{}/{}",
            self.host, self.port, self.db
        ))
    }
}

#[derive(Debug)]
pub struct Config {
    pub store: StoreConfig,
    /// Default wait per subscription poll.
    pub poll_interval: Duration,
    /// Server-side bound on each blocking pop before it is re-issued.
    pub block_timeout: Duration,
    pub otel_endpoint: Option<String>,
    /// Ship log events over OTLP as well as traces and metrics.
    pub otel_export_logs: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            otel_endpoint: None,
            otel_export_logs: false,
            log_level: "info".to_string(),
        }
    }
}

/// On-disk layout of the TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    store: StoreConfig,
    poll_interval_ms: Option<u64>,
    block_timeout_secs: Option<u64>,
    otel_endpoint: Option<String>,
    otel_export_logs: bool,
    log_level: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// Every variable is optional; defaults target a local Redis.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Self {
            store: StoreConfig {
                url: optional_var("REDIS_URL").map(SecretString::from),
                host: optional_var("REDIS_HOST").unwrap_or(defaults.store.host),
                port: parsed_var("REDIS_PORT")?.unwrap_or(defaults.store.port),
                db: parsed_var("REDIS_DB")?.unwrap_or(defaults.store.db),
                password: optional_var("REDIS_PASSWORD").map(SecretString::from),
            },
            poll_interval: parsed_var("SUBSCRIBE_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            block_timeout: parsed_var("DEQUEUE_BLOCK_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.block_timeout),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            otel_export_logs: parsed_var("OTEL_EXPORT_LOGS")?.unwrap_or(defaults.otel_export_logs),
            log_level: optional_var("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
        .validated()
    }

    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let file: FileConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))?;
        let defaults = Self::default();
        Self {
            store: file.store,
            poll_interval: file
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            block_timeout: file
                .block_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.block_timeout),
            otel_endpoint: file.otel_endpoint,
            otel_export_logs: file.otel_export_logs,
            log_level: file.log_level.unwrap_or(defaults.log_level),
        }
        .validated()
    }

    fn validated(self) -> Result<Self> {
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be positive".to_string()));
        }
        if self.block_timeout.as_secs() == 0 {
            return Err(Error::Config(
                "dequeue block timeout must be at least one second".to_string(),
            ));
        }
        if self.store.url.is_none() && self.store.host.is_empty() {
            return Err(Error::Config("store host must not be empty".to_string()));
        }
        Ok(self)
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_var(name)
        .map(|raw| {
            raw.parse()
                .map_err(|e| Error::Config(format!("invalid {name}={raw}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_url_includes_password_when_set() {
        let store = StoreConfig {
            password: Some(SecretString::from("hunter2")),
            port: 6380,
            db: 2,
            ..StoreConfig::default()
        };
        assert_eq!(
            store.connection_url().expose_secret(),
            "redis://:hunter2@localhost:6380/2"
        );
    }

    #[test]
    fn explicit_url_wins() {
        let store = StoreConfig {
            url: Some(SecretString::from("redis://cache:7000/0")),
            host: "ignored".to_string(),
            ..StoreConfig::default()
        };
        assert_eq!(store.connection_url().expose_secret(), "redis://cache:7000/0");
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let config = Config {
            poll_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(matches!(config.validated(), Err(Error::Config(_))));
    }
}
