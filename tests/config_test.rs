use relaybus::Error;
use relaybus::config::Config;
use secrecy::ExposeSecret;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

// Environment variables are process-global; serialize the tests that touch them.
static ENV_LOCK: Mutex<()> = Mutex::new(());

const VARS: &[&str] = &[
    "REDIS_URL",
    "REDIS_HOST",
    "REDIS_PORT",
    "REDIS_DB",
    "REDIS_PASSWORD",
    "SUBSCRIBE_POLL_INTERVAL_MS",
    "DEQUEUE_BLOCK_TIMEOUT_SECS",
    "OTEL_ENDPOINT",
    "OTEL_EXPORT_LOGS",
    "LOG_LEVEL",
];

fn clear_env() {
    for var in VARS {
        unsafe {
            std::env::remove_var(var);
        }
    }
}

#[test]
fn config_from_env_defaults_to_local_store() {
    let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let config = Config::from_env().unwrap();
    assert_eq!(
        config.store.connection_url().expose_secret(),
        "redis://localhost:6379/0"
    );
    assert_eq!(config.poll_interval, Duration::from_millis(100));
    assert_eq!(config.block_timeout, Duration::from_secs(1));
    assert_eq!(config.log_level, "info");
    assert!(config.otel_endpoint.is_none());
    assert!(!config.otel_export_logs);
}

#[test]
fn config_from_env_reads_overrides() {
    let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    unsafe {
        std::env::set_var("REDIS_HOST", "coord");
        std::env::set_var("REDIS_PORT", "6380");
        std::env::set_var("REDIS_DB", "3");
        std::env::set_var("REDIS_PASSWORD", "s3cret");
        std::env::set_var("SUBSCRIBE_POLL_INTERVAL_MS", "250");
        std::env::set_var("LOG_LEVEL", "relaybus=debug");
        std::env::set_var("OTEL_EXPORT_LOGS", "true");
    }

    let config = Config::from_env().unwrap();
    clear_env();

    assert_eq!(
        config.store.connection_url().expose_secret(),
        "redis://:s3cret@coord:6380/3"
    );
    assert_eq!(config.poll_interval, Duration::from_millis(250));
    assert_eq!(config.log_level, "relaybus=debug");
    assert!(config.otel_export_logs);
    // Debug output never shows the password.
    assert!(!format!("{config:?}").contains("s3cret"));
}

#[test]
fn config_from_env_rejects_malformed_port() {
    let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    unsafe {
        std::env::set_var("REDIS_PORT", "not-a-port");
    }

    let result = Config::from_env();
    clear_env();
    assert!(matches!(result, Err(Error::Config(ref msg)) if msg.contains("REDIS_PORT")));
}

#[test]
fn config_from_file_fills_missing_keys_with_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
poll_interval_ms = 50
log_level = "warn"

[store]
host = "redis.internal"
db = 1
"#
    )
    .unwrap();

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(
        config.store.connection_url().expose_secret(),
        "redis://redis.internal:6379/1"
    );
    assert_eq!(config.poll_interval, Duration::from_millis(50));
    assert_eq!(config.block_timeout, Duration::from_secs(1));
    assert_eq!(config.log_level, "warn");
}

#[test]
fn config_from_file_rejects_zero_block_timeout() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "block_timeout_secs = 0").unwrap();
    assert!(matches!(
        Config::from_file(file.path()),
        Err(Error::Config(_))
    ));
}

#[test]
fn config_from_missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = Config::from_file(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(Error::Config(_))));
}
