//! Integration tests for telemetry initialization and span helpers.

use relaybus::Error;
use relaybus::telemetry::{TelemetryConfig, init_telemetry, worker};
use uuid::Uuid;

#[test]
fn telemetry_initializes_without_endpoint() {
    // The global subscriber can only be set once per process; a second
    // init in the same binary may return Err, which is acceptable here.
    let config = TelemetryConfig {
        log_level: "debug".to_string(),
        ..TelemetryConfig::default()
    };
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        assert!(guard.flush().is_ok());
    }
}

#[test]
fn unparsable_log_level_is_a_config_error() {
    if std::env::var_os("RUST_LOG").is_some() {
        // RUST_LOG takes precedence over log_level.
        return;
    }
    let config = TelemetryConfig {
        log_level: "relaybus=loud".to_string(),
        ..TelemetryConfig::default()
    };
    assert!(matches!(init_telemetry(config), Err(Error::Config(_))));
}

#[test]
fn worker_span_creates_and_records_transition() {
    let id = Uuid::new_v4();
    let span = worker::start_worker_span("dequeue", "experience", &id);
    worker::record_state_transition(&span, "running", "stopping");
    worker::record_state_transition(&span, "stopping", "stopped");
}

#[test]
fn default_config_targets_stdout_only() {
    let config = TelemetryConfig::default();
    assert!(config.endpoint.is_none());
    assert!(!config.export_logs);
    assert_eq!(config.service_name, "relaybus");
    assert_eq!(config.log_level, "info");
}
