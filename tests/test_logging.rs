//! Tests for logging initialization and live level changes
//!
//! Installing the global subscriber can only happen once per process, so the
//! subscriber behavior is exercised by a single test in this binary.

use bms_mqtt_client::config::LoggingSection;
use bms_mqtt_client::observability::{init_logging, LogFormat, LogLevel};
use tempfile::TempDir;

#[test]
fn test_log_format_parse() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("COMPACT"), LogFormat::Compact);
    assert_eq!(LogFormat::parse("yaml"), LogFormat::Json);
}

#[test]
fn test_log_level_display_round_trips() {
    for name in LogLevel::RECOGNIZED {
        let level: LogLevel = name.parse().unwrap();
        assert_eq!(level.to_string(), name);
    }
}

#[test]
fn test_live_level_change_filters_file_output() {
    std::env::remove_var("RUST_LOG");
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("logs/app.log");
    let section = LoggingSection {
        level: "info".to_string(),
        file_path: log_path.display().to_string(),
        format: "compact".to_string(),
        add_time: true,
    };

    let handle = init_logging(&section, false).unwrap();
    assert_eq!(handle.current(), LogLevel::Info);

    tracing::info!("before change");
    handle.set(LogLevel::Warn).unwrap();
    tracing::info!("suppressed after change");
    tracing::warn!("warning after change");

    assert_eq!(handle.current(), LogLevel::Warn);
    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("before change"));
    assert!(!content.contains("suppressed after change"));
    assert!(content.contains("warning after change"));
    for line in content.lines() {
        assert!(serde_json::from_str::<serde_json::Value>(line).is_ok());
    }

    // A second subscriber cannot be installed
    assert!(init_logging(&section, false).is_err());
}
