//! Configuration change reaction tests
//!
//! Reactions are invoked directly for the report-level assertions and through
//! the running engine's file watcher for the broker switch.


use bms_mqtt_client::config::FlagOverrides;
use bms_mqtt_client::engine::{FieldChange, LevelOutcome};
use bms_mqtt_client::observability::LogLevel;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_helpers::{wait_until, TestEngine};
use tokio::sync::Notify;

#[tokio::test]
async fn test_level_change_is_applied_live() {
    let t = TestEngine::new();
    t.edit_config(|c| c.app.logging.level = "warn".to_string());

    let report = t.engine.on_config_change().await.unwrap();

    assert_eq!(report.level, LevelOutcome::Applied(LogLevel::Warn));
    assert_eq!(report.warnings, 0);
    assert!(!report.reconnected);
    assert_eq!(t.engine.log_level().current(), LogLevel::Warn);
    assert_eq!(t.engine.config().snapshot().app.logging.level, "warn");
}

#[tokio::test]
async fn test_debug_mode_pins_the_level() {
    let t = TestEngine::with(
        |_| {},
        FlagOverrides {
            environment: None,
            debug_mode: true,
        },
    );
    t.edit_config(|c| c.app.logging.level = "error".to_string());

    let report = t.engine.on_config_change().await.unwrap();

    assert_eq!(report.level, LevelOutcome::RejectedDebugMode);
    assert_eq!(report.warnings, 1);
    assert_eq!(t.engine.log_level().current(), LogLevel::Debug);
}

/// Log sink shared between the test and a thread-local subscriber
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CapturedLogs {
    fn at_level(&self, level: &str) -> Vec<serde_json::Value> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
            .filter(|event| event["level"] == level)
            .collect()
    }
}

#[tokio::test]
async fn test_debug_mode_edit_to_debug_warns_once() {
    let logs = CapturedLogs::default();
    let sink = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_writer(move || sink.clone())
        .finish();
    let _default = tracing::subscriber::set_default(subscriber);

    let t = TestEngine::with(
        |_| {},
        FlagOverrides {
            environment: None,
            debug_mode: true,
        },
    );
    t.edit_config(|c| c.app.logging.level = "debug".to_string());

    let report = t.engine.on_config_change().await.unwrap();

    assert_eq!(report.level, LevelOutcome::RejectedDebugMode);
    assert_eq!(t.engine.log_level().current(), LogLevel::Debug);
    let warnings = logs.at_level("WARN");
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0]["fields"]["message"]
        .as_str()
        .unwrap()
        .starts_with("Debug mode is active"));
    assert_eq!(warnings[0]["fields"]["requested"], "debug");
}

#[tokio::test]
async fn test_unrecognized_level_keeps_current() {
    let t = TestEngine::new();
    t.edit_config(|c| c.app.logging.level = "verbose".to_string());

    let report = t.engine.on_config_change().await.unwrap();

    assert_eq!(
        report.level,
        LevelOutcome::RejectedInvalid("verbose".to_string())
    );
    assert_eq!(report.warnings, 1);
    assert_eq!(t.engine.log_level().current(), LogLevel::Info);
}

#[tokio::test]
async fn test_format_change_only_warns() {
    let t = TestEngine::new();
    t.edit_config(|c| c.app.logging.format = "pretty".to_string());

    let report = t.engine.on_config_change().await.unwrap();

    assert_eq!(report.restart_required, vec!["format"]);
    assert_eq!(report.level, LevelOutcome::Unchanged);
    assert_eq!(report.warnings, 1);
    assert!(report.mqtt_changes.is_empty());
    assert!(!report.reconnected);
}

#[tokio::test]
async fn test_malformed_file_leaves_configuration_untouched() {
    let t = TestEngine::new();
    std::fs::write(&t.config_path, "[app.mqtt\nbroker = ").unwrap();

    assert!(t.engine.on_config_change().await.is_none());
    assert_eq!(t.engine.config().snapshot().app.mqtt.broker, "test.broker");
    assert_eq!(t.broker.connect_attempts(), 0);
}

#[tokio::test]
async fn test_credential_changes_are_redacted_and_reconnect() {
    let t = TestEngine::new();
    t.edit_config(|c| {
        c.app.mqtt.username = "operator".to_string();
        c.app.mqtt.password = "hunter2".to_string();
    });

    let report = t.engine.on_config_change().await.unwrap();

    assert!(report.reconnected);
    assert_eq!(
        report.mqtt_changes,
        vec![
            FieldChange {
                field: "username",
                old: "***".to_string(),
                new: "***".to_string(),
            },
            FieldChange {
                field: "password",
                old: "***".to_string(),
                new: "***".to_string(),
            },
        ]
    );
    assert!(
        wait_until(Duration::from_secs(3), || {
            t.status("mqtt.status").as_deref() == Some("connected")
        })
        .await
    );
}

#[tokio::test]
async fn test_broker_switch_never_reports_stale_connection() {
    let t = TestEngine::new();
    let signal = Arc::new(Notify::new());
    let fired = signal.clone();
    let engine = t.engine.clone();
    let run = tokio::spawn(async move {
        engine
            .run_with_signal(async move { fired.notified().await })
            .await
            .unwrap();
    });
    assert!(
        wait_until(Duration::from_secs(3), || {
            t.status_on_disk("mqtt.status").as_deref() == Some("connected")
        })
        .await
    );

    t.broker.gate("new.broker");
    t.edit_config(|c| c.app.mqtt.broker = "new.broker".to_string());

    assert!(
        wait_until(Duration::from_secs(3), || {
            t.broker.hosts().last().map(String::as_str) == Some("new.broker")
        })
        .await
    );
    // The new broker has not answered yet; nothing may claim a connection
    for _ in 0..20 {
        assert_eq!(
            t.status_on_disk("mqtt.status").as_deref(),
            Some("disconnected")
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    t.broker.release("new.broker");
    assert!(
        wait_until(Duration::from_secs(3), || {
            t.status_on_disk("mqtt.status").as_deref() == Some("connected")
        })
        .await
    );
    assert_eq!(t.broker.max_active_sessions(), 1);
    assert_eq!(
        t.broker.hosts(),
        vec!["test.broker".to_string(), "new.broker".to_string()]
    );

    signal.notify_one();
    run.await.unwrap();
}
