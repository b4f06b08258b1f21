//! Engine lifecycle tests
//!
//! Drive the engine end to end against the mock broker: startup status,
//! shutdown by signal and by stop file, unsolicited loss and recovery, and
//! the retry loop while the broker refuses connections.


use bms_mqtt_client::transport::SessionError;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{wait_until, TestEngine};
use tokio::sync::Notify;

/// Start the engine with a signal the test fires through the returned `Notify`
fn start(t: &TestEngine) -> (Arc<Notify>, tokio::task::JoinHandle<()>) {
    let signal = Arc::new(Notify::new());
    let fired = signal.clone();
    let engine = t.engine.clone();
    let run = tokio::spawn(async move {
        engine
            .run_with_signal(async move { fired.notified().await })
            .await
            .unwrap();
    });
    (signal, run)
}

async fn connected(t: &TestEngine) -> bool {
    wait_until(Duration::from_secs(3), || {
        t.status("mqtt.status").as_deref() == Some("connected")
    })
    .await
}

#[tokio::test]
async fn test_engine_connects_and_records_status() {
    let t = TestEngine::new();
    let (signal, run) = start(&t);

    assert!(connected(&t).await);
    assert_eq!(t.status_on_disk("mqtt.status").as_deref(), Some("connected"));
    assert_eq!(t.status_on_disk("mqtt.topic").as_deref(), Some("bms"));
    assert!(t
        .status_on_disk("mqtt.client_id")
        .unwrap()
        .starts_with("bms-mqtt-client-"));
    assert_eq!(t.status_on_disk("app.status").as_deref(), Some("running"));
    assert!(t.status_on_disk("app.start_time").is_some());
    assert_eq!(t.broker.hosts(), vec!["test.broker".to_string()]);
    assert_eq!(t.broker.subscriptions().len(), 1);
    assert!(t.dir.path().join("tmp").is_dir());

    signal.notify_one();
    run.await.unwrap();

    assert_eq!(t.status_on_disk("app.status").as_deref(), Some("stopped"));
    assert!(t.status_on_disk("app.duration").is_some());
    assert_eq!(t.status_on_disk("mqtt.status").as_deref(), Some("disconnected"));
    assert!(t.status_on_disk("mqtt.duration").is_some());
    assert_eq!(t.broker.active_sessions(), 0);
    assert!(!t.dir.path().join("tmp").exists());
}

#[tokio::test]
async fn test_connections_log_records_start_and_stop() {
    let t = TestEngine::new();
    let (signal, run) = start(&t);
    assert!(connected(&t).await);

    signal.notify_one();
    run.await.unwrap();

    let log =
        std::fs::read_to_string(t.dir.path().join("connections/connections.log")).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with(": MQTT connection started"));
    assert!(lines[1].ends_with(": MQTT connection stopped"));
}

#[tokio::test]
async fn test_stop_file_triggers_shutdown() {
    let t = TestEngine::new();
    let (_signal, run) = start(&t);
    assert!(connected(&t).await);

    std::fs::write(t.dir.path().join("tmp/stop_signal"), "").unwrap();

    tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .expect("engine did not stop")
        .unwrap();
    assert_eq!(t.status_on_disk("app.status").as_deref(), Some("stopped"));
    assert!(!t.dir.path().join("tmp").exists());
}

#[tokio::test]
async fn test_signal_and_stop_file_together_stop_once() {
    let t = TestEngine::new();
    let (signal, run) = start(&t);
    assert!(connected(&t).await);

    std::fs::write(t.dir.path().join("tmp/stop_signal"), "").unwrap();
    signal.notify_one();
    tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .expect("engine did not stop")
        .unwrap();

    assert!(!t.engine.stop());
    assert!(!t.engine.cleanup().await);
    assert_eq!(t.broker.disconnects(), 1);
    let log =
        std::fs::read_to_string(t.dir.path().join("connections/connections.log")).unwrap();
    assert_eq!(log.matches("MQTT connection stopped").count(), 1);
}

#[tokio::test]
async fn test_shutdown_from_inside_the_process() {
    let t = TestEngine::new();
    let (_signal, run) = start(&t);
    assert!(connected(&t).await);

    t.engine.shutdown();

    tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .expect("engine did not stop")
        .unwrap();
    assert!(t.engine.is_shutdown());
    assert_eq!(t.status("app.status").as_deref(), Some("stopped"));
}

#[tokio::test]
async fn test_unsolicited_loss_is_recorded_then_restored() {
    let t = TestEngine::new();
    let (signal, run) = start(&t);
    assert!(connected(&t).await);

    t.broker.gate("test.broker");
    t.broker.drop_connection();

    assert!(
        wait_until(Duration::from_secs(3), || {
            t.status("mqtt.status").as_deref() == Some("disconnected")
        })
        .await
    );
    t.broker.release("test.broker");
    assert!(connected(&t).await);
    assert_eq!(t.broker.successful_connects(), 2);
    assert_eq!(t.broker.max_active_sessions(), 1);

    signal.notify_one();
    run.await.unwrap();
}

#[tokio::test]
async fn test_immediate_reconnect_still_logs_the_loss() {
    let t = TestEngine::new();
    let (signal, run) = start(&t);
    assert!(connected(&t).await);
    let log_path = t.dir.path().join("connections/connections.log");
    let log_lines = || {
        std::fs::read_to_string(&log_path)
            .map(|log| log.lines().map(str::to_string).collect::<Vec<_>>())
            .unwrap_or_default()
    };

    t.broker.drop_connection();

    assert!(wait_until(Duration::from_secs(3), || t.broker.successful_connects() == 2).await);
    assert!(wait_until(Duration::from_secs(3), || log_lines().len() == 3).await);
    let lines = log_lines();
    assert!(lines[0].ends_with(": MQTT connection started"));
    assert!(lines[1].ends_with(": MQTT connection stopped"));
    assert!(lines[2].ends_with(": MQTT connection started"));
    assert_eq!(t.status("mqtt.status").as_deref(), Some("connected"));

    signal.notify_one();
    run.await.unwrap();
}

#[tokio::test]
async fn test_retries_until_broker_accepts() {
    let t = TestEngine::new();
    t.broker
        .fail_next(SessionError::Transport("connection refused".to_string()), 3);
    let (signal, run) = start(&t);

    assert!(connected(&t).await);
    assert_eq!(t.broker.connect_attempts(), 4);
    assert_eq!(t.broker.successful_connects(), 1);
    assert_eq!(t.broker.max_active_sessions(), 1);

    signal.notify_one();
    run.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_while_retrying_stops_the_loop() {
    let t = TestEngine::new();
    t.broker.fail_next(SessionError::Timeout, usize::MAX);
    let (signal, run) = start(&t);
    assert!(wait_until(Duration::from_secs(2), || t.broker.connect_attempts() >= 3).await);

    signal.notify_one();
    run.await.unwrap();
    let attempts = t.broker.connect_attempts();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(t.broker.connect_attempts(), attempts);
    assert_eq!(t.status("mqtt.status").as_deref(), Some("disconnected"));
    assert_eq!(t.status("app.status").as_deref(), Some("stopped"));
}
