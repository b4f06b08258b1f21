//! Status bookkeeping for the `app.*` and `mqtt.*` sections of the status document

use crate::config::SystemSection;
use crate::persist::{ConnectionLog, StatusStore};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_STOPPED: &str = "stopped";
pub const STATUS_CONNECTED: &str = "connected";
pub const STATUS_DISCONNECTED: &str = "disconnected";

/// Writes lifecycle transitions to the status store and connection log
#[derive(Debug)]
pub struct StatusRecorder {
    store: StatusStore,
    log: ConnectionLog,
    app_started: Mutex<Option<DateTime<Utc>>>,
    connected_since: Mutex<Option<DateTime<Utc>>>,
}

impl StatusRecorder {
    pub fn new(store: StatusStore, log: ConnectionLog) -> Self {
        Self {
            store,
            log,
            app_started: Mutex::new(None),
            connected_since: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    /// Record process start as one `app` object
    pub fn record_app_start(&self, system: &SystemSection, environment: &str) {
        let now = Utc::now();
        *self.app_started.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        self.store.set(
            "app",
            json!({
                "name": system.app_name,
                "version": system.full_version(),
                "environment": environment,
                "status": STATUS_RUNNING,
                "start_time": timestamp(now),
            }),
        );
    }

    /// Record process end; duration is measured from the recorded start
    pub fn record_app_stop(&self) {
        let now = Utc::now();
        let started = *self.app_started.lock().unwrap_or_else(PoisonError::into_inner);
        let started = started.or_else(|| {
            self.store
                .get_str("app.start_time")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc))
        });

        self.store.set("app.status", STATUS_STOPPED);
        self.store.set("app.end_time", timestamp(now));
        if let Some(started) = started {
            self.store
                .set("app.duration", format_duration(elapsed(started, now)));
        }
    }

    /// Clear connection state left over from a previous run
    pub fn reset_connection(&self) {
        *self.connected_since.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.store.set("mqtt", json!({ "status": STATUS_DISCONNECTED }));
    }

    /// Record a live, subscribed session. `status` is written last.
    pub fn connection_started(&self, client_id: &str, topic: &str) {
        let now = Utc::now();
        let mut since = self
            .connected_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *since = Some(now);

        self.store.set("mqtt.client_id", client_id);
        self.store.set("mqtt.topic", topic);
        self.store.set("mqtt.start_time", timestamp(now));
        self.store.set("mqtt.status", STATUS_CONNECTED);
        self.log.connection_started();
    }

    /// Record the end of a session
    ///
    /// A no-op unless a session was recorded or the stored status still reads
    /// connected. Returns true if anything was written.
    pub fn connection_stopped(&self) -> bool {
        let mut since = self
            .connected_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let started = since.take();
        let stale = self.store.get_str("mqtt.status").as_deref() == Some(STATUS_CONNECTED);
        if started.is_none() && !stale {
            return false;
        }

        self.store.set("mqtt.status", STATUS_DISCONNECTED);
        if let Some(started) = started {
            let now = Utc::now();
            self.store.set("mqtt.end_time", timestamp(now));
            self.store
                .set("mqtt.duration", format_duration(elapsed(started, now)));
            self.log.connection_stopped();
        } else {
            debug!("Cleared stale connected status");
        }
        true
    }

    pub fn is_recorded_connected(&self) -> bool {
        self.store.get_str("mqtt.status").as_deref() == Some(STATUS_CONNECTED)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or_default()
}

/// Human-readable duration such as `1h2m3.045s`
pub fn format_duration(duration: Duration) -> String {
    let total_ms = duration.as_millis();
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let seconds = (total_ms / 1000) % 60;
    let millis = total_ms % 1000;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if millis == 0 {
        out.push_str(&format!("{seconds}s"));
    } else {
        let fraction = format!("{millis:03}");
        out.push_str(&format!("{seconds}.{}s", fraction.trim_end_matches('0')));
    }
    out
}
