//! Reaction to a changed configuration file
//!
//! The live configuration is snapshotted, the file reloaded, and the two
//! compared. Logging fields other than the level need a restart and only
//! produce a warning. A level change is applied live unless it is empty,
//! pinned by debug mode, or unrecognized. Any MQTT field change tears the
//! connection down and starts a new connection loop after a short pause.

use super::Engine;
use crate::config::{LoggingSection, MqttSection};
use crate::observability::LogLevel;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const REDACTED: &str = "***";

/// Result of evaluating a log level change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LevelOutcome {
    Unchanged,
    Applied(LogLevel),
    RejectedEmpty,
    RejectedDebugMode,
    RejectedInvalid(String),
    /// The level was valid but the subscriber refused the new filter
    ApplyFailed(String),
}

/// One changed MQTT field; credential values are redacted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: &'static str,
    pub old: String,
    pub new: String,
}

/// What a config change reaction did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChangeReport {
    /// Logging fields that changed but only take effect after a restart
    pub restart_required: Vec<&'static str>,
    pub level: LevelOutcome,
    pub mqtt_changes: Vec<FieldChange>,
    /// True if the connection was torn down and a new connection loop started
    pub reconnected: bool,
    pub warnings: usize,
}

/// Logging fields that differ and cannot be applied live
pub fn restart_required_fields(old: &LoggingSection, new: &LoggingSection) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if old.file_path != new.file_path {
        fields.push("file_path");
    }
    if old.format != new.format {
        fields.push("format");
    }
    if old.add_time != new.add_time {
        fields.push("add_time");
    }
    fields
}

/// Decide what to do with a level change, without applying it
pub fn evaluate_level_change(old: &str, new: &str, debug_mode: bool) -> LevelOutcome {
    if old == new {
        return LevelOutcome::Unchanged;
    }
    if new.trim().is_empty() {
        return LevelOutcome::RejectedEmpty;
    }
    if debug_mode {
        return LevelOutcome::RejectedDebugMode;
    }
    match LogLevel::parse(new) {
        Some(level) => LevelOutcome::Applied(level),
        None => LevelOutcome::RejectedInvalid(new.to_string()),
    }
}

/// Every MQTT field that differs, in declaration order
pub fn mqtt_field_changes(old: &MqttSection, new: &MqttSection) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    let mut compare = |field: &'static str, old: String, new: String| {
        if old != new {
            changes.push(FieldChange { field, old, new });
        }
    };

    compare("broker", old.broker.clone(), new.broker.clone());
    compare("port", old.port.to_string(), new.port.to_string());
    compare("client_id", old.client_id.clone(), new.client_id.clone());
    compare("topic", old.topic.clone(), new.topic.clone());
    compare("qos", old.qos.to_string(), new.qos.to_string());
    compare(
        "clean_session",
        old.clean_session.to_string(),
        new.clean_session.to_string(),
    );
    compare("keep_alive", old.keep_alive.to_string(), new.keep_alive.to_string());
    compare(
        "reconnect_on_failure",
        old.reconnect_on_failure.to_string(),
        new.reconnect_on_failure.to_string(),
    );

    for (field, old, new) in [
        ("username", &old.username, &new.username),
        ("password", &old.password, &new.password),
    ] {
        if old != new {
            changes.push(FieldChange {
                field,
                old: REDACTED.to_string(),
                new: REDACTED.to_string(),
            });
        }
    }
    changes
}

impl Engine {
    /// React to a change of the configuration file
    ///
    /// Returns None if the file could not be reloaded; the live configuration
    /// is left untouched in that case.
    pub async fn on_config_change(self: &Arc<Self>) -> Option<ConfigChangeReport> {
        let _serial = self.reaction_lock.lock().await;

        let old = self.config.snapshot();
        let new = match self.config.reload() {
            Ok(config) => config,
            Err(e) => {
                error!(path = %self.config.path().display(), error = %e, "Failed to reload configuration");
                return None;
            }
        };
        self.config.replace(new.clone());
        info!(path = %self.config.path().display(), "Configuration reloaded");

        let mut warnings = 0;

        let restart_required = restart_required_fields(&old.app.logging, &new.app.logging);
        if !restart_required.is_empty() {
            warnings += 1;
            warn!(
                fields = ?restart_required,
                "Logging configuration changed; restart required to apply"
            );
        }

        let level = match evaluate_level_change(
            &old.app.logging.level,
            &new.app.logging.level,
            new.flags.debug_mode,
        ) {
            LevelOutcome::Applied(level) => match self.log_level.set(level) {
                Ok(()) => {
                    info!(level = %level, "Log level changed");
                    LevelOutcome::Applied(level)
                }
                Err(e) => {
                    warnings += 1;
                    warn!(level = %level, error = %e, "Failed to apply log level");
                    LevelOutcome::ApplyFailed(e.to_string())
                }
            },
            LevelOutcome::RejectedEmpty => {
                warnings += 1;
                warn!("Log level is empty; keeping current level");
                LevelOutcome::RejectedEmpty
            }
            LevelOutcome::RejectedDebugMode => {
                warnings += 1;
                warn!(
                    requested = %new.app.logging.level,
                    "Debug mode is active; log level stays at debug"
                );
                LevelOutcome::RejectedDebugMode
            }
            LevelOutcome::RejectedInvalid(requested) => {
                warnings += 1;
                warn!(
                    requested = %requested,
                    valid = ?LogLevel::RECOGNIZED,
                    "Unrecognized log level; keeping current level"
                );
                LevelOutcome::RejectedInvalid(requested)
            }
            other => other,
        };

        let mqtt_changes = mqtt_field_changes(&old.app.mqtt, &new.app.mqtt);
        let mut reconnected = false;
        if !mqtt_changes.is_empty() {
            for change in &mqtt_changes {
                debug!(
                    field = change.field,
                    old = %change.old,
                    new = %change.new,
                    "MQTT configuration changed"
                );
            }
            info!(changed = mqtt_changes.len(), "Reconnecting with new MQTT configuration");

            self.teardown_connection().await;
            let pause = Duration::from_millis(new.runtime.reconnect_pause_ms);
            tokio::select! {
                _ = self.root.cancelled() => {
                    debug!("Shutdown during reconnect pause");
                }
                _ = tokio::time::sleep(pause) => {
                    self.establish_connection();
                    reconnected = true;
                }
            }
        }

        Some(ConfigChangeReport {
            restart_required,
            level,
            mqtt_changes,
            reconnected,
            warnings,
        })
    }
}
