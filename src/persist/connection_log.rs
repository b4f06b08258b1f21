//! Append-only log of connection start/stop events.

use chrono::{Local, SecondsFormat};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Line-oriented connection event log, independent of the application log
#[derive(Debug, Clone)]
pub struct ConnectionLog {
    path: PathBuf,
}

impl ConnectionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection_started(&self) {
        self.append("MQTT connection started");
    }

    pub fn connection_stopped(&self) {
        self.append("MQTT connection stopped");
    }

    /// Append `<RFC3339 timestamp>: <event>`; failures are logged only
    pub fn append(&self, event: &str) {
        let line = format!(
            "{}: {}\n",
            Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
            event
        );

        let result = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|_| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
            })
            .and_then(|mut file| file.write_all(line.as_bytes()));

        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "Failed to write connection log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_events_are_appended_in_order() {
        let dir = TempDir::new().unwrap();
        let log = ConnectionLog::new(dir.path().join("connections/connections.log"));

        log.connection_started();
        log.connection_stopped();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(": MQTT connection started"));
        assert!(lines[1].ends_with(": MQTT connection stopped"));

        let (stamp, _) = lines[0].split_once(": ").unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[test]
    fn test_unwritable_path_does_not_panic() {
        let dir = TempDir::new().unwrap();
        let log = ConnectionLog::new(dir.path());
        log.connection_started();
    }
}
