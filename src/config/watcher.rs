//! Configuration file watcher with debounce.
//!
//! Change detection is notify's `PollWatcher` with content comparison, run
//! over the file's directory so replace-by-rename saves are still seen.
//! Matching events are forwarded into a tokio channel; a change arms a
//! debounce deadline and further changes push it out, so a burst of edits
//! produces a single callback once the file has been quiet for `debounce`.

use notify::{Config, Event, PollWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Watches one configuration file for content changes.
#[derive(Debug, Clone)]
pub struct ConfigWatcher {
    path: PathBuf,
    poll_interval: Duration,
    debounce: Duration,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration, debounce: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            debounce,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn watch_root(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Start watching; the debounce task runs until `token` is cancelled.
    pub fn spawn<F>(self, token: CancellationToken, on_change: F) -> Result<JoinHandle<()>, notify::Error>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let target: Option<OsString> = self.path.file_name().map(|name| name.to_os_string());

        let mut watcher = PollWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = (event.kind.is_modify() || event.kind.is_create())
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == target.as_deref());
                    if relevant {
                        let _ = change_tx.send(());
                    }
                }
                Err(e) => warn!(error = %e, "Config watch error"),
            },
            Config::default()
                .with_poll_interval(self.poll_interval)
                .with_compare_contents(true),
        )?;
        watcher.watch(&self.watch_root(), RecursiveMode::NonRecursive)?;

        info!(path = %self.path.display(), "Config watcher started");
        Ok(tokio::spawn(self.run_debounce(watcher, change_rx, token, on_change)))
    }

    async fn run_debounce<F>(
        self,
        // Dropping the watcher stops its polling thread
        _watcher: PollWatcher,
        mut changes: mpsc::UnboundedReceiver<()>,
        token: CancellationToken,
        on_change: F,
    ) where
        F: Fn(),
    {
        let mut deadline: Option<Instant> = None;

        loop {
            let armed = deadline;
            let quiet = async move {
                match armed {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                change = changes.recv() => match change {
                    Some(()) => {
                        debug!(path = %self.path.display(), "Config file content changed");
                        deadline = Some(Instant::now() + self.debounce);
                    }
                    None => break,
                },
                _ = quiet => {
                    deadline = None;
                    on_change();
                }
            }
        }

        info!(path = %self.path.display(), "Config watcher stopped");
    }
}
