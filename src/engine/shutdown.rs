//! Shutdown coordination: OS signals and the sentinel stop file.
//!
//! Two triggers are raced. The stop-file watcher polls for the sentinel and
//! cancels a single-fire token when it appears; the signal path resolves a
//! future. [`ShutdownCoordinator::wait`] returns whichever is observed first,
//! and is also released if the root scope is cancelled from elsewhere.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What ended the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Signal,
    StopFile,
    Cancelled,
}

impl std::fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownTrigger::Signal => f.write_str("signal"),
            ShutdownTrigger::StopFile => f.write_str("stop file"),
            ShutdownTrigger::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Merges the shutdown triggers into one observation
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    root: CancellationToken,
    stop_file: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(root: CancellationToken, stop_file: CancellationToken) -> Self {
        Self { root, stop_file }
    }

    /// Wait for the first trigger
    pub async fn wait<F>(&self, signal: F) -> ShutdownTrigger
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = self.stop_file.cancelled() => ShutdownTrigger::StopFile,
            _ = self.root.cancelled() => ShutdownTrigger::Cancelled,
            _ = signal => ShutdownTrigger::Signal,
        }
    }

    /// Poll for `path` every `interval` until it exists or `scope` is cancelled
    pub fn spawn_stop_file_watcher(
        &self,
        path: impl Into<PathBuf>,
        interval: Duration,
        scope: CancellationToken,
    ) -> JoinHandle<()> {
        let path = path.into();
        let fired = self.stop_file.clone();
        tokio::spawn(async move { watch_stop_file(&path, interval, scope, fired).await })
    }
}

async fn watch_stop_file(
    path: &Path,
    interval: Duration,
    scope: CancellationToken,
    fired: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = scope.cancelled() => {
                debug!("Stop file watcher cancelled");
                return;
            }
            _ = ticker.tick() => {
                if tokio::fs::try_exists(path).await.unwrap_or(false) {
                    info!(path = %path.display(), "Stop file detected");
                    fired.cancel();
                    return;
                }
            }
        }
    }
}

/// Resolve on SIGINT, SIGTERM or SIGQUIT (Ctrl-C elsewhere)
#[cfg(unix)]
pub async fn wait_for_os_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut sigint), Ok(mut sigterm), Ok(mut sigquit)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    ) else {
        tracing::warn!("Failed to install signal handlers, falling back to Ctrl-C");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigquit.recv() => info!("Received SIGQUIT"),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_os_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl-C");
    }
}
