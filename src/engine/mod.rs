//! Connection-lifecycle supervisor
//!
//! The [`Engine`] owns the live configuration, the log level handle, the
//! status recorder and the broker connection. `run` records process start,
//! launches the config watcher, the stop-file watcher and the first connection
//! loop, then waits for a shutdown trigger. Cleanup always runs before `run`
//! returns, including after a panic inside the run body.
//!
//! # Cancellation
//!
//! A root [`CancellationToken`] is the parent of every scope. Each connection
//! loop runs under a child of the root, and each broker connection under a
//! child of its loop, so cancelling the root stops every task the engine
//! started.

pub mod config_change;
pub mod connection_loop;
pub mod shutdown;
pub mod status;

use crate::config::{ConfigWatcher, RuntimeSection, SharedConfig};
use crate::error::{EngineError, EngineResult};
use crate::observability::LogLevelHandle;
use crate::persist::{ConnectionLog, StatusStore};
use crate::transport::mqtt::BrokerConnection;
use crate::transport::SessionFactory;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use config_change::{ConfigChangeReport, FieldChange, LevelOutcome};
pub use connection_loop::RetryPolicy;
pub use shutdown::{wait_for_os_signal, ShutdownCoordinator, ShutdownTrigger};
pub use status::StatusRecorder;

/// The supervisor
pub struct Engine {
    config: SharedConfig,
    runtime: RuntimeSection,
    log_level: LogLevelHandle,
    status: StatusRecorder,
    sessions: Arc<dyn SessionFactory>,
    connection: Mutex<Option<Arc<BrokerConnection>>>,
    root: CancellationToken,
    stop_file: CancellationToken,
    loop_scope: std::sync::Mutex<CancellationToken>,
    connect_lock: Mutex<()>,
    reaction_lock: Mutex<()>,
    started: AtomicBool,
    stopped: AtomicBool,
    cleaned: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config_path", &self.config.path())
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl Engine {
    /// Build an engine; fails if the status store cannot be opened
    pub fn new(
        config: SharedConfig,
        log_level: LogLevelHandle,
        sessions: Arc<dyn SessionFactory>,
    ) -> EngineResult<Arc<Self>> {
        let runtime = config.snapshot().runtime;
        let store = StatusStore::open(&runtime.persist_file)?;
        let log = ConnectionLog::new(&runtime.connections_log);
        let root = CancellationToken::new();

        Ok(Arc::new(Self {
            config,
            log_level,
            status: StatusRecorder::new(store, log),
            sessions,
            connection: Mutex::new(None),
            loop_scope: std::sync::Mutex::new(root.child_token()),
            root,
            stop_file: CancellationToken::new(),
            connect_lock: Mutex::new(()),
            reaction_lock: Mutex::new(()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            runtime,
        }))
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn status(&self) -> &StatusRecorder {
        &self.status
    }

    pub fn log_level(&self) -> &LogLevelHandle {
        &self.log_level
    }

    /// The connection currently owned by the engine, if any
    pub async fn connection(&self) -> Option<Arc<BrokerConnection>> {
        self.connection.lock().await.clone()
    }

    /// Request shutdown from inside the process
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Run until SIGINT/SIGTERM or the stop file appears
    pub async fn run(self: &Arc<Self>) -> EngineResult<()> {
        self.run_with_signal(wait_for_os_signal()).await
    }

    /// Run until `signal` resolves or the stop file appears
    ///
    /// Idempotent: a second call returns immediately. A panic inside the run
    /// body is logged and followed by the normal cleanup.
    pub async fn run_with_signal<F>(self: &Arc<Self>, signal: F) -> EngineResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Engine is already running");
            return Ok(());
        }

        let tmp_dir = &self.runtime.tmp_dir;
        if let Err(source) = tokio::fs::create_dir_all(tmp_dir).await {
            let e = EngineError::runtime_directory(tmp_dir, source);
            error!(error = %e, "Failed to prepare runtime directory");
            return Err(e);
        }

        let engine = Arc::clone(self);
        let body = tokio::spawn(async move { engine.run_until_shutdown(signal).await });
        match body.await {
            Ok(()) => {}
            Err(e) if e.is_panic() => {
                error!(error = %e, "Recovered from unexpected failure in run loop");
            }
            Err(e) => {
                warn!(error = %e, "Run loop ended abnormally");
            }
        }

        self.cleanup().await;
        Ok(())
    }

    async fn run_until_shutdown<F>(self: Arc<Self>, signal: F)
    where
        F: Future<Output = ()>,
    {
        let config = self.config.snapshot();
        self.status
            .record_app_start(&config.system, &config.flags.environment);
        info!(
            app = %config.system.app_name,
            version = %config.system.full_version(),
            environment = %config.flags.environment,
            "Engine started"
        );

        let config_watcher = ConfigWatcher::new(
            self.config.path(),
            Duration::from_millis(self.runtime.config_poll_interval_ms),
            Duration::from_millis(self.runtime.config_debounce_ms),
        )
        .spawn(self.root.child_token(), self.config_change_callback());
        let config_watcher = match config_watcher {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Config watcher unavailable, hot reload disabled");
                None
            }
        };

        let coordinator = ShutdownCoordinator::new(self.root.clone(), self.stop_file.clone());
        let stop_watcher = coordinator.spawn_stop_file_watcher(
            &self.runtime.stop_file,
            Duration::from_millis(self.runtime.stop_poll_interval_ms),
            self.root.child_token(),
        );

        self.status.reset_connection();
        self.establish_connection();

        let trigger = coordinator.wait(signal).await;
        info!(trigger = %trigger, "Shutdown requested");

        self.teardown_connection().await;
        self.root.cancel();
        self.stop();

        if let Some(config_watcher) = config_watcher {
            let _ = config_watcher.await;
        }
        let _ = stop_watcher.await;
    }

    fn config_change_callback(self: &Arc<Self>) -> impl Fn() + Send + Sync + 'static {
        let engine = Arc::downgrade(self);
        move || {
            if let Some(engine) = engine.upgrade() {
                tokio::spawn(async move {
                    engine.on_config_change().await;
                });
            }
        }
    }

    /// Start a new connection loop, superseding any loop still running
    pub fn establish_connection(self: &Arc<Self>) -> JoinHandle<bool> {
        let scope = self.root.child_token();
        {
            let mut current = self
                .loop_scope
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            current.cancel();
            *current = scope.clone();
        }
        let engine = Arc::clone(self);
        tokio::spawn(engine.run_connection_loop(scope))
    }

    /// Stop the connection loop and close the current connection
    pub async fn teardown_connection(&self) {
        self.loop_scope
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();

        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.take() {
            connection.disconnect().await;
        }
        self.status.connection_stopped();
    }

    /// Record process end. Runs at most once; returns true for that call.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Stop already recorded");
            return false;
        }
        self.status.record_app_stop();
        info!("Engine stopped");
        true
    }

    /// Release everything the engine holds. Runs at most once.
    pub async fn cleanup(&self) -> bool {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            debug!("Cleanup already done");
            return false;
        }

        self.root.cancel();
        self.teardown_connection().await;
        self.stop();

        match tokio::fs::remove_dir_all(&self.runtime.tmp_dir).await {
            Ok(()) => debug!(path = %self.runtime.tmp_dir.display(), "Removed runtime directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.runtime.tmp_dir.display(),
                error = %e,
                "Failed to remove runtime directory"
            ),
        }

        info!("Cleanup complete");
        true
    }
}
