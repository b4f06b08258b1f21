//! Structured logging using the tracing crate
//!
//! The subscriber is a registry with a reloadable `EnvFilter`, a console layer
//! in the configured format and an optional JSON file layer. The filter can be
//! replaced at runtime through [`LogLevelHandle`], which is how live log level
//! changes from the config file are applied.
//!
//! ## Log Format Options
//!
//! - `json` - Structured JSON format for production and log aggregation systems
//! - `pretty` - Human-readable format with colors and indentation for development
//! - `compact` - Terminal-friendly format with colors but minimal spacing
//!
//! `RUST_LOG` overrides the configured level at start-up.

use crate::config::LoggingSection;
use std::env;
use std::fs::OpenOptions;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    filter::ParseError, fmt, layer::Layered, prelude::*, reload, EnvFilter, Layer, Registry,
};

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON format for structured logging (machine-readable)
    Json,
    /// Pretty format with colors and indentation (human-readable)
    Pretty,
    /// Compact format with colors but minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Severities accepted in `app.logging.level`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    DPanic,
    Panic,
    Fatal,
}

impl LogLevel {
    pub const RECOGNIZED: [&'static str; 7] =
        ["debug", "info", "warn", "error", "dpanic", "panic", "fatal"];

    /// Parse a level name, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            "dpanic" => Some(LogLevel::DPanic),
            "panic" => Some(LogLevel::Panic),
            "fatal" => Some(LogLevel::Fatal),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::DPanic => "dpanic",
            LogLevel::Panic => "panic",
            LogLevel::Fatal => "fatal",
        }
    }

    /// The tracing level that gates output for this severity
    pub fn as_tracing(self) -> Level {
        match self {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error | LogLevel::DPanic | LogLevel::Panic | LogLevel::Fatal => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::parse(s).ok_or_else(|| LoggingError::InvalidLevel(s.to_string()))
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log level: {0:?}")]
    InvalidLevel(String),
    #[error("Invalid filter directive: {0}")]
    Filter(#[from] ParseError),
    #[error("Failed to reload log filter: {0}")]
    Reload(#[from] reload::Error),
    #[error("Failed to open log file {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to install global subscriber: {0}")]
    Init(String),
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;
type BaseSubscriber = Layered<reload::Layer<EnvFilter, Registry>, Registry>;
type BoxedLayer = Box<dyn Layer<BaseSubscriber> + Send + Sync>;

/// Handle to the effective log level
///
/// Cloning is cheap; all clones observe the same level.
#[derive(Clone)]
pub struct LogLevelHandle {
    current: Arc<Mutex<LogLevel>>,
    filter: Option<FilterHandle>,
}

impl std::fmt::Debug for LogLevelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogLevelHandle")
            .field("current", &self.current())
            .field("attached", &self.filter.is_some())
            .finish()
    }
}

impl LogLevelHandle {
    /// A handle that tracks the level without a subscriber behind it
    pub fn detached(level: LogLevel) -> Self {
        Self {
            current: Arc::new(Mutex::new(level)),
            filter: None,
        }
    }

    pub fn current(&self) -> LogLevel {
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install `level` as the effective level for all subsequent log statements
    pub fn set(&self, level: LogLevel) -> Result<(), LoggingError> {
        if let Some(filter) = &self.filter {
            filter.reload(build_filter(level)?)?;
        }
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = level;
        Ok(())
    }
}

fn build_filter(level: LogLevel) -> Result<EnvFilter, LoggingError> {
    let filter = EnvFilter::new(level.as_tracing().to_string())
        // Reduce noise from dependencies
        .add_directive("rumqttc=warn".parse()?)
        .add_directive("tokio=warn".parse()?);
    Ok(filter)
}

/// The level logging starts at, before any live change
pub fn initial_level(section: &LoggingSection, debug_mode: bool) -> LogLevel {
    if debug_mode {
        return LogLevel::Debug;
    }
    LogLevel::parse(&section.level).unwrap_or(LogLevel::Info)
}

fn console_layer(format: LogFormat, add_time: bool) -> BoxedLayer {
    match (format, add_time) {
        (LogFormat::Json, true) => fmt::layer().json().boxed(),
        (LogFormat::Json, false) => fmt::layer().json().without_time().boxed(),
        (LogFormat::Pretty, true) => fmt::layer().pretty().with_ansi(true).boxed(),
        (LogFormat::Pretty, false) => fmt::layer().pretty().with_ansi(true).without_time().boxed(),
        (LogFormat::Compact, true) => fmt::layer()
            .compact()
            .with_ansi(true)
            .with_target(false)
            .boxed(),
        (LogFormat::Compact, false) => fmt::layer()
            .compact()
            .with_ansi(true)
            .with_target(false)
            .without_time()
            .boxed(),
    }
}

fn file_layer(path: &Path, add_time: bool) -> Result<BoxedLayer, LoggingError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| LoggingError::LogFile {
            path: path.display().to_string(),
            source,
        })?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::LogFile {
            path: path.display().to_string(),
            source,
        })?;

    let layer = fmt::layer().json().with_ansi(false).with_writer(Mutex::new(file));
    Ok(if add_time {
        layer.boxed()
    } else {
        layer.without_time().boxed()
    })
}

/// Initialize the global subscriber from the logging section
pub fn init_logging(
    section: &LoggingSection,
    debug_mode: bool,
) -> Result<LogLevelHandle, LoggingError> {
    let level = initial_level(section, debug_mode);

    // Allow RUST_LOG to override
    let filter = match env::var("RUST_LOG") {
        Ok(rust_log) if !rust_log.is_empty() => EnvFilter::new(rust_log),
        _ => build_filter(level)?,
    };
    let (filter_layer, filter_handle) = reload::Layer::new(filter);

    let mut layers: Vec<BoxedLayer> = vec![console_layer(LogFormat::parse(&section.format), section.add_time)];
    if !section.file_path.trim().is_empty() {
        layers.push(file_layer(Path::new(&section.file_path), section.add_time)?);
    }

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(layers)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    if LogLevel::parse(&section.level).is_none() && !debug_mode {
        tracing::warn!(
            level = %section.level,
            "Unrecognized log level in config, using info"
        );
    }

    Ok(LogLevelHandle {
        current: Arc::new(Mutex::new(level)),
        filter: Some(filter_handle),
    })
}
