//! Observability for the BMS MQTT client
//!
//! Structured logging with a live-adjustable level.

pub mod logging;

pub use logging::{init_logging, LogFormat, LogLevel, LogLevelHandle, LoggingError};
