//! BMS MQTT client
//!
//! A long-running client that keeps a single subscription to an MQTT topic,
//! persists its runtime status to a JSON document, reacts to configuration
//! edits without restarting, and shuts down gracefully on a signal or when a
//! sentinel stop file appears.
//!
//! # Overview
//!
//! - [`engine`] - the supervisor: run loop, connection loop, config reactions, shutdown
//! - [`transport`] - broker capability traits and the rumqttc implementation
//! - [`persist`] - status document and connection log
//! - [`config`] - TOML configuration and the file watcher
//! - [`observability`] - tracing setup with a live log level
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use bms_mqtt_client::config::{FlagOverrides, SharedConfig};
//! use bms_mqtt_client::engine::Engine;
//! use bms_mqtt_client::observability::init_logging;
//! use bms_mqtt_client::transport::mqtt::RumqttcSessionFactory;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = SharedConfig::load("config/app.toml", FlagOverrides::default())?;
//! let snapshot = config.snapshot();
//! let log_level = init_logging(&snapshot.app.logging, snapshot.flags.debug_mode)?;
//!
//! let engine = Engine::new(config, log_level, Arc::new(RumqttcSessionFactory))?;
//! engine.run().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod persist;
pub mod testing;
pub mod transport;

pub use config::{Config, SharedConfig};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
