//! Testing utilities and mock implementations
//!
//! Lets the engine and broker connection run without a live MQTT broker.

pub mod mocks;

pub use mocks::*;
