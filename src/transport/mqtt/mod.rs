//! MQTT implementation of the broker transport
//!
//! # Architecture
//!
//! - [`connection`] - Pure connection settings, options and error classification
//! - [`message_handler`] - Pure event routing and message receipt logging
//! - [`session`] - rumqttc-backed [`BrokerSession`](crate::transport::BrokerSession)
//! - [`client`] - [`BrokerConnection`], the serialized connection with reconnection

pub mod client;
pub mod connection;
pub mod message_handler;
pub mod session;

pub use client::{BrokerConnection, LinkEvent};
pub use connection::{
    ConnectRefusal, ConnectionSettings, ConnectionState, CredentialProblem, MqttError,
};
pub use message_handler::{logging_handler, EventRoute};
pub use session::{RumqttcSession, RumqttcSessionFactory};
