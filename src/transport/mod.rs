//! Transport layer for the broker connection
//!
//! The engine talks to the broker through [`BrokerSession`], a small
//! capability surface (connect, disconnect, subscribe, is-connected) with
//! connection events delivered on a channel. The production implementation is
//! rumqttc-backed; tests substitute `testing::mocks::MockBroker`.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

pub mod mqtt;

pub use mqtt::connection::{ConnectRefusal, ConnectionSettings};
pub use rumqttc::QoS;

/// Lifecycle notifications raised by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Broker acknowledged the connection
    Connected,
    /// An established session was lost without being asked to disconnect
    ConnectionLost(String),
}

/// A message delivered on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub packet_id: u16,
    pub retain: bool,
}

/// Callback invoked for every received message
pub type MessageHandler = Arc<dyn Fn(ReceivedMessage) + Send + Sync>;

/// Transport-level session failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Connection refused by broker: {0}")]
    Refused(ConnectRefusal),
    #[error("Timed out waiting for connection acknowledgement")]
    Timeout,
    #[error("Session is not connected")]
    NotConnected,
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Broker capability surface
///
/// Implementations own at most one live session at a time. A new `connect`
/// replaces whatever session existed before.
#[async_trait::async_trait]
pub trait BrokerSession: Send + Sync {
    /// Connect and block until the broker acknowledges or rejects
    async fn connect(
        &self,
        settings: &ConnectionSettings,
        events: UnboundedSender<SessionEvent>,
    ) -> Result<(), SessionError>;

    /// Close the session, granting in-flight work up to `grace` to settle
    async fn disconnect(&self, grace: Duration);

    /// Subscribe to `topic`, routing received messages to `handler`
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), SessionError>;

    fn is_connected(&self) -> bool;
}

/// Creates fresh sessions for each broker connection
pub trait SessionFactory: Send + Sync {
    fn create(&self) -> Arc<dyn BrokerSession>;
}
