//! Broker connection: one logical connection with automatic reconnection
//!
//! `connect`, `disconnect` and `subscribe` are serialized by an internal
//! mutex. Session events are consumed by a pump task; an unsolicited loss
//! starts a reconnection loop on that task when `reconnect_on_failure` is set.
//! `disconnect` cancels the connection's token before taking the mutex so an
//! in-progress reconnection observes cancellation at its next check.
//! Every loss and every successful reconnection is also queued as a
//! [`LinkEvent`] for a single consumer.

use super::connection::{classify_connect_error, ConnectionSettings, ConnectionState, MqttError};
use crate::transport::{BrokerSession, MessageHandler, SessionEvent};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Link transition after the initial connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Lost,
    Restored,
}

pub struct BrokerConnection {
    settings: ConnectionSettings,
    session: Arc<dyn BrokerSession>,
    token: CancellationToken,
    op_lock: Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    subscription: std::sync::Mutex<Option<MessageHandler>>,
    closed: AtomicBool,
    reconnections: AtomicU32,
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("client_id", &self.settings.client_id)
            .field("broker", &self.settings.broker)
            .field("state", &self.state())
            .finish()
    }
}

impl BrokerConnection {
    /// Create a connection scoped to a child of `parent`
    ///
    /// Must be called within a tokio runtime; the event pump is spawned here.
    pub fn new(
        settings: ConnectionSettings,
        session: Arc<dyn BrokerSession>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let token = parent.child_token();

        let connection = Arc::new(Self {
            settings,
            session,
            token: token.clone(),
            op_lock: Mutex::new(()),
            state_tx,
            events_tx,
            link_tx,
            link_rx: std::sync::Mutex::new(Some(link_rx)),
            subscription: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            reconnections: AtomicU32::new(0),
        });

        tokio::spawn(pump_events(Arc::downgrade(&connection), events_rx, token));
        connection
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn client_id(&self) -> &str {
        &self.settings.client_id
    }

    pub fn topic(&self) -> &str {
        &self.settings.topic
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Take the link event queue; only the first caller gets it
    pub fn take_link_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.link_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.session.is_connected()
    }

    /// True once `disconnect` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of successful reconnections after unsolicited loss
    pub fn reconnections(&self) -> u32 {
        self.reconnections.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Connect and wait for the broker's answer
    pub async fn connect(&self) -> Result<(), MqttError> {
        let _guard = self.op_lock.lock().await;
        if self.token.is_cancelled() {
            return Err(MqttError::Cancelled);
        }

        let reconnecting = matches!(self.state(), ConnectionState::Reconnecting(_));
        if !reconnecting {
            self.set_state(ConnectionState::Connecting);
        }

        info!(
            broker = %self.settings.broker,
            port = self.settings.port,
            client_id = %self.settings.client_id,
            "Connecting to MQTT broker"
        );

        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(MqttError::Cancelled),
            result = self.session.connect(&self.settings, self.events_tx.clone()) => {
                result.map_err(|e| classify_connect_error(e, &self.settings))
            }
        };

        match result {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!(client_id = %self.settings.client_id, "Connected to MQTT broker");
                Ok(())
            }
            Err(e) => {
                if !reconnecting {
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(e)
            }
        }
    }

    /// Subscribe to the configured topic at the configured QoS
    pub async fn subscribe(&self, handler: MessageHandler) -> Result<(), MqttError> {
        let _guard = self.op_lock.lock().await;
        self.subscribe_locked(handler).await
    }

    async fn subscribe_locked(&self, handler: MessageHandler) -> Result<(), MqttError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(MqttError::NotConnected { state });
        }

        *self
            .subscription
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(handler.clone());

        self.session
            .subscribe(&self.settings.topic, self.settings.qos, handler)
            .await
            .map_err(MqttError::SubscriptionFailed)?;

        info!(
            topic = %self.settings.topic,
            qos = ?self.settings.qos,
            "Subscribed to topic"
        );
        Ok(())
    }

    /// Close the connection and stop any reconnection in progress
    ///
    /// Idempotent. Returns true only for the call that closed a live session.
    pub async fn disconnect(&self) -> bool {
        self.token.cancel();
        let _guard = self.op_lock.lock().await;

        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(client_id = %self.settings.client_id, "Connection already closed");
            return false;
        }

        let was_connected = self.session.is_connected();
        self.session.disconnect(self.settings.disconnect_grace).await;
        self.set_state(ConnectionState::Disconnected);

        if was_connected {
            info!(client_id = %self.settings.client_id, "Disconnected from MQTT broker");
        }
        was_connected
    }

    async fn handle_connection_lost(&self, reason: String) {
        if self.token.is_cancelled() || self.is_closed() {
            return;
        }
        warn!(
            client_id = %self.settings.client_id,
            reason = %reason,
            "MQTT connection lost"
        );
        self.set_state(ConnectionState::Disconnected);
        let _ = self.link_tx.send(LinkEvent::Lost);

        if !self.settings.reconnect_on_failure {
            return;
        }

        let mut attempt = 0u32;
        loop {
            if self.token.is_cancelled() {
                self.reconnection_cancelled();
                return;
            }
            attempt += 1;
            self.set_state(ConnectionState::Reconnecting(attempt));

            match self.reconnect().await {
                Ok(()) => {
                    self.reconnections.fetch_add(1, Ordering::SeqCst);
                    let _ = self.link_tx.send(LinkEvent::Restored);
                    info!(
                        client_id = %self.settings.client_id,
                        attempt,
                        "Reconnected to MQTT broker"
                    );
                    return;
                }
                Err(MqttError::Cancelled) => {
                    self.reconnection_cancelled();
                    return;
                }
                Err(e) => {
                    warn!(
                        client_id = %self.settings.client_id,
                        attempt,
                        error = %e,
                        "Reconnection attempt failed"
                    );
                }
            }

            tokio::select! {
                _ = self.token.cancelled() => {
                    self.reconnection_cancelled();
                    return;
                }
                _ = tokio::time::sleep(self.settings.reconnect_interval) => {}
            }
        }
    }

    fn reconnection_cancelled(&self) {
        self.set_state(ConnectionState::Disconnected);
        info!(client_id = %self.settings.client_id, "Reconnection cancelled");
    }

    async fn reconnect(&self) -> Result<(), MqttError> {
        self.connect().await?;

        let handler = self
            .subscription
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(handler) = handler {
            let _guard = self.op_lock.lock().await;
            if let Err(e) = self.subscribe_locked(handler).await {
                if self.token.is_cancelled() {
                    return Err(MqttError::Cancelled);
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

async fn pump_events(
    connection: Weak<BrokerConnection>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(connection) = connection.upgrade() else {
            break;
        };

        match event {
            SessionEvent::Connected => {
                debug!(client_id = %connection.settings.client_id, "Broker acknowledged session");
            }
            SessionEvent::ConnectionLost(reason) => connection.handle_connection_lost(reason).await,
        }
    }
}
