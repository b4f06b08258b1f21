//! rumqttc-backed broker session
//!
//! Each `connect` builds a fresh `AsyncClient`/`EventLoop` pair and drives the
//! event loop on a spawned task. The task reports the ConnAck outcome back to
//! `connect`, dispatches publishes to the registered handler, and stops
//! polling once the session is lost. rumqttc's own reconnection is never used;
//! reconnection is owned by the broker connection above this layer.

use super::connection::{configure_mqtt_options, ConnectRefusal, ConnectionSettings};
use super::message_handler::{route_mqtt_event, EventRoute};
use crate::transport::{
    BrokerSession, MessageHandler, SessionError, SessionEvent, SessionFactory,
};
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, EventLoop, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedSender, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Capacity of the request channel between `AsyncClient` and `EventLoop`
const REQUEST_CHANNEL_CAPACITY: usize = 10;

type SharedHandler = Arc<std::sync::Mutex<Option<MessageHandler>>>;

struct ActiveSession {
    client: AsyncClient,
    poll_task: JoinHandle<()>,
    closing: Arc<AtomicBool>,
}

/// A broker session over rumqttc's MQTT 3.1.1 client
pub struct RumqttcSession {
    active: Mutex<Option<ActiveSession>>,
    connected: Arc<AtomicBool>,
    handler: SharedHandler,
}

impl Default for RumqttcSession {
    fn default() -> Self {
        Self::new()
    }
}

impl RumqttcSession {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            handler: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    fn abort(session: ActiveSession) {
        session.closing.store(true, Ordering::SeqCst);
        session.poll_task.abort();
    }
}

#[async_trait::async_trait]
impl BrokerSession for RumqttcSession {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
        events: UnboundedSender<SessionEvent>,
    ) -> Result<(), SessionError> {
        let (client, eventloop) =
            AsyncClient::new(configure_mqtt_options(settings), REQUEST_CHANNEL_CAPACITY);
        let (ack_tx, ack_rx) = oneshot::channel();
        let closing = Arc::new(AtomicBool::new(false));

        let poll_task = tokio::spawn(drive_event_loop(
            eventloop,
            ack_tx,
            events,
            self.connected.clone(),
            self.handler.clone(),
            closing.clone(),
        ));

        // Stored before waiting so a disconnect during the handshake can tear it down
        {
            let mut active = self.active.lock().await;
            if let Some(previous) = active.replace(ActiveSession {
                client,
                poll_task,
                closing: closing.clone(),
            }) {
                Self::abort(previous);
            }
        }

        let outcome = match tokio::time::timeout(settings.connect_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Transport(
                "event loop ended before acknowledgement".to_string(),
            )),
            Err(_) => Err(SessionError::Timeout),
        };

        if outcome.is_err() {
            let mut active = self.active.lock().await;
            if active
                .as_ref()
                .is_some_and(|session| Arc::ptr_eq(&session.closing, &closing))
            {
                if let Some(session) = active.take() {
                    Self::abort(session);
                }
            }
            self.connected.store(false, Ordering::SeqCst);
        }
        outcome
    }

    async fn disconnect(&self, grace: Duration) {
        let Some(session) = self.active.lock().await.take() else {
            return;
        };
        session.closing.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);

        if let Err(e) = session.client.try_disconnect() {
            debug!(error = %e, "Disconnect request could not be queued");
        }

        let mut poll_task = session.poll_task;
        if tokio::time::timeout(grace, &mut poll_task).await.is_err() {
            debug!("Event loop did not stop within grace period, aborting");
            poll_task.abort();
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), SessionError> {
        let active = self.active.lock().await;
        let Some(session) = active.as_ref().filter(|_| self.is_connected()) else {
            return Err(SessionError::NotConnected);
        };

        *self.handler.lock().unwrap_or_else(|p| p.into_inner()) = Some(handler);
        session
            .client
            .subscribe(topic, qos)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for RumqttcSession {
    fn drop(&mut self) {
        if let Some(session) = self.active.get_mut().take() {
            Self::abort(session);
        }
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    ack_tx: oneshot::Sender<Result<(), SessionError>>,
    events: UnboundedSender<SessionEvent>,
    connected: Arc<AtomicBool>,
    handler: SharedHandler,
    closing: Arc<AtomicBool>,
) {
    let mut ack_tx = Some(ack_tx);

    loop {
        match eventloop.poll().await {
            Ok(event) => match route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged(ConnectReturnCode::Success) => {
                    connected.store(true, Ordering::SeqCst);
                    if let Some(tx) = ack_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                    let _ = events.send(SessionEvent::Connected);
                }
                EventRoute::ConnectionAcknowledged(code) => {
                    if let Some(tx) = ack_tx.take() {
                        let _ = tx.send(Err(SessionError::Refused(
                            ConnectRefusal::from_return_code(code),
                        )));
                    }
                    break;
                }
                EventRoute::MessageReceived(message) => {
                    let current = handler.lock().unwrap_or_else(|p| p.into_inner()).clone();
                    if let Some(handler) = current {
                        handler(message);
                    }
                }
                EventRoute::SubscriptionAcknowledged { packet_id, rejected } => {
                    if rejected {
                        warn!(packet_id, "Broker refused subscription");
                    } else {
                        debug!(packet_id, "Subscription acknowledged");
                    }
                }
                EventRoute::Disconnected => {
                    debug!("Broker sent disconnect");
                }
                EventRoute::Infrastructure | EventRoute::OutgoingEvent => {}
            },
            Err(error) => {
                connected.store(false, Ordering::SeqCst);
                if let Some(tx) = ack_tx.take() {
                    let _ = tx.send(Err(map_connection_error(error)));
                } else if !closing.load(Ordering::SeqCst) {
                    let _ = events.send(SessionEvent::ConnectionLost(error.to_string()));
                }
                break;
            }
        }
    }
}

fn map_connection_error(error: ConnectionError) -> SessionError {
    match error {
        ConnectionError::ConnectionRefused(code) => {
            SessionError::Refused(ConnectRefusal::from_return_code(code))
        }
        other => SessionError::Transport(other.to_string()),
    }
}

/// Creates rumqttc sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct RumqttcSessionFactory;

impl SessionFactory for RumqttcSessionFactory {
    fn create(&self) -> Arc<dyn BrokerSession> {
        Arc::new(RumqttcSession::new())
    }
}
