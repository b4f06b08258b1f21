//! Mock broker for testing
//!
//! `MockBroker` implements [`SessionFactory`]; every session it creates
//! reports to shared counters so tests can assert on connection attempts,
//! concurrent sessions and subscriptions without a live broker.

use crate::transport::{
    BrokerSession, ConnectionSettings, MessageHandler, QoS, ReceivedMessage, SessionError,
    SessionEvent, SessionFactory,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;

#[derive(Default)]
struct BrokerState {
    connect_attempts: AtomicUsize,
    successful_connects: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    disconnects: AtomicUsize,
    failure: Mutex<Option<(SessionError, usize)>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    hosts: Mutex<Vec<String>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    sessions: Mutex<Vec<Weak<MockSession>>>,
}

impl BrokerState {
    fn take_failure(&self) -> Option<SessionError> {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        let (error, remaining) = failure.as_mut()?;
        let error = error.clone();
        *remaining -= 1;
        if *remaining == 0 {
            *failure = None;
        }
        Some(error)
    }

    fn session_up(&self) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
    }

    fn session_down(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn live_sessions(&self) -> Vec<Arc<MockSession>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|s| s.strong_count() > 0);
        sessions.iter().filter_map(Weak::upgrade).collect()
    }
}

/// In-memory broker that hands out [`MockSession`]s
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` connect attempts fail with `error`
    pub fn fail_next(&self, error: SessionError, times: usize) {
        *self.state.failure.lock().unwrap_or_else(PoisonError::into_inner) = (times > 0).then_some((error, times));
    }

    /// Hold connects to `host` until [`MockBroker::release`] is called
    pub fn gate(&self, host: &str) {
        self.state
            .gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.to_string(), Arc::new(Notify::new()));
    }

    pub fn release(&self, host: &str) {
        if let Some(gate) = self.state.gates.lock().unwrap_or_else(PoisonError::into_inner).remove(host) {
            gate.notify_one();
        }
    }

    /// Simulate an unsolicited loss of every live session
    pub fn drop_connection(&self) {
        for session in self.state.live_sessions() {
            if session.connected.swap(false, Ordering::SeqCst) {
                self.state.session_down();
                if let Some(events) = session.events.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                    let _ = events.send(SessionEvent::ConnectionLost(
                        "connection reset by peer".to_string(),
                    ));
                }
            }
        }
    }

    /// Deliver a message to every connected session subscribed to `topic`
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for session in self.state.live_sessions() {
            if !session.connected.load(Ordering::SeqCst) {
                continue;
            }
            let handler = session
                .subscription
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .filter(|(subscribed, _)| subscribed == topic)
                .map(|(_, handler)| handler.clone());
            if let Some(handler) = handler {
                handler(ReceivedMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    qos: QoS::AtMostOnce,
                    packet_id: 0,
                    retain: false,
                });
                delivered += 1;
            }
        }
        delivered
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn successful_connects(&self) -> usize {
        self.state.successful_connects.load(Ordering::SeqCst)
    }

    pub fn active_sessions(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously connected sessions seen
    pub fn max_active_sessions(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Hosts of every connect attempt, in order
    pub fn hosts(&self) -> Vec<String> {
        self.state.hosts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.state.subscriptions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl SessionFactory for MockBroker {
    fn create(&self) -> Arc<dyn BrokerSession> {
        let session = Arc::new(MockSession {
            broker: self.state.clone(),
            connected: AtomicBool::new(false),
            events: Mutex::new(None),
            subscription: Mutex::new(None),
        });
        self.state
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&session));
        session
    }
}

/// Session handed out by [`MockBroker`]
pub struct MockSession {
    broker: Arc<BrokerState>,
    connected: AtomicBool,
    events: Mutex<Option<UnboundedSender<SessionEvent>>>,
    subscription: Mutex<Option<(String, MessageHandler)>>,
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
        events: UnboundedSender<SessionEvent>,
    ) -> Result<(), SessionError> {
        self.broker.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.broker
            .hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(settings.broker.clone());

        let gate = self.broker.gates.lock().unwrap_or_else(PoisonError::into_inner).get(&settings.broker).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(error) = self.broker.take_failure() {
            return Err(error);
        }

        if !self.connected.swap(true, Ordering::SeqCst) {
            self.broker.session_up();
        }
        self.broker.successful_connects.fetch_add(1, Ordering::SeqCst);
        let _ = events.send(SessionEvent::Connected);
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(events);
        Ok(())
    }

    async fn disconnect(&self, _grace: Duration) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.broker.session_down();
        }
        self.broker.disconnects.fetch_add(1, Ordering::SeqCst);
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.broker
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic.to_string(), qos));
        *self.subscription.lock().unwrap_or_else(PoisonError::into_inner) = Some((topic.to_string(), handler));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        if *self.connected.get_mut() {
            self.broker.session_down();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttSection;
    use tokio::sync::mpsc;

    fn settings(host: &str) -> ConnectionSettings {
        let mqtt = MqttSection {
            broker: host.to_string(),
            ..MqttSection::default()
        };
        ConnectionSettings::from_section(
            &mqtt,
            Duration::from_secs(1),
            Duration::from_millis(10),
            Duration::from_millis(10),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_counts_sessions() {
        let broker = MockBroker::new();
        let session = broker.create();
        let (tx, _rx) = mpsc::unbounded_channel();

        session.connect(&settings("a"), tx).await.unwrap();
        assert_eq!(broker.active_sessions(), 1);

        session.disconnect(Duration::ZERO).await;
        assert_eq!(broker.active_sessions(), 0);
        assert_eq!(broker.max_active_sessions(), 1);
        assert_eq!(broker.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_fail_next_is_consumed() {
        let broker = MockBroker::new();
        broker.fail_next(SessionError::Timeout, 1);
        let session = broker.create();
        let (tx, _rx) = mpsc::unbounded_channel();

        assert_eq!(
            session.connect(&settings("a"), tx.clone()).await,
            Err(SessionError::Timeout)
        );
        assert!(session.connect(&settings("a"), tx).await.is_ok());
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_drop_connection_notifies_session() {
        let broker = MockBroker::new();
        let session = broker.create();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.connect(&settings("a"), tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(SessionEvent::Connected));

        broker.drop_connection();

        assert!(matches!(rx.recv().await, Some(SessionEvent::ConnectionLost(_))));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_deliver_reaches_subscribed_handler() {
        let broker = MockBroker::new();
        let session = broker.create();
        let (tx, _rx) = mpsc::unbounded_channel();
        session.connect(&settings("a"), tx).await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        session
            .subscribe(
                "bms",
                QoS::AtMostOnce,
                Arc::new(move |m: ReceivedMessage| sink.lock().unwrap_or_else(PoisonError::into_inner).push(m.payload)),
            )
            .await
            .unwrap();

        assert_eq!(broker.deliver("bms", b"soc=80"), 1);
        assert_eq!(broker.deliver("other", b"x"), 0);
        assert_eq!(*received.lock().unwrap_or_else(PoisonError::into_inner), vec![b"soc=80".to_vec()]);
    }
}
