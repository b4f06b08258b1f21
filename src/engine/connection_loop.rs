//! Supervisor-driven connection loop
//!
//! Each attempt tears down any previous connection and clears a stale
//! `connected` status before building a fresh [`BrokerConnection`], so the
//! status document never reads connected while no live session exists. The
//! loop runs until the first connect+subscribe succeeds or its scope is
//! cancelled. Attempt bodies are serialized across loops by `connect_lock`.

use super::Engine;
use crate::config::{Config, RuntimeSection};
use crate::transport::mqtt::{
    logging_handler, BrokerConnection, ConnectionSettings, LinkEvent, MqttError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay between connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    interval: Duration,
}

impl RetryPolicy {
    /// Build from the runtime section, clamping to the configured maximum
    pub fn from_runtime(runtime: &RuntimeSection) -> Self {
        let requested = runtime.retry_interval_secs;
        let max = runtime.max_retry_interval_secs;
        let secs = if requested > max {
            warn!(
                requested_secs = requested,
                max_secs = max,
                "Retry interval exceeds maximum, clamping"
            );
            max
        } else {
            requested
        };
        Self {
            interval: Duration::from_secs(secs),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn log_attempt_failure(attempt: u32, error: &MqttError) {
    match error {
        MqttError::BadCredentials { problem, .. } => error!(
            attempt,
            problem = %problem,
            error = %error_chain(error),
            "MQTT authentication failed"
        ),
        _ => warn!(
            attempt,
            error = %error_chain(error),
            "MQTT connection attempt failed"
        ),
    }
}

impl Engine {
    /// Retry connect+subscribe until success or cancellation of `scope`
    ///
    /// Returns true if this loop established the connection.
    pub(super) async fn run_connection_loop(self: Arc<Self>, scope: CancellationToken) -> bool {
        let config = self.config.snapshot();
        let policy = RetryPolicy::from_runtime(&config.runtime);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = {
                let _serial = self.connect_lock.lock().await;
                if scope.is_cancelled() {
                    debug!(attempt, "Connection loop superseded");
                    return false;
                }
                self.try_connection(&scope, &config, &policy).await
            };

            match outcome {
                Ok(established) => return established,
                Err(MqttError::Cancelled) => {
                    debug!(attempt, "Connection attempt cancelled");
                    return false;
                }
                Err(e) => log_attempt_failure(attempt, &e),
            }

            info!(
                attempt,
                retry_in_secs = policy.interval().as_secs(),
                "Retrying MQTT connection"
            );
            tokio::select! {
                _ = scope.cancelled() => return false,
                _ = tokio::time::sleep(policy.interval()) => {}
            }
        }
    }

    async fn try_connection(
        self: &Arc<Self>,
        scope: &CancellationToken,
        config: &Config,
        policy: &RetryPolicy,
    ) -> Result<bool, MqttError> {
        let settings = ConnectionSettings::from_section(
            &config.app.mqtt,
            Duration::from_secs(config.runtime.connect_timeout_secs),
            policy.interval(),
            Duration::from_millis(config.runtime.disconnect_grace_ms),
        )?;

        let connection = {
            let mut slot = self.connection.lock().await;
            if let Some(previous) = slot.take() {
                previous.disconnect().await;
            }
            self.status.connection_stopped();
            if scope.is_cancelled() {
                return Err(MqttError::Cancelled);
            }
            let connection = BrokerConnection::new(settings, self.sessions.create(), scope);
            *slot = Some(connection.clone());
            connection
        };

        self.watch_connection_state(&connection);
        connection.connect().await?;
        connection.subscribe(logging_handler()).await?;

        let slot = self.connection.lock().await;
        let current = slot
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, &connection));
        if scope.is_cancelled() || !current {
            debug!(client_id = %connection.client_id(), "Connection superseded before it was recorded");
            return Ok(false);
        }

        self.status
            .connection_started(connection.client_id(), connection.topic());
        info!(
            client_id = %connection.client_id(),
            topic = %connection.topic(),
            "MQTT connection established"
        );
        Ok(true)
    }

    /// Mirror unsolicited loss and automatic reconnection into the status document
    fn watch_connection_state(self: &Arc<Self>, connection: &Arc<BrokerConnection>) {
        let Some(mut links) = connection.take_link_events() else {
            return;
        };
        let engine = Arc::downgrade(self);
        let connection = Arc::clone(connection);
        let token = connection.cancellation_token();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = links.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(engine) = engine.upgrade() else {
                    break;
                };

                match event {
                    LinkEvent::Lost => engine.record_unsolicited_loss(&connection).await,
                    LinkEvent::Restored => engine.record_reconnected(&connection).await,
                }
            }
        });
    }

    async fn record_unsolicited_loss(&self, connection: &Arc<BrokerConnection>) {
        let slot = self.connection.lock().await;
        let current = slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, connection));
        if connection.is_closed() || !current {
            return;
        }
        if self.status.connection_stopped() {
            warn!(client_id = %connection.client_id(), "MQTT connection lost");
        }
    }

    async fn record_reconnected(&self, connection: &Arc<BrokerConnection>) {
        let slot = self.connection.lock().await;
        let current = slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, connection));
        if connection.is_closed() || !current || !connection.is_connected() {
            return;
        }
        self.status
            .connection_started(connection.client_id(), connection.topic());
        info!(client_id = %connection.client_id(), "MQTT connection restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_interval_within_maximum_is_kept() {
        let runtime = RuntimeSection::default();
        assert_eq!(
            RetryPolicy::from_runtime(&runtime).interval(),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_retry_interval_is_clamped() {
        let runtime = RuntimeSection {
            retry_interval_secs: 300,
            ..RuntimeSection::default()
        };
        assert_eq!(
            RetryPolicy::from_runtime(&runtime).interval(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let error = MqttError::ConnectionFailed(crate::transport::SessionError::Timeout);
        assert_eq!(
            error_chain(&error),
            "Connection failed: Timed out waiting for connection acknowledgement"
        );
    }
}
