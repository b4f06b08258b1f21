//! Pure connection configuration and error classification
//!
//! Everything here is free of I/O: building connection settings from the
//! config, translating them into rumqttc options, and classifying connect
//! failures.

use crate::config::MqttSection;
use crate::transport::SessionError;
use rumqttc::{ConnectReturnCode, MqttOptions, QoS};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Connection state for a broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnecting after an unsolicited loss (attempt count)
    Reconnecting(u32),
}

/// Why the broker refused a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectRefusal {
    BadUserNamePassword,
    NotAuthorized,
    Other(String),
}

impl ConnectRefusal {
    pub fn from_return_code(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::BadUserNamePassword => ConnectRefusal::BadUserNamePassword,
            ConnectReturnCode::NotAuthorized => ConnectRefusal::NotAuthorized,
            other => ConnectRefusal::Other(format!("{other:?}")),
        }
    }

    pub fn is_credential_refusal(&self) -> bool {
        matches!(
            self,
            ConnectRefusal::BadUserNamePassword | ConnectRefusal::NotAuthorized
        )
    }
}

impl fmt::Display for ConnectRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectRefusal::BadUserNamePassword => f.write_str("bad user name or password"),
            ConnectRefusal::NotAuthorized => f.write_str("not authorized"),
            ConnectRefusal::Other(code) => write!(f, "{code}"),
        }
    }
}

/// Which credential dimension a credential refusal points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialProblem {
    MissingUsername,
    MissingPassword,
    Rejected,
}

impl fmt::Display for CredentialProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialProblem::MissingUsername => f.write_str("no username configured"),
            CredentialProblem::MissingPassword => f.write_str("no password configured"),
            CredentialProblem::Rejected => f.write_str("credentials rejected by broker"),
        }
    }
}

/// Classified broker connection errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Bad credentials: {problem}")]
    BadCredentials {
        problem: CredentialProblem,
        #[source]
        source: SessionError,
    },
    #[error("Connection failed")]
    ConnectionFailed(#[source] SessionError),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] SessionError),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection cancelled")]
    Cancelled,
    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),
}

/// Immutable per-attempt connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub broker: String,
    pub port: u16,
    /// Full client id, including the per-connection suffix
    pub client_id: String,
    pub topic: String,
    pub qos: QoS,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub reconnect_on_failure: bool,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    /// Delay between unsolicited-loss reconnection attempts
    pub reconnect_interval: Duration,
    pub disconnect_grace: Duration,
}

impl ConnectionSettings {
    /// Build settings from the MQTT section, generating a fresh client id
    pub fn from_section(
        mqtt: &MqttSection,
        connect_timeout: Duration,
        reconnect_interval: Duration,
        disconnect_grace: Duration,
    ) -> Result<Self, MqttError> {
        Ok(Self {
            broker: mqtt.broker.clone(),
            port: mqtt.port,
            client_id: unique_client_id(&mqtt.client_id),
            topic: mqtt.topic.clone(),
            qos: qos_from_level(mqtt.qos)?,
            clean_session: mqtt.clean_session,
            keep_alive: Duration::from_secs(mqtt.keep_alive),
            reconnect_on_failure: mqtt.reconnect_on_failure,
            username: mqtt.username.clone(),
            password: mqtt.password.clone(),
            connect_timeout,
            reconnect_interval,
            disconnect_grace,
        })
    }
}

/// Append a short random token to `base` so restarts never collide on the broker
pub fn unique_client_id(base: &str) -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    let suffix = uuid.split('-').next().unwrap_or(&uuid);
    format!("{base}-{suffix}")
}

pub fn qos_from_level(level: u8) -> Result<QoS, MqttError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(MqttError::InvalidQos(other)),
    }
}

/// Translate connection settings into rumqttc options
pub fn configure_mqtt_options(settings: &ConnectionSettings) -> MqttOptions {
    let mut options = MqttOptions::new(&settings.client_id, &settings.broker, settings.port);
    options.set_clean_session(settings.clean_session);
    // Whole seconds; zero disables keep-alive
    options.set_keep_alive(settings.keep_alive);
    if !settings.username.is_empty() {
        options.set_credentials(&settings.username, &settings.password);
    }
    options
}

/// Classify a failed connect, attributing credential refusals to a dimension
pub fn classify_connect_error(error: SessionError, settings: &ConnectionSettings) -> MqttError {
    match &error {
        SessionError::Refused(refusal) if refusal.is_credential_refusal() => {
            let problem = if settings.username.is_empty() {
                CredentialProblem::MissingUsername
            } else if settings.password.is_empty() {
                CredentialProblem::MissingPassword
            } else {
                CredentialProblem::Rejected
            };
            MqttError::BadCredentials {
                problem,
                source: error,
            }
        }
        _ => MqttError::ConnectionFailed(error),
    }
}
