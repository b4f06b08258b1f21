//! Pure routing of rumqttc events and message receipt logging

use crate::transport::{MessageHandler, ReceivedMessage};
use rumqttc::{ConnectReturnCode, Event, Packet, SubscribeReasonCode};
use std::sync::Arc;
use tracing::{debug, info};

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker answered the connect request
    ConnectionAcknowledged(ConnectReturnCode),
    /// Message received on a subscribed topic
    MessageReceived(ReceivedMessage),
    /// Subscription answered; `rejected` is true if any filter was refused
    SubscriptionAcknowledged { packet_id: u16, rejected: bool },
    /// Broker closed the session
    Disconnected,
    /// Keep-alive traffic and other packets that need no action
    Infrastructure,
    OutgoingEvent,
}

/// Route an MQTT event to the action it requires (pure routing decision)
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => EventRoute::ConnectionAcknowledged(ack.code),
        Event::Incoming(Packet::Publish(publish)) => EventRoute::MessageReceived(ReceivedMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
            qos: publish.qos,
            packet_id: publish.pkid,
            retain: publish.retain,
        }),
        Event::Incoming(Packet::SubAck(suback)) => EventRoute::SubscriptionAcknowledged {
            packet_id: suback.pkid,
            rejected: suback
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure)),
        },
        Event::Incoming(Packet::Disconnect) => EventRoute::Disconnected,
        Event::Incoming(_) => EventRoute::Infrastructure,
        Event::Outgoing(_) => EventRoute::OutgoingEvent,
    }
}

/// Log receipt of a message: topic and packet id at info, payload at debug
pub fn log_received_message(message: &ReceivedMessage) {
    info!(
        topic = %message.topic,
        packet_id = message.packet_id,
        "Received MQTT message"
    );
    debug!(
        topic = %message.topic,
        payload = %String::from_utf8_lossy(&message.payload),
        "MQTT message payload"
    );
}

/// Handler that only logs receipt
pub fn logging_handler() -> MessageHandler {
    Arc::new(|message: ReceivedMessage| log_received_message(&message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, Outgoing, Publish, QoS, SubAck};

    #[test]
    fn test_connack_is_routed_with_code() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::BadUserNamePassword,
            false,
        )));
        assert_eq!(
            route_mqtt_event(&event),
            EventRoute::ConnectionAcknowledged(ConnectReturnCode::BadUserNamePassword)
        );
    }

    #[test]
    fn test_publish_becomes_received_message() {
        let mut publish = Publish::new("bms", QoS::AtLeastOnce, b"{\"soc\":87}".to_vec());
        publish.pkid = 42;
        let event = Event::Incoming(Packet::Publish(publish));

        match route_mqtt_event(&event) {
            EventRoute::MessageReceived(message) => {
                assert_eq!(message.topic, "bms");
                assert_eq!(message.packet_id, 42);
                assert_eq!(message.qos, QoS::AtLeastOnce);
                assert_eq!(message.payload, b"{\"soc\":87}".to_vec());
            }
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[test]
    fn test_suback_failure_is_flagged() {
        let ok = Event::Incoming(Packet::SubAck(SubAck::new(
            1,
            vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
        )));
        let refused = Event::Incoming(Packet::SubAck(SubAck::new(
            2,
            vec![SubscribeReasonCode::Failure],
        )));

        assert_eq!(
            route_mqtt_event(&ok),
            EventRoute::SubscriptionAcknowledged {
                packet_id: 1,
                rejected: false
            }
        );
        assert_eq!(
            route_mqtt_event(&refused),
            EventRoute::SubscriptionAcknowledged {
                packet_id: 2,
                rejected: true
            }
        );
    }

    #[test]
    fn test_keepalive_traffic_needs_no_action() {
        assert_eq!(
            route_mqtt_event(&Event::Incoming(Packet::PingResp)),
            EventRoute::Infrastructure
        );
        assert_eq!(
            route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
    }
}
