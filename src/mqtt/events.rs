//! Event callbacks invoked by the session driver
//!
//! All methods run on the transport task. They must return quickly: while a callback runs,
//! no packet is read from or written to the broker.

use super::message_manager::{DeliveryReceipt, InboundMessage};
use crate::console::StatusSink;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Connection lifecycle and delivery notifications for one session
pub trait SessionEvents: Send + Sync {
    /// The broker accepted the connection. On a reconnect the session has already
    /// re-requested every registered subscription.
    fn on_connected(&self, is_reconnect: bool);

    /// An established link dropped. Recovery is left to the session's reconnect policy.
    fn on_connection_lost(&self, cause: &str);

    fn on_delivery_complete(&self, receipt: &DeliveryReceipt);

    fn on_subscribed(&self, topic: &str, request_id: u16);

    /// The broker refused a subscription; no messages arrive on `topic` until the next
    /// reconnect requests it again
    fn on_subscribe_failed(&self, topic: &str, request_id: u16) {
        warn!("Subscription to '{}' refused (mid={})", topic, request_id);
    }

    /// Reconnect attempts are exhausted; the session will stay disconnected
    fn on_gave_up(&self, attempts: u32) {
        warn!("Giving up on the broker after {} reconnect attempts", attempts);
    }
}

/// Receives messages for one subscribed topic
pub trait MessageHandler: Send + Sync {
    fn on_message_arrived(&self, message: &InboundMessage);
}

/// Turns session events into operator status lines
pub struct ConsoleEvents {
    console: Arc<dyn StatusSink>,
    broker: String,
}

impl ConsoleEvents {
    pub fn new(console: Arc<dyn StatusSink>, broker: impl Into<String>) -> Self {
        Self {
            console,
            broker: broker.into(),
        }
    }
}

impl SessionEvents for ConsoleEvents {
    fn on_connected(&self, is_reconnect: bool) {
        if is_reconnect {
            info!("Reconnected to {}", self.broker);
            self.console
                .status(&format!("Reconnected to broker {}", self.broker));
        } else {
            info!("Connected to {}", self.broker);
            self.console
                .status(&format!("Connected to broker {}", self.broker));
        }
    }

    fn on_connection_lost(&self, cause: &str) {
        warn!("Connection to {} lost: {}", self.broker, cause);
        self.console.status(&format!("Connection lost: {cause}"));
    }

    fn on_delivery_complete(&self, receipt: &DeliveryReceipt) {
        debug!("Delivery complete: {:?}", receipt);
        self.console
            .status(&format!("Message {receipt} sent to broker"));
    }

    fn on_subscribed(&self, topic: &str, request_id: u16) {
        self.console
            .status(&format!("Subscribed to '{topic}' (mid={request_id})"));
    }

    fn on_subscribe_failed(&self, topic: &str, request_id: u16) {
        warn!("Broker {} refused subscription to '{}'", self.broker, topic);
        self.console.status(&format!(
            "Subscription to '{topic}' refused (mid={request_id}), echoes will not arrive"
        ));
    }

    fn on_gave_up(&self, attempts: u32) {
        warn!("Giving up on {} after {} reconnect attempts", self.broker, attempts);
        self.console.status(&format!(
            "Broker unreachable after {attempts} reconnect attempts, restart to try again"
        ));
    }
}

impl MessageHandler for ConsoleEvents {
    fn on_message_arrived(&self, message: &InboundMessage) {
        match message.payload_str() {
            Ok(text) => {
                debug!("Inbound {}", message);
                self.console
                    .status(&format!("Received: '{}' on topic '{}'", text, message.topic));
            }
            Err(e) => {
                warn!("Payload on '{}' is not valid UTF-8: {}", message.topic, e);
                self.console.status(&format!(
                    "Received {} undecodable bytes on topic '{}': {}",
                    message.payload.len(),
                    message.topic,
                    String::from_utf8_lossy(&message.payload)
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::CapturedConsole;
    use crate::mqtt::message_manager::DeliveryToken;

    fn handler() -> (Arc<CapturedConsole>, ConsoleEvents) {
        let console = Arc::new(CapturedConsole::default());
        let events = ConsoleEvents::new(console.clone(), "tcp://broker:1883");
        (console, events)
    }

    #[test]
    fn connect_and_reconnect_are_distinguished() {
        let (console, events) = handler();
        events.on_connected(false);
        events.on_connected(true);
        assert_eq!(
            console.lines(),
            [
                "Connected to broker tcp://broker:1883",
                "Reconnected to broker tcp://broker:1883"
            ]
        );
    }

    #[test]
    fn message_payload_is_shown_unchanged() {
        let (console, events) = handler();
        events.on_message_arrived(&InboundMessage::new("VR_control", "Stop"));
        assert_eq!(console.lines(), ["Received: 'Stop' on topic 'VR_control'"]);
    }

    #[test]
    fn undecodable_payload_does_not_panic() {
        let (console, events) = handler();
        events.on_message_arrived(&InboundMessage::new("VR_control", vec![0xff, b'o', b'k']));
        assert!(console.contains("3 undecodable bytes"));
    }

    #[test]
    fn receipts_and_subscriptions_are_reported() {
        let (console, events) = handler();
        events.on_delivery_complete(&DeliveryReceipt {
            token: Some(DeliveryToken(4)),
            packet_id: 0,
        });
        events.on_subscribed("VR_control", 1);
        events.on_subscribe_failed("VR_control", 2);
        events.on_connection_lost("connection reset");
        assert_eq!(
            console.lines(),
            [
                "Message #4 sent to broker",
                "Subscribed to 'VR_control' (mid=1)",
                "Subscription to 'VR_control' refused (mid=2), echoes will not arrive",
                "Connection lost: connection reset"
            ]
        );
    }
}
