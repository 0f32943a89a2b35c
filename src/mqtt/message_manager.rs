use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt;
use std::str::Utf8Error;

/// A message delivered on a subscribed topic; lives only as long as the callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }

    pub fn payload_str(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.payload)
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} ({} bytes)",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.payload.len()
        )
    }
}

/// Local id handed out for every accepted publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryToken(pub u64);

impl fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Confirmation that a publish left the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// `None` when the transmission could not be matched to a token (after a reconnect)
    pub token: Option<DeliveryToken>,
    /// MQTT packet id; always 0 at QoS 0
    pub packet_id: u16,
}

impl fmt::Display for DeliveryReceipt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.token {
            Some(token) => write!(f, "{}", token),
            None => write!(f, "pkid {}", self.packet_id),
        }
    }
}

/// Correlates issued tokens with outgoing PUBLISH packets
///
/// The client sends requests in the order they were queued, so tokens are matched FIFO.
#[derive(Debug)]
pub struct ReceiptLedger {
    next: u64,
    in_flight: VecDeque<DeliveryToken>,
}

impl Default for ReceiptLedger {
    fn default() -> Self {
        Self {
            next: 1,
            in_flight: VecDeque::new(),
        }
    }
}

impl ReceiptLedger {
    pub fn issue(&mut self) -> DeliveryToken {
        let token = DeliveryToken(self.next);
        self.next += 1;
        self.in_flight.push_back(token);
        token
    }

    /// Takes back the most recent token when the client refused the request
    pub fn revoke(&mut self, token: DeliveryToken) {
        if self.in_flight.back() == Some(&token) {
            self.in_flight.pop_back();
        }
    }

    pub fn complete(&mut self, packet_id: u16) -> DeliveryReceipt {
        DeliveryReceipt {
            token: self.in_flight.pop_front(),
            packet_id,
        }
    }

    /// Forgets every outstanding token and returns how many were dropped
    pub fn abandon(&mut self) -> usize {
        let dropped = self.in_flight.len();
        self.in_flight.clear();
        dropped
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipts_match_in_publish_order() {
        let mut ledger = ReceiptLedger::default();
        let first = ledger.issue();
        let second = ledger.issue();
        assert_eq!(first, DeliveryToken(1));
        assert_eq!(second, DeliveryToken(2));

        assert_eq!(ledger.complete(0).token, Some(first));
        assert_eq!(ledger.complete(0).token, Some(second));
        assert_eq!(ledger.complete(7), DeliveryReceipt { token: None, packet_id: 7 });
    }

    #[test]
    fn abandon_keeps_numbering() {
        let mut ledger = ReceiptLedger::default();
        ledger.issue();
        ledger.issue();
        assert_eq!(ledger.abandon(), 2);
        assert_eq!(ledger.outstanding(), 0);
        assert_eq!(ledger.issue(), DeliveryToken(3));
    }

    #[test]
    fn revoke_only_removes_latest() {
        let mut ledger = ReceiptLedger::default();
        let first = ledger.issue();
        let second = ledger.issue();
        ledger.revoke(first);
        assert_eq!(ledger.outstanding(), 2);
        ledger.revoke(second);
        assert_eq!(ledger.outstanding(), 1);
    }

    #[test]
    fn payload_decoding() {
        let msg = InboundMessage::new("VR_control", "Stop");
        assert_eq!(msg.payload_str().unwrap(), "Stop");

        let broken = InboundMessage::new("VR_control", vec![0xff, 0xfe]);
        assert!(broken.payload_str().is_err());
    }
}
