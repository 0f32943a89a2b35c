//! Per-topic subscription registry
//!
//! A topic's handler only receives messages while the subscription is `Active`, i.e. after
//! the broker acknowledged it on the current connection. A connection loss lapses every
//! entry, and a reconnect re-requests them.

use super::events::MessageHandler;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered, not carried by the current connection
    Lapsed,
    /// SUBSCRIBE queued or sent, SUBACK pending
    Requested,
    Active,
}

struct Subscription {
    handler: Arc<dyn MessageHandler>,
    state: SubscriptionState,
    packet_id: Option<u16>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, Subscription>,
    /// Topics whose SUBSCRIBE has been queued but not yet seen on the wire
    queued: VecDeque<String>,
}

impl SubscriptionRegistry {
    /// Registers the handler for `topic`; returns true when a previous handler was replaced
    pub fn register(&mut self, topic: &str, handler: Arc<dyn MessageHandler>) -> bool {
        let previous = self.entries.insert(
            topic.to_string(),
            Subscription {
                handler,
                state: SubscriptionState::Lapsed,
                packet_id: None,
            },
        );
        if previous.is_some() {
            warn!("Replacing message handler for '{}'", topic);
        }
        previous.is_some()
    }

    pub fn remove(&mut self, topic: &str) {
        self.entries.remove(topic);
        self.queued.retain(|t| t != topic);
    }

    /// Marks `topic` as requested; the caller queues the SUBSCRIBE right after
    pub fn mark_requested(&mut self, topic: &str) {
        if let Some(entry) = self.entries.get_mut(topic) {
            entry.state = SubscriptionState::Requested;
            entry.packet_id = None;
            self.queued.push_back(topic.to_string());
        }
    }

    /// Correlates an outgoing SUBSCRIBE packet with the oldest queued topic
    pub fn on_outgoing(&mut self, packet_id: u16) -> Option<String> {
        let topic = self.queued.pop_front()?;
        if let Some(entry) = self.entries.get_mut(&topic) {
            entry.packet_id = Some(packet_id);
        }
        Some(topic)
    }

    /// Activates the subscription acknowledged by `packet_id`
    pub fn on_suback(&mut self, packet_id: u16) -> Option<String> {
        let (topic, entry) = self.entries.iter_mut().find(|(_, entry)| {
            entry.state == SubscriptionState::Requested && entry.packet_id == Some(packet_id)
        })?;
        entry.state = SubscriptionState::Active;
        debug!("Subscription to '{}' active (pkid {})", topic, packet_id);
        Some(topic.clone())
    }

    /// The broker refused the request acknowledged by `packet_id`; the topic stays registered
    /// and is requested again on the next reconnect
    pub fn on_refused(&mut self, packet_id: u16) -> Option<String> {
        let (topic, entry) = self.entries.iter_mut().find(|(_, entry)| {
            entry.state == SubscriptionState::Requested && entry.packet_id == Some(packet_id)
        })?;
        entry.state = SubscriptionState::Lapsed;
        entry.packet_id = None;
        Some(topic.clone())
    }

    /// Connection dropped: nothing is carried any more
    pub fn lapse_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.state = SubscriptionState::Lapsed;
            entry.packet_id = None;
        }
        self.queued.clear();
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.entries.keys().cloned().collect();
        topics.sort();
        topics
    }

    #[cfg(test)]
    pub fn state(&self, topic: &str) -> Option<SubscriptionState> {
        self.entries.get(topic).map(|entry| entry.state)
    }

    /// Handler for an inbound message, only while the topic's subscription is active
    pub fn handler_for(&self, topic: &str) -> Option<Arc<dyn MessageHandler>> {
        self.entries
            .get(topic)
            .filter(|entry| entry.state == SubscriptionState::Active)
            .map(|entry| entry.handler.clone())
    }
}
