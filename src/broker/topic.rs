//! Topic management
//!
//! A `Topic` is one subscription registry entry: the connections subscribed
//! to a topic name together with the QoS each was granted. Re-subscribing
//! overwrites the granted QoS.
//!
//! Concurrency note: callers must synchronize access to `Topic` (for example
//! via the broker lock) when modifying subscriptions.

use std::collections::HashMap;

use crate::transport::packet::QoS;

pub type SubscriberId = String;

#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscribers: HashMap<SubscriberId, QoS>,
}

impl Topic {
    /// Create a new topic with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashMap::new(),
        }
    }

    /// Add a subscriber, or update the QoS of an existing one.
    pub fn subscribe(&mut self, id: SubscriberId, qos: QoS) {
        self.subscribers.insert(id, qos);
    }

    /// Remove a subscriber. Returns whether it was present.
    pub fn unsubscribe(&mut self, id: &SubscriberId) -> bool {
        self.subscribers.remove(id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
