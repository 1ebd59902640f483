//! Broker engine
//!
//! This module holds the process-wide state shared by every connection:
//! - the connection list, keyed by the registry id of each `Client`
//! - the subscription registry: exact topic name -> subscriber -> granted QoS
//!
//! Concurrency and usage notes:
//! - The API here is synchronous and designed to be held behind a lock
//!   (`SharedBroker`). Callers must not hold the lock across I/O; fan-out
//!   takes a snapshot with `subscribers` and delivers after releasing it.
//! - Topics are matched by exact string equality. There is no wildcard
//!   expansion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::broker::topic::{SubscriberId, Topic};
use crate::client::Client;
use crate::transport::packet::QoS;

pub type SharedBroker = Arc<Mutex<Broker>>;

/// Lock the broker, recovering the state if a holder panicked.
pub fn lock(broker: &SharedBroker) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct Broker {
    topics: HashMap<String, Topic>,
    clients: HashMap<SubscriberId, Arc<Client>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedBroker {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn register_client(&mut self, client: Arc<Client>) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Tolerates a client that was already removed.
    pub fn remove_client(&mut self, client_id: &SubscriberId) -> bool {
        self.clients.remove(client_id).is_some()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client(&self, client_id: &SubscriberId) -> Option<&Arc<Client>> {
        self.clients.get(client_id)
    }

    pub fn clients(&self) -> impl Iterator<Item = &Arc<Client>> {
        self.clients.values()
    }

    pub fn topic(&self, name: &str) -> Option<&Topic> {
        self.topics.get(name)
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Subscribes a client to a topic. Automatically creates the topic if it doesn't exist.
    pub fn subscribe(&mut self, topic: &str, subscriber: SubscriberId, qos: QoS) {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic))
            .subscribe(subscriber, qos);
    }

    /// Remove one subscription. Topics left without subscribers are dropped.
    pub fn unsubscribe(&mut self, topic: &str, subscriber: &SubscriberId) -> bool {
        let Some(t) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = t.unsubscribe(subscriber);
        if t.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Snapshot of the clients subscribed to exactly `topic`, with the QoS
    /// each was granted.
    pub fn subscribers(&self, topic: &str) -> Vec<(Arc<Client>, QoS)> {
        let Some(t) = self.topics.get(topic) else {
            return Vec::new();
        };
        t.subscribers
            .iter()
            .filter_map(|(id, qos)| match self.clients.get(id) {
                Some(client) => Some((client.clone(), *qos)),
                None => {
                    warn!(subscriber = %id, %topic, "subscriber has no registered client");
                    None
                }
            })
            .collect()
    }

    /// Remove a client from the connection list and from each of `topics`.
    pub fn cleanup_client(&mut self, client_id: &SubscriberId, topics: &[String]) {
        self.remove_client(client_id);

        for topic in topics {
            if self.unsubscribe(topic, client_id) {
                debug!(subscriber = %client_id, %topic, "unsubscribed on teardown");
            }
        }
    }
}
