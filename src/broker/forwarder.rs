//! Forwarder
//!
//! A single task drains the process-wide message queue in order and fans
//! each message out to the subscribers of its topic. Every subscriber gets
//! the message at `min(publisher qos, granted qos)`. A failed delivery stops
//! that subscriber's connection and does not affect the others.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::engine::{SharedBroker, lock};
use crate::broker::message::PendingMessage;

pub async fn run_forwarder(broker: SharedBroker, mut queue: mpsc::Receiver<PendingMessage>) {
    info!("forwarder started");
    while let Some(message) = queue.recv().await {
        forward(&broker, &message);
    }
    info!("message queue closed, forwarder exiting");
}

/// Deliver one message. Returns the number of subscribers it reached.
pub fn forward(broker: &SharedBroker, message: &PendingMessage) -> usize {
    let targets = lock(broker).subscribers(&message.topic);
    if targets.is_empty() {
        debug!(topic = %message.topic, "no subscribers");
        return 0;
    }

    let mut delivered = 0;
    for (client, granted) in targets {
        let qos = message.qos.min(granted);
        match client.deliver(message, qos) {
            Ok(()) => {
                debug!(client = %client.client_id, topic = %message.topic, ?qos, "sending PUBLISH");
                delivered += 1;
            }
            Err(e) => {
                warn!(client = %client.client_id, topic = %message.topic, "delivery failed: {e}");
                client.stop();
            }
        }
    }
    delivered
}
