//! Client representation
//!
//! `Client` is the shared handle for one connected MQTT client. The
//! connection task, the keepalive monitor and the forwarder all hold an
//! `Arc<Client>`; outbound packets go through `sender` to the connection's
//! write loop, so every writer sees the same FIFO order on the wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use uuid::Uuid;

use crate::broker::message::PendingMessage;
use crate::broker::topic::SubscriberId;
use crate::client::delivery::DeliveryState;
use crate::transport::packet::{Packet, QoS};
use crate::utils::error::{BrokerError, Result};

#[derive(Debug)]
pub struct Client {
    /// Registry key, unique per accepted transport.
    pub id: SubscriberId,
    /// MQTT client identifier from CONNECT, or a synthesized one.
    pub client_id: String,
    pub sender: UnboundedSender<Packet>,
    delivery: Mutex<DeliveryState>,
    alive: AtomicBool,
    stop: watch::Sender<bool>,
}

impl Client {
    pub fn new(client_id: impl Into<String>, sender: UnboundedSender<Packet>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4().to_string(),
            client_id: client_id.into(),
            sender,
            delivery: Mutex::new(DeliveryState::default()),
            alive: AtomicBool::new(false),
            stop,
        }
    }

    /// Queue a packet for the write loop.
    pub fn send(&self, packet: Packet) -> Result<()> {
        self.sender
            .send(packet)
            .map_err(|_| BrokerError::TransportClosed)
    }

    /// Send `message` to this client at `qos`.
    ///
    /// The identifier is allocated and recorded, and the packet queued, under
    /// one lock so identifiers reach the wire in allocation order.
    pub fn deliver(&self, message: &PendingMessage, qos: QoS) -> Result<()> {
        if self.is_stopped() {
            return Err(BrokerError::TransportClosed);
        }
        let mut delivery = self.delivery();
        let packet = delivery.prepare_publish(message, qos)?;
        self.send(packet)
    }

    pub fn delivery(&self) -> MutexGuard<'_, DeliveryState> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
    }

    /// Read and clear the liveness flag.
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Raise the stop flag. Idempotent.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves once the stop flag is raised.
    pub async fn stopped(&self) {
        let mut rx = self.stop.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
