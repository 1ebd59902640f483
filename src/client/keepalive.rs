//! Keepalive monitor
//!
//! One monitor runs per connection that negotiated a nonzero keepalive. It
//! wakes every 1.5x the interval and stops the connection if nothing was
//! read since the previous wake-up.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::client::pubsub_client::Client;
use crate::utils::error::{BrokerError, Result};

/// How long a connection may stay silent: 1.5x its keepalive interval.
pub fn grace_period(keep_alive: Duration) -> Duration {
    keep_alive.mul_f64(1.5)
}

/// Returns `Ok` once the connection stops for another reason, or
/// `KeepaliveExpired` after stopping it itself.
pub async fn monitor(client: Arc<Client>, keep_alive: Duration) -> Result<()> {
    let period = grace_period(keep_alive);
    debug!(client = %client.client_id, ?period, "keepalive monitor started");

    loop {
        tokio::select! {
            _ = client.stopped() => return Ok(()),
            _ = sleep(period) => {}
        }

        if !client.take_alive() {
            client.stop();
            return Err(BrokerError::KeepaliveExpired);
        }
    }
}
