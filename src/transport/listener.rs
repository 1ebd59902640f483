//! TCP listener
//!
//! Accepts transports and hands each one to a `Connection` task. `serve`
//! also owns the process-wide message queue and starts the forwarder that
//! drains it.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::broker::engine::{Broker, SharedBroker, lock};
use crate::broker::forwarder::run_forwarder;
use crate::broker::message::PendingMessage;
use crate::client::Connection;
use crate::config::{BrokerSettings, Settings};
use crate::utils::error::Result;

/// Bind `server.host:server.port` and serve until the process ends.
pub async fn run(settings: &Settings) -> Result<()> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("MQTT broker listening on {addr}");

    serve(listener, Broker::shared(), settings.broker.clone()).await
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, broker: SharedBroker, settings: BrokerSettings) -> Result<()> {
    let (queue, queue_rx) = mpsc::channel(settings.queue_capacity.max(1));
    tokio::spawn(run_forwarder(broker.clone(), queue_rx));

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };

        if !admit(&broker, &settings, peer) {
            drop(stream);
            continue;
        }

        info!(%peer, "new connection");
        spawn_connection(stream, peer, &broker, &queue, &settings);
    }
}

fn admit(broker: &SharedBroker, settings: &BrokerSettings, peer: SocketAddr) -> bool {
    let connected = lock(broker).client_count();
    if connected >= settings.max_connections {
        warn!(%peer, connected, "connection limit reached, refusing");
        return false;
    }
    true
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: &SharedBroker,
    queue: &mpsc::Sender<PendingMessage>,
    settings: &BrokerSettings,
) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(%peer, "failed to set TCP_NODELAY: {e}");
    }
    let connection = Connection::new(peer, broker.clone(), queue.clone(), settings);
    tokio::spawn(connection.run(stream));
}
