//! Connection state machine
//!
//! A `Connection` drives one accepted transport through
//! `AwaitingConnect -> Connected -> Closed`:
//! - read exactly one CONNECT within the handshake window, validate it and
//!   answer CONNACK
//! - split the transport; a spawned write loop drains the client's outbound
//!   channel while this task reads and dispatches packets
//! - on any exit path the connection is torn down exactly once:
//!   deregistration, removal from every subscribed topic, transport close.
//!   `serve` does it on return; `Drop` covers a task cancelled mid-flight

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::broker::engine::{SharedBroker, lock};
use crate::broker::message::PendingMessage;
use crate::client::keepalive;
use crate::client::pubsub_client::Client;
use crate::transport::codec::{MqttCodec, PacketKind};
use crate::config::BrokerSettings;
use crate::transport::packet::{
    ConnAck, Connect, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
};
use crate::utils::error::{BrokerError, ProtocolViolation, Result};

type PacketSink<S> = SplitSink<Framed<S, MqttCodec>, Packet>;
type PacketStream<S> = SplitStream<Framed<S, MqttCodec>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingConnect,
    Connected,
    Closed,
}

pub struct Connection {
    peer: SocketAddr,
    broker: SharedBroker,
    queue: mpsc::Sender<PendingMessage>,
    connect_timeout: Option<Duration>,
    codec: MqttCodec,
    state: State,
    client: Option<Arc<Client>>,
    /// Topics subscribed on this connection, in subscription order.
    topics: Vec<String>,
}

impl Connection {
    pub fn new(
        peer: SocketAddr,
        broker: SharedBroker,
        queue: mpsc::Sender<PendingMessage>,
        settings: &BrokerSettings,
    ) -> Self {
        Self {
            peer,
            broker,
            queue,
            connect_timeout: settings.connect_timeout(),
            codec: MqttCodec::new(settings.max_packet_size),
            state: State::AwaitingConnect,
            client: None,
            topics: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The client registered by a successful handshake.
    pub fn client(&self) -> Option<&Arc<Client>> {
        self.client.as_ref()
    }

    /// Run the connection to completion. Faults are logged here and never
    /// propagate.
    pub async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let result = self.serve(stream).await;
        let who = self
            .client
            .as_ref()
            .map(|c| c.client_id.clone())
            .unwrap_or_else(|| self.peer.to_string());

        match result {
            Ok(()) => info!(client = %who, "client closed connection"),
            Err(BrokerError::TransportClosed) => info!(client = %who, "transport closed"),
            Err(e) if e.is_benign() => warn!(client = %who, "closing connection: {e}"),
            Err(e) => error!(client = %who, "connection error: {e}"),
        }
    }

    /// Drive the connection until the peer leaves or a fault ends it. On
    /// return the connection is torn down and in `State::Closed`.
    pub async fn serve<S>(&mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let result = self.handshake_and_read(stream).await;
        self.teardown();
        result
    }

    async fn handshake_and_read<S>(&mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = Framed::new(stream, self.codec);

        let connect = match self.connect_timeout {
            Some(limit) => timeout(limit, read_connect(&mut framed))
                .await
                .map_err(|_| BrokerError::HandshakeTimeout)??,
            None => read_connect(&mut framed).await?,
        };
        let Some(connect) = connect else {
            return Ok(());
        };

        let client_id = if connect.client_id.is_empty() {
            format!("client-{}", Uuid::new_v4())
        } else {
            connect.client_id.clone()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Client::new(client_id, tx));

        // must be registered before CONNACK reaches the peer
        lock(&self.broker).register_client(client.clone());
        self.client = Some(client.clone());
        self.state = State::Connected;

        framed.send(Packet::ConnAck(ConnAck::accepted())).await?;
        let (sink, mut stream) = framed.split();
        info!(
            client = %client.client_id,
            peer = %self.peer,
            keep_alive = connect.keep_alive,
            username = ?connect.username,
            "client connected"
        );

        tokio::spawn(write_loop(client.clone(), sink, rx));

        if connect.keep_alive > 0 {
            let client = client.clone();
            let interval = Duration::from_secs(connect.keep_alive.into());
            tokio::spawn(async move {
                if let Err(e) = keepalive::monitor(client.clone(), interval).await {
                    warn!(client = %client.client_id, "{e}, disconnecting");
                }
            });
        }

        self.read_loop(&client, &mut stream).await
    }

    async fn read_loop<S>(&mut self, client: &Client, stream: &mut PacketStream<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = client.stopped() => {
                    debug!(client = %client.client_id, "stop flag raised");
                    return Ok(());
                }
                frame = stream.next() => frame,
            };
            let Some(frame) = frame else {
                return Ok(());
            };

            let frame = frame?;
            client.mark_alive();
            let packet = Packet::decode(frame)?;
            trace!(client = %client.client_id, kind = ?packet.kind(), "recv");
            self.dispatch(client, packet).await?;
        }
    }

    async fn dispatch(&mut self, client: &Client, packet: Packet) -> Result<()> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(client, publish).await,
            Packet::PubAck(pid) => {
                client.delivery().on_puback(pid)?;
                Ok(())
            }
            Packet::PubRec(pid) => {
                let pubrel = client.delivery().on_pubrec(pid)?;
                client.send(pubrel)
            }
            Packet::PubRel(pid) => {
                if !client.delivery().release_exactly_once(pid) {
                    debug!(client = %client.client_id, pid, "PUBREL for unknown packet id");
                }
                client.send(Packet::PubComp(pid))
            }
            Packet::PubComp(pid) => {
                client.delivery().on_pubcomp(pid)?;
                Ok(())
            }
            Packet::Subscribe(subscribe) => self.handle_subscribe(client, subscribe),
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(client, unsubscribe),
            Packet::PingReq => client.send(Packet::PingResp),
            Packet::Disconnect => {
                debug!(client = %client.client_id, "DISCONNECT received");
                Ok(())
            }
            other => Err(ProtocolViolation::UnexpectedPacket(other.kind()).into()),
        }
    }

    async fn handle_publish(&mut self, client: &Client, publish: Publish) -> Result<()> {
        let Publish {
            qos,
            pid,
            topic,
            payload,
            dup,
            ..
        } = publish;
        debug!(client = %client.client_id, %topic, ?qos, ?pid, dup, "recv PUBLISH");
        let message = PendingMessage {
            topic,
            payload,
            qos,
        };

        match (qos, pid) {
            (QoS::AtMostOnce, _) => self.enqueue(message).await,
            (QoS::AtLeastOnce, Some(pid)) => {
                self.enqueue(message).await?;
                client.send(Packet::PubAck(pid))
            }
            (QoS::ExactlyOnce, Some(pid)) => {
                let first_delivery = client.delivery().accept_exactly_once(pid);
                if first_delivery {
                    self.enqueue(message).await?;
                } else {
                    debug!(client = %client.client_id, pid, "duplicate QoS 2 PUBLISH suppressed");
                }
                client.send(Packet::PubRec(pid))
            }
            (_, None) => Err(ProtocolViolation::MalformedPacket("publish without packet id").into()),
        }
    }

    async fn enqueue(&self, message: PendingMessage) -> Result<()> {
        self.queue
            .send(message)
            .await
            .map_err(|_| BrokerError::QueueClosed)
    }

    fn handle_subscribe(&mut self, client: &Client, subscribe: Subscribe) -> Result<()> {
        let mut granted = Vec::with_capacity(subscribe.topics.len());
        {
            let mut broker = lock(&self.broker);
            for (topic, qos) in subscribe.topics {
                info!(client = %client.client_id, %topic, ?qos, "subscribe");
                broker.subscribe(&topic, client.id.clone(), qos);
                if !self.topics.contains(&topic) {
                    self.topics.push(topic);
                }
                granted.push(qos);
            }
        }
        client.send(Packet::SubAck(SubAck {
            pid: subscribe.pid,
            granted,
        }))
    }

    fn handle_unsubscribe(&mut self, client: &Client, unsubscribe: Unsubscribe) -> Result<()> {
        {
            let mut broker = lock(&self.broker);
            for topic in &unsubscribe.topics {
                if broker.unsubscribe(topic, &client.id) {
                    info!(client = %client.client_id, %topic, "unsubscribe");
                }
                self.topics.retain(|t| t != topic);
            }
        }
        client.send(Packet::UnsubAck(unsubscribe.pid))
    }
}

impl Connection {
    fn teardown(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Closed;
        let Some(client) = &self.client else {
            return;
        };
        client.stop();
        lock(&self.broker).cleanup_client(&client.id, &self.topics);
        debug!(client = %client.client_id, topics = self.topics.len(), "connection torn down");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Wait for the first packet. `None` means the peer closed before sending one.
async fn read_connect<S>(framed: &mut Framed<S, MqttCodec>) -> Result<Option<Connect>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(frame) = framed.next().await else {
        return Ok(None);
    };
    let frame = frame?;
    if frame.kind != PacketKind::Connect {
        return Err(ProtocolViolation::UnexpectedFirstPacket(frame.kind).into());
    }
    match Packet::decode(frame)? {
        Packet::Connect(connect) => Ok(Some(connect)),
        other => Err(ProtocolViolation::UnexpectedFirstPacket(other.kind()).into()),
    }
}

/// Drain the client's outbound channel onto the transport. Any write
/// failure stops the connection. Packets queued before the stop flag was
/// raised are still written.
async fn write_loop<S>(client: Arc<Client>, mut sink: PacketSink<S>, mut rx: UnboundedReceiver<Packet>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut writable = true;
    loop {
        let packet = tokio::select! {
            biased;
            packet = rx.recv() => packet,
            _ = client.stopped() => break,
        };
        let Some(packet) = packet else {
            break;
        };
        if let Err(e) = sink.send(packet).await {
            warn!(client = %client.client_id, "failed to write packet: {e}");
            writable = false;
            break;
        }
    }

    client.stop();
    if writable {
        while let Ok(packet) = rx.try_recv() {
            if let Err(e) = sink.send(packet).await {
                debug!(client = %client.client_id, "dropping queued packets: {e}");
                break;
            }
        }
    }
    let _ = sink.close().await;
    debug!(client = %client.client_id, "send loop closed");
}
