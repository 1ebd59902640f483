use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use super::connection::{Connection, State};
use super::delivery::{DeliveryState, PacketIdPool};
use super::keepalive;
use super::pubsub_client::Client;
use crate::broker::engine::{Broker, lock};
use crate::broker::message::PendingMessage;
use crate::config::{BrokerSettings, Settings};
use crate::transport::codec::MqttCodec;
use crate::transport::packet::{ConnAck, Connect, Packet, Publish, QoS, SubAck, Subscribe};
use crate::utils::error::{BrokerError, FramingError, ProtocolViolation};

fn message(topic: &str, payload: &'static [u8], qos: QoS) -> PendingMessage {
    PendingMessage::new(topic, Bytes::from_static(payload), qos)
}

fn test_client() -> (Arc<Client>, mpsc::UnboundedReceiver<Packet>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Client::new("test-client", tx)), rx)
}

#[test]
fn pool_hands_out_lowest_free_id() {
    let mut pool = PacketIdPool::default();
    assert_eq!(pool.allocate().unwrap(), 1);
    assert_eq!(pool.allocate().unwrap(), 2);
    assert_eq!(pool.allocate().unwrap(), 3);

    assert!(pool.release(2));
    assert_eq!(pool.allocate().unwrap(), 2);
    assert_eq!(pool.allocate().unwrap(), 4);
    assert_eq!(pool.in_use(), 4);
}

#[test]
fn pool_reuses_ids_across_words() {
    let mut pool = PacketIdPool::default();
    for expected in 1..=200u16 {
        assert_eq!(pool.allocate().unwrap(), expected);
    }
    assert!(pool.release(5));
    assert!(pool.release(130));
    assert_eq!(pool.allocate().unwrap(), 5);
    assert_eq!(pool.allocate().unwrap(), 130);
    assert_eq!(pool.allocate().unwrap(), 201);
}

#[test]
fn pool_exhausts_after_every_id_is_taken() {
    let mut pool = PacketIdPool::default();
    for _ in 0..65535 {
        pool.allocate().unwrap();
    }
    assert_eq!(pool.in_use(), 65535);
    assert_eq!(pool.allocate(), Err(ProtocolViolation::PacketIdsExhausted));

    assert!(pool.release(40_000));
    assert_eq!(pool.allocate().unwrap(), 40_000);
}

#[test]
fn pool_release_of_unknown_id() {
    let mut pool = PacketIdPool::default();
    assert!(!pool.release(0));
    assert!(!pool.release(9));
    assert!(!pool.contains(0));

    let pid = pool.allocate().unwrap();
    assert!(pool.contains(pid));
    assert!(pool.release(pid));
    assert!(!pool.release(pid));
    assert_eq!(pool.in_use(), 0);
}

#[test]
fn qos0_publish_is_not_tracked() {
    let mut state = DeliveryState::default();
    let packet = state
        .prepare_publish(&message("t", b"x", QoS::AtMostOnce), QoS::AtMostOnce)
        .unwrap();
    let Packet::Publish(publish) = packet else {
        panic!("expected PUBLISH");
    };
    assert_eq!(publish.pid, None);
    assert_eq!(state.in_flight(), 0);
    assert_eq!(state.pids().in_use(), 0);
}

#[test]
fn qos1_puback_releases_id() {
    let mut state = DeliveryState::default();
    let packet = state
        .prepare_publish(&message("a/b", b"hello", QoS::AtLeastOnce), QoS::AtLeastOnce)
        .unwrap();
    let Packet::Publish(publish) = &packet else {
        panic!("expected PUBLISH");
    };
    assert_eq!(publish.pid, Some(1));
    assert_eq!(state.unacked(1), Some(&packet));

    state.on_puback(1).unwrap();
    assert_eq!(state.in_flight(), 0);
    assert!(!state.pids().contains(1));
    assert_eq!(state.on_puback(1), Err(ProtocolViolation::UnknownPacketId(1)));
}

#[test]
fn qos2_handshake_walks_through_pubrel() {
    let mut state = DeliveryState::default();
    state
        .prepare_publish(&message("t", b"x", QoS::ExactlyOnce), QoS::ExactlyOnce)
        .unwrap();

    // PUBACK does not complete a QoS 2 exchange
    assert_eq!(state.on_puback(1), Err(ProtocolViolation::UnknownPacketId(1)));
    // nor does PUBCOMP before PUBREC
    assert_eq!(state.on_pubcomp(1), Err(ProtocolViolation::UnknownPacketId(1)));

    assert_eq!(state.on_pubrec(1).unwrap(), Packet::PubRel(1));
    assert_eq!(state.unacked(1), Some(&Packet::PubRel(1)));
    assert!(state.pids().contains(1));

    // a repeated PUBREC gets the same PUBREL back
    assert_eq!(state.on_pubrec(1).unwrap(), Packet::PubRel(1));

    state.on_pubcomp(1).unwrap();
    assert_eq!(state.in_flight(), 0);
    assert!(!state.pids().contains(1));
}

#[test]
fn pubrec_for_qos1_publish_is_rejected() {
    let mut state = DeliveryState::default();
    state
        .prepare_publish(&message("t", b"x", QoS::AtLeastOnce), QoS::AtLeastOnce)
        .unwrap();
    assert_eq!(state.on_pubrec(1), Err(ProtocolViolation::UnknownPacketId(1)));
    assert_eq!(state.on_pubrec(7), Err(ProtocolViolation::UnknownPacketId(7)));
    assert_eq!(state.in_flight(), 1);
}

#[test]
fn inbound_qos2_is_accepted_once_until_released() {
    let mut state = DeliveryState::default();
    assert!(state.accept_exactly_once(42));
    assert!(!state.accept_exactly_once(42));

    assert!(state.release_exactly_once(42));
    assert!(!state.release_exactly_once(42));
    assert!(state.accept_exactly_once(42));
}

#[test]
fn client_deliver_queues_publish() {
    let (client, mut rx) = test_client();
    client
        .deliver(&message("a/b", b"hello", QoS::ExactlyOnce), QoS::AtLeastOnce)
        .unwrap();

    let Ok(Packet::Publish(publish)) = rx.try_recv() else {
        panic!("expected PUBLISH");
    };
    assert_eq!(publish.topic, "a/b");
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert_eq!(publish.pid, Some(1));
    assert_eq!(&publish.payload[..], b"hello");
    assert_eq!(client.delivery().in_flight(), 1);
}

#[test]
fn client_deliver_after_stop_fails() {
    let (client, mut rx) = test_client();
    client.stop();
    client.stop();
    assert!(client.is_stopped());
    assert!(matches!(
        client.deliver(&message("t", b"x", QoS::AtMostOnce), QoS::AtMostOnce),
        Err(BrokerError::TransportClosed)
    ));
    assert!(rx.try_recv().is_err());
}

#[test]
fn client_send_on_closed_channel() {
    let (client, rx) = test_client();
    drop(rx);
    assert!(matches!(
        client.send(Packet::PingResp),
        Err(BrokerError::TransportClosed)
    ));
}

#[test]
fn client_alive_flag_is_consumed() {
    let (client, _rx) = test_client();
    assert!(!client.take_alive());
    client.mark_alive();
    assert!(client.take_alive());
    assert!(!client.take_alive());
}

#[tokio::test]
async fn stopped_resolves_after_stop() {
    let (client, _rx) = test_client();
    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.stopped().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    client.stop();
    timeout(Duration::from_secs(1), waiter)
        .await
        .expect("stopped() never resolved")
        .unwrap();
    // already raised: resolves immediately
    timeout(Duration::from_millis(100), client.stopped())
        .await
        .unwrap();
}

#[test]
fn grace_period_is_one_and_a_half_intervals() {
    assert_eq!(
        keepalive::grace_period(Duration::from_secs(60)),
        Duration::from_secs(90)
    );
    assert_eq!(
        keepalive::grace_period(Duration::from_millis(100)),
        Duration::from_millis(150)
    );
}

#[tokio::test]
async fn keepalive_expires_when_idle() {
    let (client, _rx) = test_client();
    let result = timeout(
        Duration::from_secs(2),
        keepalive::monitor(client.clone(), Duration::from_millis(100)),
    )
    .await
    .expect("monitor did not fire");
    assert!(matches!(result, Err(BrokerError::KeepaliveExpired)));
    assert!(client.is_stopped());
}

#[tokio::test]
async fn keepalive_holds_while_traffic_flows() {
    let (client, _rx) = test_client();
    let monitor = tokio::spawn(keepalive::monitor(
        client.clone(),
        Duration::from_millis(100),
    ));

    for _ in 0..10 {
        client.mark_alive();
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    assert!(!monitor.is_finished());
    assert!(!client.is_stopped());

    client.stop();
    let result = timeout(Duration::from_secs(1), monitor).await.unwrap().unwrap();
    assert!(result.is_ok());
}

fn peer() -> SocketAddr {
    "127.0.0.1:50000".parse().unwrap()
}

fn settings(connect_timeout_secs: u64) -> BrokerSettings {
    BrokerSettings {
        connect_timeout_secs,
        ..Settings::default().broker
    }
}

async fn recv(framed: &mut Framed<DuplexStream, MqttCodec>) -> Packet {
    let frame = timeout(Duration::from_secs(1), framed.next())
        .await
        .expect("timed out")
        .expect("closed")
        .expect("decode failed");
    Packet::decode(frame).unwrap()
}

#[tokio::test]
async fn connection_handshake_and_teardown() {
    let broker = Broker::shared();
    let (queue, _queue_rx) = mpsc::channel(8);
    let (server, client_io) = tokio::io::duplex(1024);

    let connection = Connection::new(peer(), broker.clone(), queue, &settings(0));
    assert_eq!(connection.state(), State::AwaitingConnect);
    let task = tokio::spawn(connection.run(server));

    let mut framed = Framed::new(client_io, MqttCodec::default());
    framed
        .send(Packet::Connect(Connect::new("dev-1", 0)))
        .await
        .unwrap();
    assert_eq!(recv(&mut framed).await, Packet::ConnAck(ConnAck::accepted()));

    framed.send(Packet::PingReq).await.unwrap();
    assert_eq!(recv(&mut framed).await, Packet::PingResp);
    assert_eq!(lock(&broker).client_count(), 1);

    drop(framed);
    timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert_eq!(lock(&broker).client_count(), 0);
}

#[tokio::test]
async fn serve_leaves_connection_closed_and_deregistered() {
    let broker = Broker::shared();
    let (queue, _queue_rx) = mpsc::channel(8);
    let (server, client_io) = tokio::io::duplex(1024);
    let mut connection = Connection::new(peer(), broker.clone(), queue, &settings(0));

    let remote = tokio::spawn(async move {
        let mut framed = Framed::new(client_io, MqttCodec::default());
        framed
            .send(Packet::Connect(Connect::new("dev-2", 0)))
            .await
            .unwrap();
        assert_eq!(recv(&mut framed).await, Packet::ConnAck(ConnAck::accepted()));
        framed
            .send(Packet::Subscribe(Subscribe {
                pid: 1,
                topics: vec![("a/b".to_string(), QoS::AtLeastOnce)],
            }))
            .await
            .unwrap();
        assert_eq!(
            recv(&mut framed).await,
            Packet::SubAck(SubAck {
                pid: 1,
                granted: vec![QoS::AtLeastOnce]
            })
        );
        framed.send(Packet::Disconnect).await.unwrap();
    });

    connection.serve(server).await.unwrap();
    remote.await.unwrap();

    assert_eq!(connection.state(), State::Closed);
    let client = connection.client().expect("handshake completed");
    assert_eq!(client.client_id, "dev-2");
    assert!(client.is_stopped());
    let broker = lock(&broker);
    assert_eq!(broker.client_count(), 0);
    assert_eq!(broker.topic_count(), 0);
}

#[tokio::test]
async fn failed_handshake_still_closes() {
    let broker = Broker::shared();
    let (queue, _queue_rx) = mpsc::channel(8);
    let (server, client_io) = tokio::io::duplex(1024);
    let mut connection = Connection::new(peer(), broker.clone(), queue, &settings(0));

    let mut framed = Framed::new(client_io, MqttCodec::default());
    framed.send(Packet::PingReq).await.unwrap();

    let result = connection.serve(server).await;
    assert!(matches!(
        result,
        Err(BrokerError::Protocol(ProtocolViolation::UnexpectedFirstPacket(_)))
    ));
    assert_eq!(connection.state(), State::Closed);
    assert!(connection.client().is_none());
    assert!(framed.next().await.is_none());
    assert_eq!(lock(&broker).client_count(), 0);
}

#[tokio::test]
async fn connection_times_out_without_connect() {
    let broker = Broker::shared();
    let (queue, _queue_rx) = mpsc::channel(8);
    let (server, mut client_io) = tokio::io::duplex(1024);
    let task = tokio::spawn(Connection::new(peer(), broker, queue, &settings(1)).run(server));

    timeout(Duration::from_secs(3), task).await.unwrap().unwrap();
    let mut buf = [0u8; 4];
    let read = client_io.read(&mut buf).await.unwrap();
    assert_eq!(read, 0);
}

#[tokio::test]
async fn acknowledgment_is_written_after_peer_half_closes() {
    for _ in 0..50 {
        let broker = Broker::shared();
        let (queue, mut queue_rx) = mpsc::channel(8);
        let (server, client_io) = tokio::io::duplex(1024);
        let task = tokio::spawn(Connection::new(peer(), broker, queue, &settings(0)).run(server));

        let mut framed = Framed::new(client_io, MqttCodec::default());
        framed
            .send(Packet::Connect(Connect::new("pub", 0)))
            .await
            .unwrap();
        framed
            .send(Packet::Publish(Publish::new(
                "a/b",
                QoS::AtLeastOnce,
                Some(7),
                Bytes::from_static(b"hello"),
            )))
            .await
            .unwrap();
        framed.get_mut().shutdown().await.unwrap();

        let mut received = Vec::new();
        while let Some(frame) = timeout(Duration::from_secs(1), framed.next())
            .await
            .expect("transport was not closed")
        {
            received.push(Packet::decode(frame.unwrap()).unwrap());
        }
        assert_eq!(
            received,
            vec![Packet::ConnAck(ConnAck::accepted()), Packet::PubAck(7)]
        );
        assert_eq!(queue_rx.recv().await.unwrap().topic, "a/b");
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn oversized_packet_closes_connection() {
    let broker = Broker::shared();
    let (queue, mut queue_rx) = mpsc::channel(8);
    let (server, client_io) = tokio::io::duplex(1024);
    let limits = BrokerSettings {
        max_packet_size: 64,
        ..settings(0)
    };
    let mut connection = Connection::new(peer(), broker.clone(), queue, &limits);

    let mut framed = Framed::new(client_io, MqttCodec::default());
    framed
        .send(Packet::Connect(Connect::new("big", 0)))
        .await
        .unwrap();
    framed
        .send(Packet::Publish(Publish::new(
            "t",
            QoS::AtMostOnce,
            None,
            Bytes::from(vec![0u8; 128]),
        )))
        .await
        .unwrap();

    let result = connection.serve(server).await;
    assert!(matches!(
        result,
        Err(BrokerError::Framing(FramingError::PacketTooLarge { size: 131, max: 64 }))
    ));
    assert!(queue_rx.try_recv().is_err());
    assert_eq!(lock(&broker).client_count(), 0);
}
