//! Broker conformance tests
//!
//! Drives the real broker over loopback TCP with a minimal client built on
//! the crate's own codec, and checks the externally observable protocol
//! behavior: fan-out, acknowledgment flows, retained messages, wills and
//! persistent sessions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use embermq::broker::{Broker, BrokerConfig};
use embermq::codec::{Decoder, Encoder};
use embermq::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS,
    SubAck, Subscribe, SubscribeFilter, SubscribeReturnCode, Will,
};

// Atomic port counter to avoid conflicts between parallel tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19100);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_config(port: u16) -> BrokerConfig {
    BrokerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
        ws_bind_addr: None,
        ws_path: "/mqtt".to_string(),
        tls: None,
        max_connections: 100,
        max_packet_size: 1024 * 1024,
        connect_timeout: Duration::from_secs(5),
        message_queue_limit: 100,
        inflight_window: 32,
        max_awaiting_rel: 100,
        retry_interval: Duration::from_millis(400),
        max_retries: 3,
        outbound_channel_capacity: 64,
        session_expiry_check_interval: Duration::from_secs(60),
        session_ttl: Duration::from_secs(3600),
        retained_message_limit: 1000,
        persistence_enabled: false,
    }
}

async fn start_broker(config: BrokerConfig) -> SocketAddr {
    let addr = config.bind_addr;
    let broker = Arc::new(Broker::new(config));
    tokio::spawn(async move { broker.run().await });

    // Wait for the listener to come up, then let the probe connection's
    // admission slot drain before any test client connects
    for _ in 0..50 {
        if TcpStream::connect(addr).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("broker did not start on {}", addr);
}

/// Minimal MQTT client for driving the broker in tests
struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("failed to connect");
        Self {
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            buf: BytesMut::new(),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf).expect("encode failed");
        self.stream.write_all(&buf).await.expect("write failed");
    }

    /// Receive the next packet, waiting up to `wait` for it
    async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match self.decoder.decode(&self.buf) {
                Ok(Some((packet, consumed))) => {
                    self.buf.advance(consumed);
                    return Some(packet);
                }
                Ok(None) => {}
                Err(_) => return None,
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let mut chunk = [0u8; 4096];
            match timeout(remaining, self.stream.read(&mut chunk)).await {
                Ok(Ok(n)) if n > 0 => self.buf.extend_from_slice(&chunk[..n]),
                _ => return None,
            }
        }
    }

    async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(Duration::from_secs(5)).await
    }

    async fn mqtt_connect(&mut self, client_id: &str, clean_session: bool) -> ConnAck {
        self.mqtt_connect_with(client_id, clean_session, None).await
    }

    async fn mqtt_connect_with(
        &mut self,
        client_id: &str,
        clean_session: bool,
        will: Option<Will>,
    ) -> ConnAck {
        self.send(&Packet::Connect(Box::new(Connect {
            client_id: client_id.to_string(),
            clean_session,
            keep_alive: 60,
            username: None,
            password: None,
            will,
        })))
        .await;

        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> SubAck {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            filters: vec![SubscribeFilter {
                filter: filter.to_string(),
                qos,
            }],
        }))
        .await;

        match self.recv().await {
            Some(Packet::SubAck(ack)) => ack,
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool, packet_id: Option<u16>) {
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload: Bytes::copy_from_slice(payload),
        }))
        .await;
    }

    async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    async fn disconnect(mut self) {
        self.send(&Packet::Disconnect).await;
        let _ = self.stream.shutdown().await;
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn qos0_fanout_through_single_level_wildcard() {
    let addr = start_broker(test_config(next_port())).await;

    let mut sub = TestClient::connect(addr).await;
    assert_eq!(
        sub.mqtt_connect("sub", true).await.return_code,
        ConnectReturnCode::Accepted
    );
    sub.subscribe(1, "sensors/+/temp", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;
    publisher
        .publish("sensors/a/temp", &[0x32, 0x35], QoS::AtMostOnce, false, None)
        .await;

    let publish = sub.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "sensors/a/temp");
    assert_eq!(publish.payload.as_ref(), &[0x32, 0x35]);
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert!(!publish.retain);

    // QoS 0 has no acknowledgments; nothing else arrives
    assert!(publisher.recv_within(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn qos1_publish_acknowledged_and_delivered() {
    let addr = start_broker(test_config(next_port())).await;

    let mut sub = TestClient::connect(addr).await;
    sub.mqtt_connect("sub", true).await;
    let suback = sub.subscribe(1, "a/b", QoS::AtLeastOnce).await;
    assert_eq!(suback.return_codes, vec![SubscribeReturnCode::QoS1]);

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;
    publisher.publish("a/b", &[0x01], QoS::AtLeastOnce, false, Some(7)).await;

    // Broker acknowledges the publisher with the publisher's packet id
    match publisher.recv().await {
        Some(Packet::PubAck(PubAck { packet_id })) => assert_eq!(packet_id, 7),
        other => panic!("expected PUBACK(7), got {:?}", other),
    }

    // Subscriber sees the message at qos 1 with a broker-assigned id
    let publish = sub.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert_eq!(publish.payload.as_ref(), &[0x01]);
    let broker_id = publish.packet_id.expect("qos 1 delivery needs a packet id");

    sub.send(&Packet::PubAck(PubAck { packet_id: broker_id })).await;

    // Acked: no retransmission even after the retry interval passes
    assert!(sub.recv_within(Duration::from_millis(900)).await.is_none());
}

#[tokio::test]
async fn qos1_unacked_delivery_is_retransmitted_with_dup() {
    let addr = start_broker(test_config(next_port())).await;

    let mut sub = TestClient::connect(addr).await;
    sub.mqtt_connect("sub", true).await;
    sub.subscribe(1, "a/b", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;
    publisher.publish("a/b", b"r", QoS::AtLeastOnce, false, Some(1)).await;

    let first = sub.expect_publish().await;
    assert!(!first.dup);

    // Withhold PUBACK; the sweep must resend with dup set and the same id
    let retry = sub.expect_publish().await;
    assert!(retry.dup);
    assert_eq!(retry.packet_id, first.packet_id);

    sub.send(&Packet::PubAck(PubAck {
        packet_id: retry.packet_id.unwrap(),
    }))
    .await;
}

#[tokio::test]
async fn qos2_duplicate_publish_routes_exactly_once() {
    let addr = start_broker(test_config(next_port())).await;

    let mut sub = TestClient::connect(addr).await;
    sub.mqtt_connect("sub", true).await;
    sub.subscribe(1, "e/once", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;

    // First PUBLISH with packet id 9
    publisher.publish("e/once", b"x", QoS::ExactlyOnce, false, Some(9)).await;
    match publisher.recv().await {
        Some(Packet::PubRec(PubRec { packet_id })) => assert_eq!(packet_id, 9),
        other => panic!("expected PUBREC(9), got {:?}", other),
    }

    // Duplicate PUBLISH with the same id before PUBREL
    publisher.publish("e/once", b"x", QoS::ExactlyOnce, false, Some(9)).await;
    match publisher.recv().await {
        Some(Packet::PubRec(PubRec { packet_id })) => assert_eq!(packet_id, 9),
        other => panic!("expected second PUBREC(9), got {:?}", other),
    }

    // Release
    publisher.send(&Packet::PubRel(PubRel { packet_id: 9 })).await;
    match publisher.recv().await {
        Some(Packet::PubComp(PubComp { packet_id })) => assert_eq!(packet_id, 9),
        other => panic!("expected PUBCOMP(9), got {:?}", other),
    }

    // Routed exactly once despite the duplicate
    let publish = sub.expect_publish().await;
    assert_eq!(publish.payload.as_ref(), b"x");
    assert!(sub.recv_within(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn retained_message_delivered_to_late_subscriber() {
    let addr = start_broker(test_config(next_port())).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;
    publisher
        .publish("status/x", &[0x4F, 0x4B], QoS::AtMostOnce, true, None)
        .await;

    // Give the broker a moment to store the retained message
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut sub = TestClient::connect(addr).await;
    sub.mqtt_connect("sub", true).await;
    sub.subscribe(1, "status/+", QoS::AtMostOnce).await;

    let publish = sub.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "status/x");
    assert_eq!(publish.payload.as_ref(), &[0x4F, 0x4B]);
    assert!(publish.retain);
}

#[tokio::test]
async fn empty_retained_payload_deletes_entry() {
    let addr = start_broker(test_config(next_port())).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;
    publisher.publish("status/x", b"OK", QoS::AtMostOnce, true, None).await;
    publisher.publish("status/x", b"", QoS::AtMostOnce, true, None).await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut sub = TestClient::connect(addr).await;
    sub.mqtt_connect("sub", true).await;
    sub.subscribe(1, "status/+", QoS::AtMostOnce).await;

    assert!(sub.recv_within(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn abrupt_disconnect_publishes_will() {
    let addr = start_broker(test_config(next_port())).await;

    let mut sub = TestClient::connect(addr).await;
    sub.mqtt_connect("sub", true).await;
    sub.subscribe(1, "dev/+/lwt", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher
        .mqtt_connect_with(
            "pub",
            true,
            Some(Will {
                topic: "dev/pub/lwt".to_string(),
                payload: Bytes::from_static(&[0x62, 0x79, 0x65]),
                qos: QoS::AtLeastOnce,
                retain: false,
            }),
        )
        .await;

    // Drop the transport without DISCONNECT
    drop(publisher);

    let publish = sub.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "dev/pub/lwt");
    assert_eq!(publish.payload.as_ref(), &[0x62, 0x79, 0x65]);
}

#[tokio::test]
async fn graceful_disconnect_suppresses_will() {
    let addr = start_broker(test_config(next_port())).await;

    let mut sub = TestClient::connect(addr).await;
    sub.mqtt_connect("sub", true).await;
    sub.subscribe(1, "dev/+/lwt", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher
        .mqtt_connect_with(
            "pub",
            true,
            Some(Will {
                topic: "dev/pub/lwt".to_string(),
                payload: Bytes::from_static(b"bye"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
        )
        .await;

    publisher.disconnect().await;

    assert!(sub.recv_within(Duration::from_millis(500)).await.is_none());
}

#[tokio::test]
async fn persistent_session_queues_messages_while_offline() {
    let addr = start_broker(test_config(next_port())).await;

    // Subscribe with a persistent session, then disconnect
    let mut sub = TestClient::connect(addr).await;
    let ack = sub.mqtt_connect("s1", false).await;
    assert!(!ack.session_present);
    sub.subscribe(1, "q/#", QoS::AtLeastOnce).await;
    sub.disconnect().await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    // Publish three messages while the subscriber is away
    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;
    for (i, topic) in ["q/1", "q/2", "q/3"].iter().enumerate() {
        publisher
            .publish(topic, &[i as u8], QoS::AtLeastOnce, false, Some(i as u16 + 1))
            .await;
        match publisher.recv().await {
            Some(Packet::PubAck(_)) => {}
            other => panic!("expected PUBACK, got {:?}", other),
        }
    }

    // Reconnect: session present, queued messages arrive in order
    let mut sub = TestClient::connect(addr).await;
    let ack = sub.mqtt_connect("s1", false).await;
    assert!(ack.session_present);

    for expected in ["q/1", "q/2", "q/3"] {
        let publish = sub.expect_publish().await;
        assert_eq!(publish.topic.as_ref(), expected);
        if let Some(id) = publish.packet_id {
            sub.send(&Packet::PubAck(PubAck { packet_id: id })).await;
        }
    }
}

#[tokio::test]
async fn clean_session_discards_subscriptions() {
    let addr = start_broker(test_config(next_port())).await;

    let mut sub = TestClient::connect(addr).await;
    sub.mqtt_connect("c1", true).await;
    sub.subscribe(1, "q/#", QoS::AtLeastOnce).await;
    sub.disconnect().await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    // Reconnect: no session, no subscriptions
    let mut sub = TestClient::connect(addr).await;
    let ack = sub.mqtt_connect("c1", true).await;
    assert!(!ack.session_present);

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;
    publisher.publish("q/1", b"x", QoS::AtMostOnce, false, None).await;

    assert!(sub.recv_within(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn qos_downgraded_to_subscription_grant() {
    let addr = start_broker(test_config(next_port())).await;

    let mut sub = TestClient::connect(addr).await;
    sub.mqtt_connect("sub", true).await;
    sub.subscribe(1, "d/t", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;
    publisher.publish("d/t", b"x", QoS::ExactlyOnce, false, Some(4)).await;
    match publisher.recv().await {
        Some(Packet::PubRec(_)) => {}
        other => panic!("expected PUBREC, got {:?}", other),
    }

    // Granted qos 0 means delivery at qos 0, no packet id
    let publish = sub.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert_eq!(publish.packet_id, None);
}

#[tokio::test]
async fn publish_ordering_preserved_per_subscriber() {
    let addr = start_broker(test_config(next_port())).await;

    let mut sub = TestClient::connect(addr).await;
    sub.mqtt_connect("sub", true).await;
    sub.subscribe(1, "ord/#", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;

    for i in 0..10u8 {
        publisher
            .publish("ord/t", &[i], QoS::AtLeastOnce, false, Some(i as u16 + 1))
            .await;
        match publisher.recv().await {
            Some(Packet::PubAck(_)) => {}
            other => panic!("expected PUBACK, got {:?}", other),
        }
    }

    for i in 0..10u8 {
        let publish = sub.expect_publish().await;
        assert_eq!(publish.payload.as_ref(), &[i]);
        if let Some(id) = publish.packet_id {
            sub.send(&Packet::PubAck(PubAck { packet_id: id })).await;
        }
    }
}

#[tokio::test]
async fn connection_limit_refuses_excess_sockets() {
    let mut config = test_config(next_port());
    config.max_connections = 1;
    let addr = start_broker(config).await;

    // start_broker consumed its probe socket already; the single slot is free
    let mut first = TestClient::connect(addr).await;
    assert_eq!(
        first.mqtt_connect("c1", true).await.return_code,
        ConnectReturnCode::Accepted
    );

    // Second socket is closed without a CONNACK; the write may race the
    // broker-side close, so errors are tolerated on this side
    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut buf = BytesMut::new();
    Encoder::new()
        .encode(
            &Packet::Connect(Box::new(Connect {
                client_id: "c2".to_string(),
                clean_session: true,
                keep_alive: 60,
                username: None,
                password: None,
                will: None,
            })),
            &mut buf,
        )
        .unwrap();
    let _ = second.write_all(&buf).await;

    let mut read_buf = [0u8; 64];
    match timeout(Duration::from_secs(1), second.read(&mut read_buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(n)) => panic!("expected no CONNACK, got {} bytes", n),
        Err(_) => panic!("socket was not closed"),
    }
}

#[tokio::test]
async fn ping_is_answered() {
    let addr = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("c1", true).await;
    client.send(&Packet::PingReq).await;

    match client.recv().await {
        Some(Packet::PingResp) => {}
        other => panic!("expected PINGRESP, got {:?}", other),
    }
}

#[tokio::test]
async fn invalid_subscription_filter_gets_failure_code() {
    let addr = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("c1", true).await;

    client
        .send(&Packet::Subscribe(Subscribe {
            packet_id: 5,
            filters: vec![
                SubscribeFilter {
                    filter: "bad/#/filter".to_string(),
                    qos: QoS::AtMostOnce,
                },
                SubscribeFilter {
                    filter: "good/+".to_string(),
                    qos: QoS::AtLeastOnce,
                },
            ],
        }))
        .await;

    match client.recv().await {
        Some(Packet::SubAck(SubAck {
            packet_id,
            return_codes,
        })) => {
            assert_eq!(packet_id, 5);
            assert_eq!(
                return_codes,
                vec![SubscribeReturnCode::Failure, SubscribeReturnCode::QoS1]
            );
        }
        other => panic!("expected SUBACK, got {:?}", other),
    }
}
