// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! End-to-end tests against a live broker on an ephemeral port, speaking
//! MQTT 3.1.1 over raw TCP with the codec crate.

use bytes::BytesMut;
use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodePacket, DisconnectPacket,
    EncodePacket, PacketId, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, QoS, SubscribeAck, SubscribeAckPacket,
    SubscribePacket,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use apiary::auth::DictAuth;
use apiary::{Broker, Config};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_broker(mut config: Config) -> SocketAddr {
    config.set_bind_addr("127.0.0.1");
    config.set_port(0);
    let broker = Broker::bind(config).await.unwrap();
    let addr = broker.local_addr().unwrap();
    tokio::spawn(broker.run_loop());
    // Give the run loop a moment to drain its startup timer ticks.
    tokio::time::sleep(Duration::from_millis(150)).await;
    addr
}

async fn start_default_broker() -> SocketAddr {
    start_broker(Config::default()).await
}

struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    async fn open(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream,
            buf: BytesMut::with_capacity(1024),
        }
    }

    /// Connect with clean-session and read the CONNACK.
    async fn connect(addr: SocketAddr, client_id: &str) -> Self {
        let mut client = Self::open(addr).await;
        let packet = ConnectPacket::new(client_id);
        client.send(&packet).await;
        let ack = client.expect_connack().await;
        assert_eq!(ack.return_code(), ConnectReturnCode::Accepted);
        client
    }

    async fn send<P: EncodePacket>(&mut self, packet: &P) {
        let mut out = Vec::new();
        packet.encode(&mut out).unwrap();
        self.stream.write_all(&out).await.unwrap();
    }

    /// Read one complete packet, fixed header included.
    async fn read_frame(&mut self) -> Vec<u8> {
        loop {
            if let Some(frame) = Self::take_frame(&mut self.buf) {
                return frame;
            }
            let n_recv = tokio::time::timeout(READ_TIMEOUT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for a packet")
                .unwrap();
            assert!(n_recv > 0, "connection closed while waiting for a packet");
        }
    }

    fn take_frame(buf: &mut BytesMut) -> Option<Vec<u8>> {
        if buf.len() < 2 {
            return None;
        }
        let mut remaining: usize = 0;
        let mut multiplier: usize = 1;
        let mut idx = 1;
        loop {
            if idx >= buf.len() {
                return None;
            }
            let byte = usize::from(buf[idx]);
            idx += 1;
            remaining += (byte & 0x7f) * multiplier;
            if byte & 0x80 == 0 {
                break;
            }
            multiplier *= 128;
        }
        let total = idx + remaining;
        if buf.len() < total {
            return None;
        }
        Some(buf.split_to(total).to_vec())
    }

    /// True if the broker closed the stream (no further packet pending).
    async fn closed(&mut self) -> bool {
        match tokio::time::timeout(READ_TIMEOUT, self.stream.read_buf(&mut self.buf)).await {
            Ok(Ok(0)) => true,
            Ok(Ok(_)) => false,
            Ok(Err(_)) => true,
            Err(_) => false,
        }
    }

    async fn expect_connack(&mut self) -> ConnectAckPacket {
        let frame = self.read_frame().await;
        ConnectAckPacket::decode(&mut ByteArray::new(&frame)).unwrap()
    }

    async fn expect_publish(&mut self) -> PublishPacket {
        let frame = self.read_frame().await;
        assert_eq!(frame[0] >> 4, 3, "expected PUBLISH, got {:#x}", frame[0]);
        PublishPacket::decode(&mut ByteArray::new(&frame)).unwrap()
    }

    async fn expect_puback(&mut self) -> PublishAckPacket {
        let frame = self.read_frame().await;
        PublishAckPacket::decode(&mut ByteArray::new(&frame)).unwrap()
    }

    async fn expect_pubrec(&mut self) -> PublishReceivedPacket {
        let frame = self.read_frame().await;
        PublishReceivedPacket::decode(&mut ByteArray::new(&frame)).unwrap()
    }

    async fn expect_pubcomp(&mut self) -> PublishCompletePacket {
        let frame = self.read_frame().await;
        PublishCompletePacket::decode(&mut ByteArray::new(&frame)).unwrap()
    }

    /// Subscribe and collect any retained publishes delivered ahead of the
    /// SUBACK.
    async fn subscribe(
        &mut self,
        packet_id: u16,
        filter: &str,
        qos: QoS,
    ) -> (Vec<PublishPacket>, SubscribeAckPacket) {
        let packet = SubscribePacket::new(PacketId::new(packet_id), filter, qos);
        self.send(&packet).await;

        let mut publishes = Vec::new();
        loop {
            let frame = self.read_frame().await;
            match frame[0] >> 4 {
                3 => publishes.push(PublishPacket::decode(&mut ByteArray::new(&frame)).unwrap()),
                9 => {
                    let ack = SubscribeAckPacket::decode(&mut ByteArray::new(&frame)).unwrap();
                    assert_eq!(ack.packet_id(), PacketId::new(packet_id));
                    return (publishes, ack);
                }
                t => panic!("unexpected packet type {t} while waiting for SUBACK"),
            }
        }
    }
}

#[tokio::test]
async fn test_qos1_publish_and_ack() {
    let addr = start_default_broker().await;

    let mut subscriber = TestClient::connect(addr, "c1").await;
    let (retained, ack) = subscriber.subscribe(1, "sensor/temp", QoS::AtLeastOnce).await;
    assert!(retained.is_empty());
    assert_eq!(ack.acks(), &[SubscribeAck::QoS(QoS::AtLeastOnce)]);

    let mut publisher = TestClient::connect(addr, "c2").await;
    let mut publish = PublishPacket::new("sensor/temp", QoS::AtLeastOnce, b"22.5").unwrap();
    publish.set_packet_id(PacketId::new(7));
    publisher.send(&publish).await;

    // The publisher gets its PUBACK back with the same id.
    let puback = publisher.expect_puback().await;
    assert_eq!(puback.packet_id(), PacketId::new(7));

    // The subscriber sees the message at QoS 1 under a broker-assigned id.
    let delivered = subscriber.expect_publish().await;
    assert_eq!(delivered.topic(), "sensor/temp");
    assert_eq!(delivered.message(), b"22.5");
    assert_eq!(delivered.qos(), QoS::AtLeastOnce);
    assert_ne!(delivered.packet_id(), PacketId::new(0));
    assert!(!delivered.retain());

    subscriber
        .send(&PublishAckPacket::new(delivered.packet_id()))
        .await;
}

#[tokio::test]
async fn test_qos2_downgraded_to_qos0_subscriber() {
    let addr = start_default_broker().await;

    let mut subscriber = TestClient::connect(addr, "c1").await;
    let (_, ack) = subscriber.subscribe(1, "weather/#", QoS::AtMostOnce).await;
    assert_eq!(ack.acks(), &[SubscribeAck::QoS(QoS::AtMostOnce)]);

    let mut publisher = TestClient::connect(addr, "c2").await;
    let mut publish = PublishPacket::new("weather/rain", QoS::ExactOnce, b"heavy").unwrap();
    publish.set_packet_id(PacketId::new(5));
    publisher.send(&publish).await;

    // Full QoS 2 handshake with the publisher.
    let pubrec = publisher.expect_pubrec().await;
    assert_eq!(pubrec.packet_id(), PacketId::new(5));
    publisher
        .send(&PublishReleasePacket::new(PacketId::new(5)))
        .await;
    let pubcomp = publisher.expect_pubcomp().await;
    assert_eq!(pubcomp.packet_id(), PacketId::new(5));

    // The subscriber is capped at its granted QoS 0.
    let delivered = subscriber.expect_publish().await;
    assert_eq!(delivered.topic(), "weather/rain");
    assert_eq!(delivered.qos(), QoS::AtMostOnce);
    assert_eq!(delivered.packet_id(), PacketId::new(0));
}

#[tokio::test]
async fn test_resent_pubrel_is_not_delivered_twice() {
    let addr = start_default_broker().await;

    let mut subscriber = TestClient::connect(addr, "c1").await;
    subscriber.subscribe(1, "once", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr, "c2").await;
    let mut publish = PublishPacket::new("once", QoS::ExactOnce, b"x").unwrap();
    publish.set_packet_id(PacketId::new(9));
    publisher.send(&publish).await;
    publisher.expect_pubrec().await;

    publisher
        .send(&PublishReleasePacket::new(PacketId::new(9)))
        .await;
    publisher.expect_pubcomp().await;
    subscriber.expect_publish().await;

    // The duplicate PUBREL is acknowledged again but routes nothing.
    publisher
        .send(&PublishReleasePacket::new(PacketId::new(9)))
        .await;
    publisher.expect_pubcomp().await;

    let mut ping_probe = PublishPacket::new("once", QoS::AtMostOnce, b"probe").unwrap();
    ping_probe.set_retain(false);
    publisher.send(&ping_probe).await;

    // Next message the subscriber sees is the probe, not a replay.
    let delivered = subscriber.expect_publish().await;
    assert_eq!(delivered.message(), b"probe");
}

#[tokio::test]
async fn test_retained_delivery_on_wildcard_subscribe() {
    let addr = start_default_broker().await;

    let mut publisher = TestClient::connect(addr, "pub").await;
    for (topic, payload) in [("home/kitchen/temp", "20"), ("home/bedroom/temp", "18")] {
        let mut publish = PublishPacket::new(topic, QoS::AtMostOnce, payload.as_bytes()).unwrap();
        publish.set_retain(true);
        publisher.send(&publish).await;
    }
    // QoS 0 publishes carry no ack; give the broker a moment to store them.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut subscriber = TestClient::connect(addr, "sub").await;
    let (retained, ack) = subscriber.subscribe(1, "home/+/temp", QoS::AtMostOnce).await;
    assert_eq!(ack.acks(), &[SubscribeAck::QoS(QoS::AtMostOnce)]);

    let mut seen: Vec<(String, Vec<u8>)> = retained
        .iter()
        .map(|publish| {
            assert!(publish.retain());
            assert_eq!(publish.qos(), QoS::AtMostOnce);
            (publish.topic().to_string(), publish.message().to_vec())
        })
        .collect();
    seen.sort();
    assert_eq!(
        seen,
        [
            ("home/bedroom/temp".to_string(), b"18".to_vec()),
            ("home/kitchen/temp".to_string(), b"20".to_vec()),
        ]
    );
}

#[tokio::test]
async fn test_sys_topics_hidden_from_hash_wildcard() {
    let addr = start_default_broker().await;

    let mut subscriber = TestClient::connect(addr, "c1").await;

    // '#' must not reveal the retained $SYS topics published at startup.
    let (retained, _ack) = subscriber.subscribe(1, "#", QoS::AtMostOnce).await;
    assert!(
        retained.is_empty(),
        "# subscription leaked $SYS topics: {retained:?}"
    );

    // An explicit $SYS filter does receive them.
    let (retained, _ack) = subscriber.subscribe(2, "$SYS/#", QoS::AtMostOnce).await;
    assert!(!retained.is_empty());
    for publish in &retained {
        assert!(publish.topic().starts_with("$SYS/broker/"));
        assert!(publish.retain());
    }
    assert!(retained
        .iter()
        .any(|publish| publish.topic() == "$SYS/broker/version"));
}

#[tokio::test]
async fn test_duplicate_client_id_displaces_and_fires_will() {
    let addr = start_default_broker().await;

    let mut observer = TestClient::connect(addr, "obs").await;
    observer.subscribe(1, "wills/dup", QoS::AtMostOnce).await;

    // First 'dup' connection registers a will.
    let mut first = TestClient::open(addr).await;
    let mut connect = ConnectPacket::new("dup");
    connect
        .set_will("wills/dup", b"gone", QoS::AtMostOnce, false)
        .unwrap();
    first.send(&connect).await;
    let ack = first.expect_connack().await;
    assert_eq!(ack.return_code(), ConnectReturnCode::Accepted);
    assert!(!ack.session_present());

    // Second connection with the same id takes over.
    let second = TestClient::connect(addr, "dup").await;

    // The displaced socket is closed and its will is published.
    assert!(first.closed().await);
    let will = observer.expect_publish().await;
    assert_eq!(will.topic(), "wills/dup");
    assert_eq!(will.message(), b"gone");

    drop(second);
}

#[tokio::test]
async fn test_graceful_disconnect_suppresses_will() {
    let addr = start_default_broker().await;

    let mut observer = TestClient::connect(addr, "obs").await;
    observer.subscribe(1, "wills/+", QoS::AtMostOnce).await;

    let mut client = TestClient::open(addr).await;
    let mut connect = ConnectPacket::new("polite");
    connect
        .set_will("wills/polite", b"gone", QoS::AtMostOnce, false)
        .unwrap();
    client.send(&connect).await;
    client.expect_connack().await;

    client.send(&DisconnectPacket::new()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Probe that routing still works and nothing else arrived first.
    let mut publisher = TestClient::connect(addr, "probe").await;
    let probe = PublishPacket::new("wills/probe", QoS::AtMostOnce, b"x").unwrap();
    publisher.send(&probe).await;

    let delivered = observer.expect_publish().await;
    assert_eq!(delivered.topic(), "wills/probe");
}

#[tokio::test]
async fn test_persistent_session_resume_with_queued_messages() {
    let addr = start_default_broker().await;

    // Persistent subscriber connects, subscribes and leaves gracefully.
    let mut subscriber = TestClient::open(addr).await;
    let mut connect = ConnectPacket::new("pers");
    connect.set_clean_session(false);
    subscriber.send(&connect).await;
    let ack = subscriber.expect_connack().await;
    assert!(!ack.session_present());

    let (_, ack) = subscriber.subscribe(1, "jobs", QoS::AtLeastOnce).await;
    assert_eq!(ack.acks(), &[SubscribeAck::QoS(QoS::AtLeastOnce)]);
    subscriber.send(&DisconnectPacket::new()).await;
    drop(subscriber);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Two QoS 1 messages arrive while the subscriber is away.
    let mut publisher = TestClient::connect(addr, "worker").await;
    for (packet_id, payload) in [(1u16, &b"doA"[..]), (2u16, &b"doB"[..])] {
        let mut publish = PublishPacket::new("jobs", QoS::AtLeastOnce, payload).unwrap();
        publish.set_packet_id(PacketId::new(packet_id));
        publisher.send(&publish).await;
        publisher.expect_puback().await;
    }

    // The resumed session receives both, in publish order.
    let mut subscriber = TestClient::open(addr).await;
    let mut connect = ConnectPacket::new("pers");
    connect.set_clean_session(false);
    subscriber.send(&connect).await;
    let ack = subscriber.expect_connack().await;
    assert!(ack.session_present());

    for expected in [&b"doA"[..], &b"doB"[..]] {
        let delivered = subscriber.expect_publish().await;
        assert_eq!(delivered.topic(), "jobs");
        assert_eq!(delivered.message(), expected);
        assert_eq!(delivered.qos(), QoS::AtLeastOnce);
        assert_ne!(delivered.packet_id(), PacketId::new(0));
        subscriber
            .send(&PublishAckPacket::new(delivered.packet_id()))
            .await;
    }
}

#[tokio::test]
async fn test_bad_credentials_rejected_with_connack_4() {
    let mut users = HashMap::new();
    users.insert("bee".to_string(), "hive".to_string());

    let mut config = Config::default();
    config.set_bind_addr("127.0.0.1");
    config.set_port(0);
    let mut broker = Broker::bind(config).await.unwrap();
    broker.set_auth_provider(Box::new(DictAuth::new(users)));
    let addr = broker.local_addr().unwrap();
    tokio::spawn(broker.run_loop());

    // Wrong password.
    let mut client = TestClient::open(addr).await;
    let mut connect = ConnectPacket::new("c1");
    connect.set_username("bee");
    connect.set_password(b"wrong");
    client.send(&connect).await;
    let ack = client.expect_connack().await;
    assert_eq!(ack.return_code(), ConnectReturnCode::BadUserNameOrPassword);
    assert!(client.closed().await);

    // Correct password.
    let mut client = TestClient::open(addr).await;
    let mut connect = ConnectPacket::new("c1");
    connect.set_username("bee");
    connect.set_password(b"hive");
    client.send(&connect).await;
    let ack = client.expect_connack().await;
    assert_eq!(ack.return_code(), ConnectReturnCode::Accepted);
}

#[tokio::test]
async fn test_oversize_payload_dropped_but_acked() {
    let config: Config = toml::from_str("max_payload_size = 8\nmax_packet_size = 8192").unwrap();
    let addr = start_broker(config).await;

    let mut subscriber = TestClient::connect(addr, "c1").await;
    subscriber.subscribe(1, "big", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr, "c2").await;
    let mut publish =
        PublishPacket::new("big", QoS::AtLeastOnce, b"way too large payload").unwrap();
    publish.set_packet_id(PacketId::new(3));
    publisher.send(&publish).await;

    // The publisher still sees its PUBACK.
    let puback = publisher.expect_puback().await;
    assert_eq!(puback.packet_id(), PacketId::new(3));

    // The subscriber only ever sees the follow-up probe.
    let probe = PublishPacket::new("big", QoS::AtMostOnce, b"ok").unwrap();
    publisher.send(&probe).await;
    let delivered = subscriber.expect_publish().await;
    assert_eq!(delivered.message(), b"ok");
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let addr = start_default_broker().await;

    let mut subscriber = TestClient::connect(addr, "c1").await;
    subscriber.subscribe(1, "a/b", QoS::AtMostOnce).await;

    let unsubscribe = codec::UnsubscribePacket::new(PacketId::new(2), "a/b");
    subscriber.send(&unsubscribe).await;
    let frame = subscriber.read_frame().await;
    let ack = codec::UnsubscribeAckPacket::decode(&mut ByteArray::new(&frame)).unwrap();
    assert_eq!(ack.packet_id(), PacketId::new(2));

    subscriber.subscribe(3, "a/probe", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr, "c2").await;
    publisher
        .send(&PublishPacket::new("a/b", QoS::AtMostOnce, b"lost").unwrap())
        .await;
    publisher
        .send(&PublishPacket::new("a/probe", QoS::AtMostOnce, b"seen").unwrap())
        .await;

    let delivered = subscriber.expect_publish().await;
    assert_eq!(delivered.topic(), "a/probe");
    assert_eq!(delivered.message(), b"seen");
}
