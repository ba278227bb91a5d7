// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! QoS 1/2 state machines.
//!
//! Packet ids are shared between the QoS 1 and QoS 2 flows of a session, so
//! each acknowledgement type must only ever touch its own table: PUBACK the
//! outbound QoS 1 table, PUBREC/PUBCOMP the outbound QoS 2 table, PUBREL the
//! inbound QoS 2 table.

use bytes::Bytes;
use codec::{PacketId, PublishPacket, PublishReleasePacket, QoS};
use std::time::{Duration, Instant};

use crate::commands::BrokerToConnectionCmd;
use crate::config::Config;
use crate::session::Session;

/// Outbound QoS 1 PUBLISH awaiting PUBACK.
#[derive(Debug, Clone)]
pub struct OutboundQoS1 {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retry_count: u32,
    pub timestamp: Instant,
}

/// Inbound QoS 2 PUBLISH; the broker answered PUBREC and waits for PUBREL.
///
/// The entry is erased when PUBREL hands the message to the router, so a
/// resent PUBREL after PUBCOMP finds nothing and causes no second delivery.
#[derive(Debug, Clone)]
pub struct InboundQoS2 {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS2OutState {
    AwaitingPubRec,
    AwaitingPubComp,
}

/// Outbound QoS 2 PUBLISH sent to a subscriber.
#[derive(Debug, Clone)]
pub struct OutboundQoS2 {
    pub topic: String,
    pub payload: Bytes,
    pub state: QoS2OutState,
    pub retry_count: u32,
    pub timestamp: Instant,
}

/// Drives the per-session pending tables. Owns no state of its own.
#[derive(Debug)]
pub struct QoSManager {
    retry_interval: Duration,
    max_retries: u32,
}

impl QoSManager {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            retry_interval: config.qos_retry_interval(),
            max_retries: config.qos_max_retries(),
        }
    }

    /// Track an outbound QoS 1 PUBLISH awaiting PUBACK.
    pub fn track_outbound_qos1(
        &self,
        session: &mut Session,
        packet_id: PacketId,
        topic: &str,
        payload: Bytes,
        qos: QoS,
    ) {
        session.pending_qos1.insert(
            packet_id,
            OutboundQoS1 {
                topic: topic.to_string(),
                payload,
                qos,
                retry_count: 0,
                timestamp: Instant::now(),
            },
        );
    }

    /// Handle PUBACK. An unsolicited ack is tolerated and reported as false.
    pub fn handle_puback(&self, session: &mut Session, packet_id: PacketId) -> bool {
        session.pending_qos1.remove(&packet_id).is_some()
    }

    /// Track an inbound QoS 2 PUBLISH; the caller sends PUBREC.
    pub fn track_inbound_qos2(
        &self,
        session: &mut Session,
        packet_id: PacketId,
        topic: &str,
        payload: Bytes,
        retain: bool,
    ) {
        session.pending_qos2_in.insert(
            packet_id,
            InboundQoS2 {
                topic: topic.to_string(),
                payload,
                retain,
                timestamp: Instant::now(),
            },
        );
    }

    /// Handle PUBREL: hand the stored message back for routing and erase
    /// the entry. Returns None for an unknown packet id, which the caller
    /// still answers with PUBCOMP.
    pub fn handle_pubrel(
        &self,
        session: &mut Session,
        packet_id: PacketId,
    ) -> Option<(String, Bytes, bool)> {
        session
            .pending_qos2_in
            .remove(&packet_id)
            .map(|entry| (entry.topic, entry.payload, entry.retain))
    }

    /// Track an outbound QoS 2 PUBLISH awaiting PUBREC.
    pub fn track_outbound_qos2(
        &self,
        session: &mut Session,
        packet_id: PacketId,
        topic: &str,
        payload: Bytes,
    ) {
        session.pending_qos2_out.insert(
            packet_id,
            OutboundQoS2 {
                topic: topic.to_string(),
                payload,
                state: QoS2OutState::AwaitingPubRec,
                retry_count: 0,
                timestamp: Instant::now(),
            },
        );
    }

    /// Handle PUBREC from a subscriber; the caller emits PUBREL when this
    /// returns true.
    pub fn handle_pubrec(&self, session: &mut Session, packet_id: PacketId) -> bool {
        let Some(entry) = session.pending_qos2_out.get_mut(&packet_id) else {
            return false;
        };
        if entry.state == QoS2OutState::AwaitingPubRec {
            entry.state = QoS2OutState::AwaitingPubComp;
            // Retry timing now runs against the PUBREL we are about to send.
            entry.timestamp = Instant::now();
            true
        } else {
            false
        }
    }

    /// Handle PUBCOMP: the outbound QoS 2 flow is complete.
    pub fn handle_pubcomp(&self, session: &mut Session, packet_id: PacketId) -> bool {
        session.pending_qos2_out.remove(&packet_id).is_some()
    }

    /// Retransmit pending outbound messages whose retry interval elapsed.
    ///
    /// QoS 1 and QoS 2 in `AwaitingPubRec` resend the PUBLISH with DUP set;
    /// QoS 2 in `AwaitingPubComp` resends PUBREL. Entries past the retry cap
    /// are dropped. Inbound QoS 2 entries are state only and never resent.
    pub async fn retransmit_pending(&self, session: &mut Session) {
        let now = Instant::now();
        let mut to_send: Vec<BrokerToConnectionCmd> = Vec::new();
        let mut to_drop: Vec<PacketId> = Vec::new();

        for (packet_id, entry) in &mut session.pending_qos1 {
            if now.duration_since(entry.timestamp) < self.retry_interval {
                continue;
            }
            if entry.retry_count >= self.max_retries {
                to_drop.push(*packet_id);
                continue;
            }
            match build_dup_publish(&entry.topic, &entry.payload, entry.qos, *packet_id) {
                Ok(packet) => {
                    entry.retry_count += 1;
                    entry.timestamp = now;
                    to_send.push(BrokerToConnectionCmd::Publish(packet));
                }
                Err(err) => log::error!("qos: Failed to rebuild QoS 1 publish: {err:?}"),
            }
        }
        for packet_id in &to_drop {
            session.pending_qos1.remove(packet_id);
            log::warn!("qos: Dropped QoS 1 message {packet_id} after retry limit");
        }

        to_drop.clear();
        for (packet_id, entry) in &mut session.pending_qos2_out {
            if now.duration_since(entry.timestamp) < self.retry_interval {
                continue;
            }
            if entry.retry_count >= self.max_retries {
                to_drop.push(*packet_id);
                continue;
            }
            let cmd = match entry.state {
                QoS2OutState::AwaitingPubRec => {
                    match build_dup_publish(&entry.topic, &entry.payload, QoS::ExactOnce, *packet_id)
                    {
                        Ok(packet) => BrokerToConnectionCmd::Publish(packet),
                        Err(err) => {
                            log::error!("qos: Failed to rebuild QoS 2 publish: {err:?}");
                            continue;
                        }
                    }
                }
                QoS2OutState::AwaitingPubComp => {
                    BrokerToConnectionCmd::PublishRelease(PublishReleasePacket::new(*packet_id))
                }
            };
            entry.retry_count += 1;
            entry.timestamp = now;
            to_send.push(cmd);
        }
        for packet_id in &to_drop {
            session.pending_qos2_out.remove(packet_id);
            log::warn!("qos: Dropped QoS 2 message {packet_id} after retry limit");
        }

        for cmd in to_send {
            session.send(cmd).await;
        }
    }
}

fn build_dup_publish(
    topic: &str,
    payload: &Bytes,
    qos: QoS,
    packet_id: PacketId,
) -> Result<PublishPacket, codec::EncodeError> {
    let mut packet = PublishPacket::new(topic, qos, payload)?;
    packet.set_packet_id(packet_id);
    packet.set_dup(true)?;
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn manager(retry_interval: Duration, max_retries: u32) -> QoSManager {
        QoSManager {
            retry_interval,
            max_retries,
        }
    }

    fn tracked_session() -> Session {
        Session::new("c1", true)
    }

    #[test]
    fn test_qos1_flow() {
        let qos_manager = manager(Duration::from_secs(10), 3);
        let mut session = tracked_session();
        let packet_id = PacketId::new(7);

        qos_manager.track_outbound_qos1(
            &mut session,
            packet_id,
            "a/b",
            Bytes::from_static(b"x"),
            QoS::AtLeastOnce,
        );
        assert_eq!(session.inflight_count(), 1);

        assert!(qos_manager.handle_puback(&mut session, packet_id));
        assert_eq!(session.inflight_count(), 0);
        // Unsolicited ack is tolerated.
        assert!(!qos_manager.handle_puback(&mut session, packet_id));
    }

    #[test]
    fn test_puback_leaves_qos2_tables_alone() {
        let qos_manager = manager(Duration::from_secs(10), 3);
        let mut session = tracked_session();
        let packet_id = PacketId::new(7);

        qos_manager.track_inbound_qos2(
            &mut session,
            packet_id,
            "in",
            Bytes::from_static(b"i"),
            false,
        );
        qos_manager.track_outbound_qos2(&mut session, packet_id, "out", Bytes::from_static(b"o"));

        assert!(!qos_manager.handle_puback(&mut session, packet_id));
        assert!(session.pending_qos2_in.contains_key(&packet_id));
        assert!(session.pending_qos2_out.contains_key(&packet_id));
    }

    #[test]
    fn test_pubrel_returns_message_once() {
        let qos_manager = manager(Duration::from_secs(10), 3);
        let mut session = tracked_session();
        let packet_id = PacketId::new(3);

        qos_manager.track_inbound_qos2(
            &mut session,
            packet_id,
            "a/b",
            Bytes::from_static(b"x"),
            true,
        );

        let released = qos_manager.handle_pubrel(&mut session, packet_id);
        assert_eq!(
            released,
            Some(("a/b".to_string(), Bytes::from_static(b"x"), true))
        );

        // A resent PUBREL finds no entry: no second delivery.
        assert!(qos_manager.handle_pubrel(&mut session, packet_id).is_none());
    }

    #[test]
    fn test_qos2_outbound_flow() {
        let qos_manager = manager(Duration::from_secs(10), 3);
        let mut session = tracked_session();
        let packet_id = PacketId::new(5);

        qos_manager.track_outbound_qos2(&mut session, packet_id, "a", Bytes::from_static(b"x"));
        assert!(qos_manager.handle_pubrec(&mut session, packet_id));
        // Duplicate PUBREC does not re-trigger PUBREL emission.
        assert!(!qos_manager.handle_pubrec(&mut session, packet_id));

        assert!(qos_manager.handle_pubcomp(&mut session, packet_id));
        assert_eq!(session.inflight_count(), 0);
    }

    #[test]
    fn test_retransmit_sets_dup_then_drops() {
        let qos_manager = manager(Duration::ZERO, 1);
        let mut session = tracked_session();
        let (sender, mut receiver) = mpsc::channel(8);
        session.attach(1, sender, 0, None, None);

        let packet_id = PacketId::new(9);
        qos_manager.track_outbound_qos1(
            &mut session,
            packet_id,
            "a/b",
            Bytes::from_static(b"x"),
            QoS::AtLeastOnce,
        );

        tokio_test::block_on(qos_manager.retransmit_pending(&mut session));
        match receiver.try_recv() {
            Ok(BrokerToConnectionCmd::Publish(packet)) => {
                assert!(packet.dup());
                assert_eq!(packet.packet_id(), packet_id);
            }
            other => panic!("expected dup publish, got {other:?}"),
        }

        // Retry budget is spent now; the next sweep drops the entry.
        tokio_test::block_on(qos_manager.retransmit_pending(&mut session));
        assert!(session.pending_qos1.is_empty());
    }

    #[test]
    fn test_retransmit_pubrel_after_pubrec() {
        let qos_manager = manager(Duration::ZERO, 3);
        let mut session = tracked_session();
        let (sender, mut receiver) = mpsc::channel(8);
        session.attach(1, sender, 0, None, None);

        let packet_id = PacketId::new(2);
        qos_manager.track_outbound_qos2(&mut session, packet_id, "a", Bytes::from_static(b"x"));
        assert!(qos_manager.handle_pubrec(&mut session, packet_id));

        tokio_test::block_on(qos_manager.retransmit_pending(&mut session));
        match receiver.try_recv() {
            Ok(BrokerToConnectionCmd::PublishRelease(packet)) => {
                assert_eq!(packet.packet_id(), packet_id);
            }
            other => panic!("expected pubrel, got {other:?}"),
        }
    }
}
