// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Per-client session state.

use bytes::Bytes;
use codec::{PacketId, QoS};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Sender;

use crate::commands::BrokerToConnectionCmd;
use crate::qos::{InboundQoS2, OutboundQoS1, OutboundQoS2};
use crate::types::ConnectionId;

/// Last will and testament, published when the connection ends abruptly.
#[derive(Debug, Clone)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// A message parked for an offline persistent session or a full inflight
/// window.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

/// All broker-side state of one client, connected or not.
///
/// The writer handle is a channel into the connection task which owns the
/// socket; dropping it is how a session lets go of a connection. Writes on
/// one socket are serialized by that task.
#[derive(Debug)]
pub struct Session {
    client_id: String,
    clean_session: bool,
    connected: bool,

    /// Connection currently bound to this session, if any.
    conn_id: ConnectionId,
    sender: Option<Sender<BrokerToConnectionCmd>>,

    /// filter -> granted QoS.
    subscriptions: HashMap<String, QoS>,

    keep_alive: u16,
    last_activity: Instant,

    will: Option<WillMessage>,
    username: Option<String>,

    /// Runs 1..=65535, skipping 0 [MQTT-2.3.1-1].
    packet_id_counter: u16,

    pub(crate) pending_qos1: HashMap<PacketId, OutboundQoS1>,
    pub(crate) pending_qos2_in: HashMap<PacketId, InboundQoS2>,
    pub(crate) pending_qos2_out: HashMap<PacketId, OutboundQoS2>,

    queued_messages: VecDeque<QueuedMessage>,
}

impl Session {
    #[must_use]
    pub fn new(client_id: &str, clean_session: bool) -> Self {
        Self {
            client_id: client_id.to_string(),
            clean_session,
            connected: false,
            conn_id: 0,
            sender: None,
            subscriptions: HashMap::new(),
            keep_alive: 0,
            last_activity: Instant::now(),
            will: None,
            username: None,
            packet_id_counter: 0,
            pending_qos1: HashMap::new(),
            pending_qos2_in: HashMap::new(),
            pending_qos2_out: HashMap::new(),
            queued_messages: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    #[must_use]
    pub const fn connected(&self) -> bool {
        self.connected
    }

    #[must_use]
    pub const fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    #[must_use]
    pub const fn subscriptions(&self) -> &HashMap<String, QoS> {
        &self.subscriptions
    }

    pub fn subscriptions_mut(&mut self) -> &mut HashMap<String, QoS> {
        &mut self.subscriptions
    }

    #[must_use]
    pub const fn will(&self) -> Option<&WillMessage> {
        self.will.as_ref()
    }

    pub fn take_will(&mut self) -> Option<WillMessage> {
        self.will.take()
    }

    pub fn clear_will(&mut self) {
        self.will = None;
    }

    /// Attach a connection to this session after a successful handshake.
    pub fn attach(
        &mut self,
        conn_id: ConnectionId,
        sender: Sender<BrokerToConnectionCmd>,
        keep_alive: u16,
        username: Option<String>,
        will: Option<WillMessage>,
    ) {
        self.conn_id = conn_id;
        self.sender = Some(sender);
        self.connected = true;
        self.keep_alive = keep_alive;
        self.username = username;
        self.will = will;
        self.touch();
    }

    /// Detach the connection; the session keeps its subscriptions and
    /// pending state for a later resume.
    pub fn detach(&mut self) {
        self.connected = false;
        self.sender = None;
        self.touch();
    }

    /// Send a packet through the bound connection task.
    ///
    /// A closed channel means the connection task is gone; the session is
    /// marked disconnected and the packet is dropped.
    pub async fn send(&mut self, cmd: BrokerToConnectionCmd) {
        if let Some(sender) = &self.sender {
            if sender.send(cmd).await.is_err() {
                log::warn!(
                    "session: Connection of {} is gone, marking disconnected",
                    self.client_id
                );
                self.connected = false;
                self.sender = None;
            }
        }
    }

    /// Generate the next packet identifier, in [1, 65535].
    pub fn next_packet_id(&mut self) -> PacketId {
        if self.packet_id_counter == u16::MAX {
            self.packet_id_counter = 1;
        } else {
            self.packet_id_counter += 1;
        }
        PacketId::new(self.packet_id_counter)
    }

    /// Outstanding QoS 1/2 messages awaiting acknowledgement.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.pending_qos1.len() + self.pending_qos2_in.len() + self.pending_qos2_out.len()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    #[must_use]
    pub fn keep_alive_expired(&self, factor: f64) -> bool {
        if self.keep_alive == 0 {
            return false;
        }
        let timeout = Duration::from_secs_f64(f64::from(self.keep_alive) * factor);
        self.last_activity.elapsed() > timeout
    }

    /// A disconnected persistent session past `expiry` is reaped by the
    /// expiry sweep. Clean sessions never expire; they vanish with their
    /// connection.
    #[must_use]
    pub fn expired(&self, expiry: Duration) -> bool {
        !self.connected && !self.clean_session && self.last_activity.elapsed() > expiry
    }

    /// Park a message for later delivery, evicting the oldest entry when
    /// the queue is full.
    pub fn queue_message(&mut self, topic: &str, payload: Bytes, qos: QoS, max_queued: usize) {
        while self.queued_messages.len() >= max_queued {
            self.queued_messages.pop_front();
        }
        self.queued_messages.push_back(QueuedMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
    }

    /// Take all queued messages, in insertion order.
    pub fn take_queued(&mut self) -> VecDeque<QueuedMessage> {
        std::mem::take(&mut self.queued_messages)
    }

    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.queued_messages.len()
    }

    /// Shrink pending tables and queue to the given bounds; used by the
    /// memory guard when the host runs low.
    pub fn trim_queues(&mut self, max_pending: usize, max_queued: usize) {
        while self.pending_qos1.len() > max_pending {
            let Some(key) = self.pending_qos1.keys().next().copied() else {
                break;
            };
            self.pending_qos1.remove(&key);
        }
        while self.pending_qos2_out.len() > max_pending {
            let Some(key) = self.pending_qos2_out.keys().next().copied() else {
                break;
            };
            self.pending_qos2_out.remove(&key);
        }
        while self.queued_messages.len() > max_queued {
            self.queued_messages.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_id_wraps_and_skips_zero() {
        let mut session = Session::new("c1", true);
        assert_eq!(session.next_packet_id(), PacketId::new(1));
        assert_eq!(session.next_packet_id(), PacketId::new(2));

        session.packet_id_counter = u16::MAX - 1;
        assert_eq!(session.next_packet_id(), PacketId::new(u16::MAX));
        assert_eq!(session.next_packet_id(), PacketId::new(1));
    }

    #[test]
    fn test_queue_eviction_is_fifo() {
        let mut session = Session::new("c1", false);
        for i in 0..5u8 {
            session.queue_message("jobs", Bytes::copy_from_slice(&[i]), QoS::AtLeastOnce, 3);
        }
        let queued = session.take_queued();
        let payloads: Vec<u8> = queued.iter().map(|msg| msg.payload[0]).collect();
        assert_eq!(payloads, [2, 3, 4]);
        assert_eq!(session.queued_count(), 0);
    }

    #[test]
    fn test_expiry_only_for_disconnected_persistent() {
        let mut persistent = Session::new("c1", false);
        persistent.detach();
        assert!(persistent.expired(Duration::ZERO));

        let mut clean = Session::new("c2", true);
        clean.detach();
        assert!(!clean.expired(Duration::ZERO));

        let connected = Session::new("c3", false);
        // Never attached, but also never expires while marked connected.
        let mut connected = connected;
        connected.connected = true;
        assert!(!connected.expired(Duration::ZERO));
    }

    #[test]
    fn test_keep_alive_expiry() {
        let mut session = Session::new("c1", true);
        session.keep_alive = 0;
        assert!(!session.keep_alive_expired(1.5));

        session.keep_alive = 1;
        session.last_activity = Instant::now() - Duration::from_secs(10);
        assert!(session.keep_alive_expired(1.5));

        session.touch();
        assert!(!session.keep_alive_expired(1.5));
    }
}
