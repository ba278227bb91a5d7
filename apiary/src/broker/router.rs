// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Fan-out of PUBLISH messages to matching subscribers.

use bytes::Bytes;
use codec::{PublishPacket, QoS};

use super::Broker;
use crate::commands::BrokerToConnectionCmd;

impl Broker {
    /// Route one message: store it when retained, then deliver to every
    /// matching subscriber at `min(publish QoS, granted QoS)`. The sender
    /// never hears its own message back. Offline persistent sessions queue
    /// QoS 1/2 deliveries; QoS 0 is fire-and-forget and never queued.
    pub(crate) async fn route_publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        sender_id: Option<&str>,
    ) {
        if retain {
            self.retained_store
                .set(&mut self.topic_tree, topic, &payload, qos);
        }

        let subscribers = self.topic_tree.match_topic(topic);
        for (subscriber_id, granted_qos) in subscribers {
            if Some(subscriber_id.as_str()) == sender_id {
                continue;
            }
            let effective_qos = qos.min(granted_qos);

            let Some(session) = self.sessions.get(&subscriber_id) else {
                continue;
            };
            if session.connected() {
                self.deliver(&subscriber_id, topic, payload.clone(), effective_qos)
                    .await;
            } else if effective_qos > QoS::AtMostOnce {
                let max_queued = self.config.max_queued_messages();
                if let Some(session) = self.sessions.get_mut(&subscriber_id) {
                    if !session.clean_session() {
                        session.queue_message(topic, payload.clone(), effective_qos, max_queued);
                    }
                }
            }
        }
    }

    /// Deliver to one connected subscriber. QoS 1/2 sends are gated on the
    /// inflight window and parked in the session queue when it is full.
    async fn deliver(&mut self, client_id: &str, topic: &str, payload: Bytes, effective_qos: QoS) {
        if effective_qos == QoS::AtMostOnce {
            match PublishPacket::new(topic, QoS::AtMostOnce, &payload) {
                Ok(packet) => {
                    self.stats.publishes_sent += 1;
                    self.send_to_session(client_id, BrokerToConnectionCmd::Publish(packet))
                        .await;
                }
                Err(err) => log::error!("router: Failed to build publish packet: {err:?}"),
            }
            return;
        }

        let packet = {
            let max_inflight = self.config.max_inflight();
            let max_queued = self.config.max_queued_messages();
            let Some(session) = self.sessions.get_mut(client_id) else {
                return;
            };
            if session.inflight_count() >= max_inflight {
                session.queue_message(topic, payload, effective_qos, max_queued);
                return;
            }

            let packet_id = session.next_packet_id();
            let mut packet = match PublishPacket::new(topic, effective_qos, &payload) {
                Ok(packet) => packet,
                Err(err) => {
                    log::error!("router: Failed to build publish packet: {err:?}");
                    return;
                }
            };
            packet.set_packet_id(packet_id);

            if effective_qos == QoS::AtLeastOnce {
                self.qos_manager.track_outbound_qos1(
                    session,
                    packet_id,
                    topic,
                    payload,
                    effective_qos,
                );
            } else {
                self.qos_manager
                    .track_outbound_qos2(session, packet_id, topic, payload);
            }
            packet
        };

        self.stats.publishes_sent += 1;
        self.send_to_session(client_id, BrokerToConnectionCmd::Publish(packet))
            .await;
    }

    /// Send retained matches to a fresh subscription, retain flag set
    /// [MQTT-3.3.1-8]. QoS 1/2 deliveries are tracked but not queued; this
    /// path only runs for a connected session.
    pub(crate) async fn deliver_retained(
        &mut self,
        client_id: &str,
        filter: &str,
        granted_qos: QoS,
    ) {
        if !self.config.retain_enabled() {
            return;
        }

        for retained in self.topic_tree.retained_matching(filter) {
            let effective_qos = retained.qos.min(granted_qos);

            let mut packet =
                match PublishPacket::new(&retained.topic, effective_qos, &retained.payload) {
                    Ok(packet) => packet,
                    Err(err) => {
                        log::error!("router: Failed to build retained publish: {err:?}");
                        continue;
                    }
                };
            packet.set_retain(true);

            if effective_qos != QoS::AtMostOnce {
                let Some(session) = self.sessions.get_mut(client_id) else {
                    return;
                };
                let packet_id = session.next_packet_id();
                packet.set_packet_id(packet_id);
                if effective_qos == QoS::AtLeastOnce {
                    self.qos_manager.track_outbound_qos1(
                        session,
                        packet_id,
                        &retained.topic,
                        retained.payload.clone(),
                        effective_qos,
                    );
                } else {
                    self.qos_manager.track_outbound_qos2(
                        session,
                        packet_id,
                        &retained.topic,
                        retained.payload.clone(),
                    );
                }
            }

            self.stats.publishes_sent += 1;
            self.send_to_session(client_id, BrokerToConnectionCmd::Publish(packet))
                .await;
        }
    }

    /// Flush messages parked while a persistent session was offline, in
    /// insertion order. The resume happens on a fresh connection, so the
    /// flush is not gated on the inflight window.
    pub(crate) async fn deliver_queued(&mut self, client_id: &str) {
        let queued = {
            let Some(session) = self.sessions.get_mut(client_id) else {
                return;
            };
            session.take_queued()
        };
        if queued.is_empty() {
            return;
        }
        log::info!(
            "router: Delivering {} queued messages to {client_id}",
            queued.len()
        );

        for message in queued {
            let mut packet =
                match PublishPacket::new(&message.topic, message.qos, &message.payload) {
                    Ok(packet) => packet,
                    Err(err) => {
                        log::error!("router: Failed to build queued publish: {err:?}");
                        continue;
                    }
                };

            if message.qos != QoS::AtMostOnce {
                let Some(session) = self.sessions.get_mut(client_id) else {
                    return;
                };
                let packet_id = session.next_packet_id();
                packet.set_packet_id(packet_id);
                if message.qos == QoS::AtLeastOnce {
                    self.qos_manager.track_outbound_qos1(
                        session,
                        packet_id,
                        &message.topic,
                        message.payload.clone(),
                        message.qos,
                    );
                } else {
                    self.qos_manager.track_outbound_qos2(
                        session,
                        packet_id,
                        &message.topic,
                        message.payload.clone(),
                    );
                }
            }

            self.stats.publishes_sent += 1;
            self.send_to_session(client_id, BrokerToConnectionCmd::Publish(packet))
                .await;
        }
    }
}
