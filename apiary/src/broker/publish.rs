// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! PUBLISH pipeline and QoS acknowledgement handlers.

use bytes::Bytes;
use codec::{
    PacketId, PingResponsePacket, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, QoS,
};

use super::Broker;
use crate::commands::BrokerToConnectionCmd;
use crate::error::Error;
use crate::hooks::MessageContext;
use crate::types::ConnectionId;

impl Broker {
    /// Incoming PUBLISH: validation, limits, authorization, interceptors,
    /// hook, then the QoS-specific dispatch.
    pub(super) async fn on_publish_cmd(
        &mut self,
        conn_id: ConnectionId,
        packet: PublishPacket,
    ) -> Result<(), Error> {
        let Some(client_id) = self.client_for(conn_id) else {
            return Ok(());
        };

        let qos = packet.qos();
        let packet_id = packet.packet_id();

        // Structure (non-empty, wildcard-free) is enforced by the decoder;
        // the configured limits are enforced here. Oversize input is dropped
        // but still acknowledged as its QoS demands.
        let topic_levels = packet.topic().split('/').count();
        if packet.topic().len() > self.config.max_topic_length()
            || topic_levels > self.config.max_topic_levels()
        {
            log::warn!("broker: Topic exceeds limits, from {client_id}");
            self.acknowledge_publish(&client_id, qos, packet_id).await;
            return Ok(());
        }
        if packet.message().len() > self.config.max_payload_size() {
            log::warn!(
                "broker: Payload too large from {client_id}: {} bytes",
                packet.message().len()
            );
            self.acknowledge_publish(&client_id, qos, packet_id).await;
            return Ok(());
        }

        // With QoS 2 disabled the message is dropped, but PUBREC is still
        // due.
        if qos == QoS::ExactOnce && !self.config.qos2_enabled() {
            log::warn!("broker: QoS 2 disabled, dropping PUBLISH from {client_id}");
            self.send_to_session(
                &client_id,
                BrokerToConnectionCmd::PublishReceived(PublishReceivedPacket::new(packet_id)),
            )
            .await;
            return Ok(());
        }

        // An unauthorized publish is dropped silently towards subscribers,
        // while the publisher still sees the regular acknowledgement.
        if let Some(auth) = self.auth.as_mut() {
            if !auth.authorize_publish(&client_id, packet.topic()) {
                log::warn!(
                    "broker: Publish denied for {client_id} on {}",
                    packet.topic()
                );
                self.acknowledge_publish(&client_id, qos, packet_id).await;
                return Ok(());
            }
        }

        // Interceptor pipeline; each stage may rewrite the message or
        // discard it, which ends the pipeline without routing.
        let mut topic = packet.topic().to_string();
        let mut payload = Bytes::copy_from_slice(packet.message());
        let mut qos = qos;
        let mut retain = packet.retain();
        if !self.interceptors.is_empty() {
            let mut ctx = MessageContext::new(&topic, &payload, qos, retain, Some(&client_id));
            for interceptor in &mut self.interceptors {
                interceptor.intercept(&mut ctx);
                if ctx.is_dropped() {
                    log::debug!("broker: Message from {client_id} dropped by interceptor");
                    return Ok(());
                }
            }
            topic = ctx.topic;
            payload = Bytes::from(ctx.payload);
            qos = ctx.qos;
            retain = ctx.retain;
        }

        self.stats.publishes_received += 1;

        if let Some(hooks) = &self.hooks {
            hooks
                .on_publish(&client_id, &topic, &payload, qos, retain)
                .await;
        }

        match qos {
            QoS::AtMostOnce => {
                self.route_publish(&topic, payload, qos, retain, Some(&client_id))
                    .await;
            }
            QoS::AtLeastOnce => {
                self.route_publish(&topic, payload, qos, retain, Some(&client_id))
                    .await;
                self.send_to_session(
                    &client_id,
                    BrokerToConnectionCmd::PublishAck(PublishAckPacket::new(packet_id)),
                )
                .await;
            }
            QoS::ExactOnce => {
                // Routing waits for PUBREL; only the state is parked now.
                if let Some(session) = self.sessions.get_mut(&client_id) {
                    self.qos_manager
                        .track_inbound_qos2(session, packet_id, &topic, payload, retain);
                }
                self.send_to_session(
                    &client_id,
                    BrokerToConnectionCmd::PublishReceived(PublishReceivedPacket::new(packet_id)),
                )
                .await;
            }
        }

        Ok(())
    }

    /// The acknowledgement a dropped PUBLISH still owes its sender.
    async fn acknowledge_publish(&mut self, client_id: &str, qos: QoS, packet_id: PacketId) {
        match qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                self.send_to_session(
                    client_id,
                    BrokerToConnectionCmd::PublishAck(PublishAckPacket::new(packet_id)),
                )
                .await;
            }
            QoS::ExactOnce => {
                self.send_to_session(
                    client_id,
                    BrokerToConnectionCmd::PublishReceived(PublishReceivedPacket::new(packet_id)),
                )
                .await;
            }
        }
    }

    pub(super) fn on_publish_ack_cmd(&mut self, conn_id: ConnectionId, packet: &PublishAckPacket) {
        let Some(client_id) = self.client_for(conn_id) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&client_id) else {
            return;
        };
        if !self.qos_manager.handle_puback(session, packet.packet_id()) {
            log::debug!(
                "broker: Unsolicited PUBACK {} from {client_id}",
                packet.packet_id()
            );
        }
    }

    pub(super) async fn on_publish_received_cmd(
        &mut self,
        conn_id: ConnectionId,
        packet: &PublishReceivedPacket,
    ) {
        let Some(client_id) = self.client_for(conn_id) else {
            return;
        };
        let packet_id = packet.packet_id();
        let advanced = {
            let Some(session) = self.sessions.get_mut(&client_id) else {
                return;
            };
            self.qos_manager.handle_pubrec(session, packet_id)
        };
        if advanced {
            self.send_to_session(
                &client_id,
                BrokerToConnectionCmd::PublishRelease(PublishReleasePacket::new(packet_id)),
            )
            .await;
        }
    }

    pub(super) async fn on_publish_release_cmd(
        &mut self,
        conn_id: ConnectionId,
        packet: &PublishReleasePacket,
    ) {
        let Some(client_id) = self.client_for(conn_id) else {
            return;
        };
        let packet_id = packet.packet_id();
        let released = {
            let Some(session) = self.sessions.get_mut(&client_id) else {
                return;
            };
            self.qos_manager.handle_pubrel(session, packet_id)
        };
        if let Some((topic, payload, retain)) = released {
            self.route_publish(&topic, payload, QoS::ExactOnce, retain, Some(&client_id))
                .await;
        }
        // PUBCOMP goes out even for a resent PUBREL whose entry is long
        // gone; the absence of the entry is what prevents a second
        // delivery.
        self.send_to_session(
            &client_id,
            BrokerToConnectionCmd::PublishComplete(PublishCompletePacket::new(packet_id)),
        )
        .await;
    }

    pub(super) fn on_publish_complete_cmd(
        &mut self,
        conn_id: ConnectionId,
        packet: &PublishCompletePacket,
    ) {
        let Some(client_id) = self.client_for(conn_id) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&client_id) else {
            return;
        };
        if !self.qos_manager.handle_pubcomp(session, packet.packet_id()) {
            log::debug!(
                "broker: Unsolicited PUBCOMP {} from {client_id}",
                packet.packet_id()
            );
        }
    }

    pub(super) async fn on_ping_request_cmd(&mut self, conn_id: ConnectionId) {
        let Some(client_id) = self.client_for(conn_id) else {
            return;
        };
        self.send_to_session(
            &client_id,
            BrokerToConnectionCmd::PingResponse(PingResponsePacket::new()),
        )
        .await;
    }
}
