// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! SUBSCRIBE / UNSUBSCRIBE handling.

use codec::topic::validate_topic_filter;
use codec::{
    QoS, SubscribeAck, SubscribeAckPacket, SubscribePacket, UnsubscribeAckPacket,
    UnsubscribePacket,
};

use super::Broker;
use crate::commands::BrokerToConnectionCmd;
use crate::error::Error;
use crate::types::ConnectionId;

impl Broker {
    /// Each filter is granted independently; the SUBACK carries the grants
    /// in arrival order [MQTT-3.8.4-4]. Retained matches are delivered as a
    /// filter is installed, before the SUBACK goes out.
    pub(super) async fn on_subscribe_cmd(
        &mut self,
        conn_id: ConnectionId,
        packet: SubscribePacket,
    ) -> Result<(), Error> {
        let Some(client_id) = self.client_for(conn_id) else {
            return Ok(());
        };

        let mut acks = Vec::with_capacity(packet.topics().len());
        for subscribe_topic in packet.topics() {
            let filter = subscribe_topic.filter();
            let grant = self
                .compute_grant(&client_id, filter, subscribe_topic.qos())
                .await;

            if let SubscribeAck::QoS(granted_qos) = grant {
                self.topic_tree.subscribe(filter, &client_id, granted_qos);
                if let Some(session) = self.sessions.get_mut(&client_id) {
                    session
                        .subscriptions_mut()
                        .insert(filter.to_string(), granted_qos);
                }
                self.deliver_retained(&client_id, filter, granted_qos).await;
            }
            acks.push(grant);
        }

        let ack_packet = SubscribeAckPacket::with_vec(packet.packet_id(), acks);
        self.send_to_session(&client_id, BrokerToConnectionCmd::SubscribeAck(ack_packet))
            .await;
        Ok(())
    }

    /// Compute the grant for one filter: subscription cap, filter
    /// validation, QoS 2 availability, authorization, then the hook which
    /// may replace the result.
    async fn compute_grant(
        &mut self,
        client_id: &str,
        filter: &str,
        requested_qos: QoS,
    ) -> SubscribeAck {
        let current_subscriptions = self
            .sessions
            .get(client_id)
            .map_or(0, |session| session.subscriptions().len());
        if current_subscriptions >= self.config.max_subscriptions_per_client() {
            log::warn!("broker: Max subscriptions reached for {client_id}");
            return SubscribeAck::Failed;
        }

        if validate_topic_filter(filter).is_err()
            || filter.len() > self.config.max_topic_length()
            || filter.split('/').count() > self.config.max_topic_levels()
        {
            log::warn!("broker: Invalid topic filter from {client_id}: {filter}");
            return SubscribeAck::Failed;
        }

        let mut granted_qos = requested_qos;
        if !self.config.qos2_enabled() && granted_qos == QoS::ExactOnce {
            granted_qos = QoS::AtLeastOnce;
        }

        if let Some(auth) = self.auth.as_mut() {
            match auth.authorize_subscribe(client_id, filter) {
                None => {
                    log::warn!("broker: Subscribe denied for {client_id} on {filter}");
                    return SubscribeAck::Failed;
                }
                Some(auth_qos) => {
                    if auth_qos < granted_qos {
                        granted_qos = auth_qos;
                    }
                }
            }
        }

        let mut grant = SubscribeAck::QoS(granted_qos);
        if let Some(hooks) = &self.hooks {
            if let Some(replacement) = hooks.on_subscribe(client_id, filter, grant).await {
                grant = replacement;
            }
        }
        grant
    }

    pub(super) async fn on_unsubscribe_cmd(
        &mut self,
        conn_id: ConnectionId,
        packet: UnsubscribePacket,
    ) -> Result<(), Error> {
        let Some(client_id) = self.client_for(conn_id) else {
            return Ok(());
        };

        for filter in packet.topics() {
            self.topic_tree.unsubscribe(filter, &client_id);
            if let Some(session) = self.sessions.get_mut(&client_id) {
                session.subscriptions_mut().remove(filter);
            }
            if let Some(hooks) = &self.hooks {
                hooks.on_unsubscribe(&client_id, filter).await;
            }
        }

        let ack_packet = UnsubscribeAckPacket::new(packet.packet_id());
        self.send_to_session(
            &client_id,
            BrokerToConnectionCmd::UnsubscribeAck(ack_packet),
        )
        .await;
        Ok(())
    }
}
