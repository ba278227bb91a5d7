// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! CONNECT handshake and disconnect teardown.

use bytes::Bytes;
use codec::utils::random_client_id;
use codec::{ConnectAckPacket, ConnectPacket, ConnectReturnCode};

use super::Broker;
use crate::commands::BrokerToConnectionCmd;
use crate::error::Error;
use crate::session::{Session, WillMessage};
use crate::types::ConnectionId;

impl Broker {
    pub(super) async fn on_connect_cmd(
        &mut self,
        conn_id: ConnectionId,
        packet: ConnectPacket,
    ) -> Result<(), Error> {
        // A broker in shutdown answers 0x03 and closes.
        if !self.running {
            self.reject_connect(conn_id, ConnectReturnCode::ServerUnavailable)
                .await;
            return Ok(());
        }

        let clean_session = packet.clean_session();

        // A zero-byte client id gets a generated one, but only for clean
        // sessions [MQTT-3.1.3-7].
        let client_id = if packet.client_id().is_empty() {
            if self.config.allow_zero_length_clientid() && clean_session {
                random_client_id()
            } else {
                self.reject_connect(conn_id, ConnectReturnCode::IdentifierRejected)
                    .await;
                return Ok(());
            }
        } else {
            packet.client_id().to_string()
        };

        // Authentication.
        if let Some(auth) = self.auth.as_mut() {
            if !auth.authenticate(&client_id, packet.username(), packet.password()) {
                log::warn!(
                    "broker: Auth failed for client {client_id} (user={:?})",
                    packet.username()
                );
                self.reject_connect(conn_id, ConnectReturnCode::BadUserNameOrPassword)
                    .await;
                return Ok(());
            }
        } else if !self.config.allow_anonymous() && packet.username().is_none() {
            log::warn!("broker: Anonymous connection rejected: {client_id}");
            self.reject_connect(conn_id, ConnectReturnCode::NotAuthorized)
                .await;
            return Ok(());
        }

        // If the client id represents a client already connected, the
        // existing client is disconnected first [MQTT-3.1.4-2]. The takeover
        // is abrupt, so its will fires.
        let already_connected = self
            .sessions
            .get(&client_id)
            .map_or(false, Session::connected);
        if already_connected {
            log::info!("broker: Disconnecting duplicate client: {client_id}");
            self.teardown_session(&client_id, false).await;
        }

        // Session resolution.
        let mut session_present = false;
        if clean_session {
            if self.sessions.remove(&client_id).is_some() {
                // A fresh clean session must not inherit trie entries from
                // a dropped persistent one.
                self.topic_tree.unsubscribe_all(&client_id);
            }
            self.sessions
                .insert(client_id.clone(), Session::new(&client_id, true));
        } else if self.sessions.contains_key(&client_id) {
            session_present = true;
        } else {
            self.sessions
                .insert(client_id.clone(), Session::new(&client_id, false));
        }

        let will = if packet.connect_flags().will() {
            packet.will_topic().map(|will_topic| WillMessage {
                topic: will_topic.to_string(),
                payload: Bytes::copy_from_slice(packet.will_message()),
                qos: packet.connect_flags().will_qos(),
                retain: packet.connect_flags().will_retain(),
            })
        } else {
            None
        };
        let will_topic = will.as_ref().map(|will| will.topic.clone());
        let username = packet.username().map(ToString::to_string);

        let Some(sender) = self.connections.get(&conn_id).cloned() else {
            // The connection died while we were deciding.
            return Ok(());
        };
        if let Some(session) = self.sessions.get_mut(&client_id) {
            session.attach(conn_id, sender, packet.keep_alive(), username.clone(), will);
        }
        self.conn_clients.insert(conn_id, client_id.clone());

        // The on_connect hook runs before CONNACK is written; false rejects
        // with 0x05 and removes the session entry again.
        if let Some(hooks) = &self.hooks {
            if !hooks
                .on_connect(&client_id, username.as_deref(), will_topic.as_deref())
                .await
            {
                log::info!("broker: on_connect rejected client: {client_id}");
                self.send_to_conn(
                    conn_id,
                    BrokerToConnectionCmd::ConnectAck(ConnectAckPacket::new(
                        false,
                        ConnectReturnCode::NotAuthorized,
                    )),
                )
                .await;
                self.conn_clients.remove(&conn_id);
                self.sessions.remove(&client_id);
                self.topic_tree.unsubscribe_all(&client_id);
                if let Some(auth) = self.auth.as_mut() {
                    auth.cleanup_client(&client_id);
                }
                self.disconnect_conn(conn_id).await;
                return Ok(());
            }
        }

        let ack_packet = ConnectAckPacket::new(session_present, ConnectReturnCode::Accepted);
        self.send_to_session(&client_id, BrokerToConnectionCmd::ConnectAck(ack_packet))
            .await;
        log::info!("broker: Client connected: {client_id}");

        // A resumed session gets its parked messages right away.
        if session_present {
            self.deliver_queued(&client_id).await;
        }

        Ok(())
    }

    /// CONNACK with a non-zero return code, then close [MQTT-3.2.2-5].
    pub(super) async fn reject_connect(
        &mut self,
        conn_id: ConnectionId,
        return_code: ConnectReturnCode,
    ) {
        let ack_packet = ConnectAckPacket::new(false, return_code);
        self.send_to_conn(conn_id, BrokerToConnectionCmd::ConnectAck(ack_packet))
            .await;
        self.disconnect_conn(conn_id).await;
    }

    /// A connection task reported the end of its socket.
    pub(super) async fn on_connection_closed(&mut self, conn_id: ConnectionId, graceful: bool) {
        self.connections.remove(&conn_id);
        let Some(client_id) = self.conn_clients.remove(&conn_id) else {
            return;
        };

        // After a duplicate-client takeover the session is already bound to
        // a newer connection; the late close of the old one is not ours to
        // tear down.
        let is_current = self
            .sessions
            .get(&client_id)
            .map_or(false, |session| {
                session.connected() && session.conn_id() == conn_id
            });
        if !is_current {
            return;
        }

        if graceful {
            // A DISCONNECT packet discards the will [MQTT-3.14.4-3].
            if let Some(session) = self.sessions.get_mut(&client_id) {
                session.clear_will();
            }
        }

        self.teardown_session(&client_id, graceful).await;
    }

    /// Common teardown for graceful disconnects, read errors, keep-alive
    /// expiry, duplicate takeover and shutdown.
    pub(crate) async fn teardown_session(&mut self, client_id: &str, graceful: bool) {
        let (will, conn_id, was_connected) = {
            let Some(session) = self.sessions.get_mut(client_id) else {
                return;
            };
            let will = if graceful {
                session.clear_will();
                None
            } else {
                session.take_will()
            };
            let conn_id = session.conn_id();
            let was_connected = session.connected();
            session.detach();
            (will, conn_id, was_connected)
        };

        // Publish the will unless the hook suppresses it.
        if let Some(will) = will {
            let mut publish_will = true;
            if let Some(hooks) = &self.hooks {
                publish_will = hooks
                    .on_will_publish(client_id, &will.topic, &will.payload)
                    .await;
            }
            if publish_will {
                self.route_publish(
                    &will.topic,
                    will.payload,
                    will.qos,
                    will.retain,
                    Some(client_id),
                )
                .await;
            }
        }

        if was_connected {
            self.conn_clients.remove(&conn_id);
            self.disconnect_conn(conn_id).await;
        }

        if let Some(auth) = self.auth.as_mut() {
            auth.cleanup_client(client_id);
        }

        // Clean sessions vanish with their connection; persistent ones stay
        // for a later resume.
        let clean_session = self
            .sessions
            .get(client_id)
            .map_or(false, Session::clean_session);
        if clean_session {
            self.topic_tree.unsubscribe_all(client_id);
            self.sessions.remove(client_id);
        }

        log::info!("broker: Client disconnected: {client_id} (graceful: {graceful})");

        if let Some(hooks) = &self.hooks {
            hooks.on_disconnect(client_id, graceful).await;
        }
    }
}
