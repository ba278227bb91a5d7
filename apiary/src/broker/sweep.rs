// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Periodic maintenance driven by the run-loop timers.

use bytes::Bytes;
use codec::QoS;

use super::Broker;
use crate::stats::SysSample;

impl Broker {
    /// Resend unacknowledged QoS 1/2 messages of every connected session.
    pub(super) async fn retransmit_sweep(&mut self) {
        for session in self.sessions.values_mut() {
            if session.connected() {
                self.qos_manager.retransmit_pending(session).await;
            }
        }
    }

    /// Disconnect clients whose keep-alive window has passed
    /// [MQTT-3.1.2-24]. Abrupt, so wills fire.
    pub(super) async fn keep_alive_sweep(&mut self) {
        let factor = self.config.keep_alive_factor();
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|session| session.connected() && session.keep_alive_expired(factor))
            .map(|session| session.client_id().to_string())
            .collect();

        for client_id in expired {
            log::info!("broker: Keep-alive timeout for {client_id}");
            self.teardown_session(&client_id, false).await;
        }
    }

    /// Reap persistent sessions disconnected longer than `session_expiry`,
    /// then prune the trie. Clean sessions are not the sweep's business;
    /// they are removed at disconnect.
    pub(super) fn session_expiry_sweep(&mut self) {
        let expiry = self.config.session_expiry();
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|session| session.expired(expiry))
            .map(|session| session.client_id().to_string())
            .collect();

        for client_id in &expired {
            self.topic_tree.unsubscribe_all(client_id);
            self.sessions.remove(client_id);
        }
        if !expired.is_empty() {
            log::info!("broker: Reaped {} expired sessions", expired.len());
        }

        self.topic_tree.prune();
    }

    /// Publish the `$SYS/broker/#` statistics as retained QoS 0 messages.
    pub(super) async fn sys_topics_sweep(&mut self) {
        if !self.config.sys_topics_enabled() {
            return;
        }

        let sample = SysSample {
            clients_connected: self
                .sessions
                .values()
                .filter(|session| session.connected())
                .count(),
            clients_total: self.sessions.len(),
            subscription_count: self.topic_tree.subscription_count(),
            retained_count: self.topic_tree.retained_count(),
            heap: self.memory_guard.snapshot(),
        };
        let topics = self.stats.sys_topics(&sample);

        for (topic, value) in topics {
            self.route_publish(
                &topic,
                Bytes::from(value.into_bytes()),
                QoS::AtMostOnce,
                true,
                None,
            )
            .await;
        }
    }
}
