// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Broker counters and `$SYS` topic generation.

use std::time::{Duration, Instant};

/// Window length for the connections-per-minute load figure.
const CONNECTION_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Counters behind the `$SYS/broker/#` topics.
///
/// All values are published periodically as retained QoS 0 messages with
/// decimal string payloads.
#[derive(Debug)]
pub struct BrokerStats {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub publishes_received: u64,
    pub publishes_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connections_count: u64,

    start_time: Instant,
    conn_window_start: Instant,
    conn_window_count: u64,
    conn_rate: u64,
}

/// Live gauge values sampled at publication time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysSample {
    pub clients_connected: usize,
    pub clients_total: usize,
    pub subscription_count: usize,
    pub retained_count: usize,

    /// (free, used) heap bytes where the platform exposes them.
    pub heap: Option<(u64, u64)>,
}

impl BrokerStats {
    #[must_use]
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            messages_received: 0,
            messages_sent: 0,
            publishes_received: 0,
            publishes_sent: 0,
            bytes_received: 0,
            bytes_sent: 0,
            connections_count: 0,
            start_time: now,
            conn_window_start: now,
            conn_window_count: 0,
            conn_rate: 0,
        }
    }

    /// Record one accepted connection.
    pub fn record_connection(&mut self) {
        self.connections_count += 1;
        self.conn_window_count += 1;
    }

    /// Seconds since broker start.
    #[must_use]
    pub fn uptime(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn update_connection_rate(&mut self) {
        if self.conn_window_start.elapsed() >= CONNECTION_RATE_WINDOW {
            self.conn_rate = self.conn_window_count;
            self.conn_window_count = 0;
            self.conn_window_start = Instant::now();
        }
    }

    /// Produce the `$SYS` topic/value pairs.
    #[must_use]
    pub fn sys_topics(&mut self, sample: &SysSample) -> Vec<(String, String)> {
        self.update_connection_rate();

        let mut topics = vec![
            (
                "$SYS/broker/version".to_string(),
                format!("apiary {}", env!("CARGO_PKG_VERSION")),
            ),
            ("$SYS/broker/uptime".to_string(), self.uptime().to_string()),
            (
                "$SYS/broker/clients/connected".to_string(),
                sample.clients_connected.to_string(),
            ),
            (
                "$SYS/broker/clients/total".to_string(),
                sample.clients_total.to_string(),
            ),
            (
                "$SYS/broker/messages/received".to_string(),
                self.messages_received.to_string(),
            ),
            (
                "$SYS/broker/messages/sent".to_string(),
                self.messages_sent.to_string(),
            ),
            (
                "$SYS/broker/messages/publish/received".to_string(),
                self.publishes_received.to_string(),
            ),
            (
                "$SYS/broker/messages/publish/sent".to_string(),
                self.publishes_sent.to_string(),
            ),
            (
                "$SYS/broker/bytes/received".to_string(),
                self.bytes_received.to_string(),
            ),
            (
                "$SYS/broker/bytes/sent".to_string(),
                self.bytes_sent.to_string(),
            ),
            (
                "$SYS/broker/subscriptions/count".to_string(),
                sample.subscription_count.to_string(),
            ),
            (
                "$SYS/broker/messages/retained/count".to_string(),
                sample.retained_count.to_string(),
            ),
            (
                "$SYS/broker/load/connections".to_string(),
                self.conn_rate.to_string(),
            ),
        ];

        if let Some((free, used)) = sample.heap {
            topics.push(("$SYS/broker/heap/free".to_string(), free.to_string()));
            topics.push(("$SYS/broker/heap/used".to_string(), used.to_string()));
        }

        topics
    }
}

impl Default for BrokerStats {
    fn default() -> Self {
        Self::new()
    }
}
