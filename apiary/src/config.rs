// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

#![allow(clippy::unsafe_derive_deserialize)]

use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, ErrorKind};

/// Log verbosity, mapped onto the `log` crate level filters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn to_level_filter(self) -> LevelFilter {
        match self {
            Self::Debug => LevelFilter::Debug,
            Self::Info => LevelFilter::Info,
            Self::Warning => LevelFilter::Warn,
            Self::Error => LevelFilter::Error,
        }
    }
}

/// Broker config.
///
/// Every option has a default suitable for a small embedded deployment;
/// a toml file only needs to name the options it overrides.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Address the TCP listener binds to.
    ///
    /// Default is "0.0.0.0".
    #[serde(default = "Config::default_bind_addr")]
    bind_addr: String,

    /// Port the TCP listener binds to.
    ///
    /// Default is 1883.
    #[serde(default = "Config::default_port")]
    port: u16,

    /// Listen backlog passed to the socket.
    ///
    /// Default is 4.
    #[serde(default = "Config::default_backlog")]
    backlog: u32,

    /// Maximum number of sessions, connected or persisted.
    ///
    /// New connections beyond this limit are closed without a CONNACK.
    ///
    /// Default is 10.
    #[serde(default = "Config::default_max_clients")]
    max_clients: usize,

    /// Maximum number of topic filters per client.
    ///
    /// Further SUBSCRIBE filters are answered with the 0x80 failure code.
    ///
    /// Default is 20.
    #[serde(default = "Config::default_max_subscriptions_per_client")]
    max_subscriptions_per_client: usize,

    /// Maximum byte length of a topic name or filter.
    ///
    /// Default is 256.
    #[serde(default = "Config::default_max_topic_length")]
    max_topic_length: usize,

    /// Maximum number of `/`-separated levels in a topic name or filter.
    ///
    /// Default is 8.
    #[serde(default = "Config::default_max_topic_levels")]
    max_topic_levels: usize,

    /// Maximum PUBLISH payload size in bytes. Oversize messages are dropped
    /// after the acknowledgement their QoS requires.
    ///
    /// Default is 4096.
    #[serde(default = "Config::default_max_payload_size")]
    max_payload_size: usize,

    /// Maximum size of a whole control packet in bytes. Must not be smaller
    /// than `max_payload_size`.
    ///
    /// Default is 8192.
    #[serde(default = "Config::default_max_packet_size")]
    max_packet_size: usize,

    /// Maximum number of messages queued for an offline persistent session.
    /// The oldest message is evicted first.
    ///
    /// Default is 50.
    #[serde(default = "Config::default_max_queued_messages")]
    max_queued_messages: usize,

    /// Maximum number of unacknowledged QoS 1/2 messages per session before
    /// further deliveries are queued.
    ///
    /// Default is 10.
    #[serde(default = "Config::default_max_inflight")]
    max_inflight: usize,

    /// Maximum number of retained messages; the least recently stored topic
    /// is evicted first.
    ///
    /// Default is 100.
    #[serde(default = "Config::default_max_retained_messages")]
    max_retained_messages: usize,

    /// Seconds a new connection may take to send its CONNECT packet.
    ///
    /// Default is 10.
    #[serde(default = "Config::default_connect_timeout")]
    connect_timeout: u64,

    /// Grace multiplier applied to the client keep-alive interval
    /// [MQTT-3.1.2-24].
    ///
    /// Default is 1.5.
    #[serde(default = "Config::default_keep_alive_factor")]
    keep_alive_factor: f64,

    /// Idle timeout in seconds for clients which disabled keep-alive.
    ///
    /// Default is 3600.
    #[serde(default = "Config::default_no_keepalive_timeout")]
    no_keepalive_timeout: u64,

    /// Seconds between retransmissions of unacknowledged QoS 1/2 messages.
    ///
    /// Default is 10.
    #[serde(default = "Config::default_qos_retry_interval")]
    qos_retry_interval: u64,

    /// Retransmission attempts before an unacknowledged message is dropped.
    ///
    /// Default is 3.
    #[serde(default = "Config::default_qos_max_retries")]
    qos_max_retries: u32,

    /// Seconds a disconnected persistent session survives before it is
    /// reaped. Clean sessions vanish with their connection instead.
    ///
    /// Default is 3600.
    #[serde(default = "Config::default_session_expiry")]
    session_expiry: u64,

    /// Accept clients which present no username when no auth provider is
    /// configured.
    ///
    /// Default is true.
    #[serde(default = "Config::default_allow_anonymous")]
    allow_anonymous: bool,

    /// Assign a generated client id to clients which connect with a
    /// zero-byte one [MQTT-3.1.3-6].
    ///
    /// Default is true.
    #[serde(default = "Config::default_allow_zero_length_clientid")]
    allow_zero_length_clientid: bool,

    /// Store retained messages. When disabled, the retain flag is ignored.
    ///
    /// Default is true.
    #[serde(default = "Config::default_retain_enabled")]
    retain_enabled: bool,

    /// Accept QoS 2 flows. When disabled, QoS 2 publishes are dropped after
    /// PUBREC and subscriptions are capped at QoS 1.
    ///
    /// Default is true.
    #[serde(default = "Config::default_qos2_enabled")]
    qos2_enabled: bool,

    /// Publish `$SYS/broker/#` statistics.
    ///
    /// Default is true.
    #[serde(default = "Config::default_sys_topics_enabled")]
    sys_topics_enabled: bool,

    /// Seconds between `$SYS` publications.
    ///
    /// Default is 60.
    #[serde(default = "Config::default_stats_interval")]
    stats_interval: u64,

    /// Accepted for config compatibility with runtimes that have a
    /// collector to nudge; schedules nothing here.
    ///
    /// Default is 30.
    #[serde(default = "Config::default_gc_collect_interval")]
    gc_collect_interval: u64,

    /// Initial capacity of the per-connection receive buffer in bytes.
    ///
    /// Default is 1024.
    #[serde(default = "Config::default_recv_buffer_size")]
    recv_buffer_size: usize,

    /// Log verbosity.
    ///
    /// Default is INFO.
    #[serde(default = "LogLevel::default")]
    log_level: LogLevel,
}

impl Config {
    #[must_use]
    pub fn default_bind_addr() -> String {
        "0.0.0.0".to_string()
    }

    #[must_use]
    pub const fn default_port() -> u16 {
        1883
    }

    #[must_use]
    pub const fn default_backlog() -> u32 {
        4
    }

    #[must_use]
    pub const fn default_max_clients() -> usize {
        10
    }

    #[must_use]
    pub const fn default_max_subscriptions_per_client() -> usize {
        20
    }

    #[must_use]
    pub const fn default_max_topic_length() -> usize {
        256
    }

    #[must_use]
    pub const fn default_max_topic_levels() -> usize {
        8
    }

    #[must_use]
    pub const fn default_max_payload_size() -> usize {
        4096
    }

    #[must_use]
    pub const fn default_max_packet_size() -> usize {
        8192
    }

    #[must_use]
    pub const fn default_max_queued_messages() -> usize {
        50
    }

    #[must_use]
    pub const fn default_max_inflight() -> usize {
        10
    }

    #[must_use]
    pub const fn default_max_retained_messages() -> usize {
        100
    }

    #[must_use]
    pub const fn default_connect_timeout() -> u64 {
        10
    }

    #[must_use]
    pub const fn default_keep_alive_factor() -> f64 {
        1.5
    }

    #[must_use]
    pub const fn default_no_keepalive_timeout() -> u64 {
        3600
    }

    #[must_use]
    pub const fn default_qos_retry_interval() -> u64 {
        10
    }

    #[must_use]
    pub const fn default_qos_max_retries() -> u32 {
        3
    }

    #[must_use]
    pub const fn default_session_expiry() -> u64 {
        3600
    }

    #[must_use]
    pub const fn default_allow_anonymous() -> bool {
        true
    }

    #[must_use]
    pub const fn default_allow_zero_length_clientid() -> bool {
        true
    }

    #[must_use]
    pub const fn default_retain_enabled() -> bool {
        true
    }

    #[must_use]
    pub const fn default_qos2_enabled() -> bool {
        true
    }

    #[must_use]
    pub const fn default_sys_topics_enabled() -> bool {
        true
    }

    #[must_use]
    pub const fn default_stats_interval() -> u64 {
        60
    }

    #[must_use]
    pub const fn default_gc_collect_interval() -> u64 {
        30
    }

    #[must_use]
    pub const fn default_recv_buffer_size() -> usize {
        1024
    }

    #[must_use]
    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn set_bind_addr(&mut self, bind_addr: &str) -> &mut Self {
        self.bind_addr = bind_addr.to_string();
        self
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) -> &mut Self {
        self.port = port;
        self
    }

    #[must_use]
    pub const fn backlog(&self) -> u32 {
        self.backlog
    }

    #[must_use]
    pub const fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn set_max_clients(&mut self, max_clients: usize) -> &mut Self {
        self.max_clients = max_clients;
        self
    }

    #[must_use]
    pub const fn max_subscriptions_per_client(&self) -> usize {
        self.max_subscriptions_per_client
    }

    #[must_use]
    pub const fn max_topic_length(&self) -> usize {
        self.max_topic_length
    }

    #[must_use]
    pub const fn max_topic_levels(&self) -> usize {
        self.max_topic_levels
    }

    #[must_use]
    pub const fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    #[must_use]
    pub const fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    #[must_use]
    pub const fn max_queued_messages(&self) -> usize {
        self.max_queued_messages
    }

    #[must_use]
    pub const fn max_inflight(&self) -> usize {
        self.max_inflight
    }

    #[must_use]
    pub const fn max_retained_messages(&self) -> usize {
        self.max_retained_messages
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    #[must_use]
    pub const fn keep_alive_factor(&self) -> f64 {
        self.keep_alive_factor
    }

    #[must_use]
    pub const fn no_keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.no_keepalive_timeout)
    }

    #[must_use]
    pub const fn qos_retry_interval(&self) -> Duration {
        Duration::from_secs(self.qos_retry_interval)
    }

    #[must_use]
    pub const fn qos_max_retries(&self) -> u32 {
        self.qos_max_retries
    }

    #[must_use]
    pub const fn session_expiry(&self) -> Duration {
        Duration::from_secs(self.session_expiry)
    }

    #[must_use]
    pub const fn allow_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    pub fn set_allow_anonymous(&mut self, allow_anonymous: bool) -> &mut Self {
        self.allow_anonymous = allow_anonymous;
        self
    }

    #[must_use]
    pub const fn allow_zero_length_clientid(&self) -> bool {
        self.allow_zero_length_clientid
    }

    #[must_use]
    pub const fn retain_enabled(&self) -> bool {
        self.retain_enabled
    }

    #[must_use]
    pub const fn qos2_enabled(&self) -> bool {
        self.qos2_enabled
    }

    #[must_use]
    pub const fn sys_topics_enabled(&self) -> bool {
        self.sys_topics_enabled
    }

    #[must_use]
    pub const fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval)
    }

    #[must_use]
    pub const fn gc_collect_interval(&self) -> Duration {
        Duration::from_secs(self.gc_collect_interval)
    }

    #[must_use]
    pub const fn recv_buffer_size(&self) -> usize {
        self.recv_buffer_size
    }

    #[must_use]
    pub const fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Validate config options.
    ///
    /// # Errors
    ///
    /// Returns error if some option holds an out-of-range value.
    #[allow(clippy::too_many_lines)]
    pub fn validate(&self) -> Result<(), Error> {
        if self.port == 0 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "port must be in range 1-65535",
            ));
        }
        if self.backlog < 1 {
            return Err(Error::new(ErrorKind::ConfigError, "backlog must be >= 1"));
        }
        if self.max_clients < 1 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "max_clients must be >= 1",
            ));
        }
        if self.max_subscriptions_per_client < 1 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "max_subscriptions_per_client must be >= 1",
            ));
        }
        if self.max_topic_length < 1 || self.max_topic_length > 65535 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "max_topic_length must be in range 1-65535",
            ));
        }
        if self.max_topic_levels < 1 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "max_topic_levels must be >= 1",
            ));
        }
        if self.max_payload_size < 1 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "max_payload_size must be >= 1",
            ));
        }
        if self.max_packet_size < self.max_payload_size {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "max_packet_size must be >= max_payload_size",
            ));
        }
        if self.max_inflight < 1 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "max_inflight must be >= 1",
            ));
        }
        if self.connect_timeout < 1 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "connect_timeout must be >= 1",
            ));
        }
        if self.keep_alive_factor <= 0.0 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "keep_alive_factor must be > 0",
            ));
        }
        if self.no_keepalive_timeout < 1 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "no_keepalive_timeout must be >= 1",
            ));
        }
        if self.qos_retry_interval < 1 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "qos_retry_interval must be >= 1",
            ));
        }
        if self.stats_interval < 1 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "stats_interval must be >= 1",
            ));
        }
        if self.gc_collect_interval < 1 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "gc_collect_interval must be >= 1",
            ));
        }
        if self.recv_buffer_size < 64 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "recv_buffer_size must be >= 64",
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: Self::default_bind_addr(),
            port: Self::default_port(),
            backlog: Self::default_backlog(),
            max_clients: Self::default_max_clients(),
            max_subscriptions_per_client: Self::default_max_subscriptions_per_client(),
            max_topic_length: Self::default_max_topic_length(),
            max_topic_levels: Self::default_max_topic_levels(),
            max_payload_size: Self::default_max_payload_size(),
            max_packet_size: Self::default_max_packet_size(),
            max_queued_messages: Self::default_max_queued_messages(),
            max_inflight: Self::default_max_inflight(),
            max_retained_messages: Self::default_max_retained_messages(),
            connect_timeout: Self::default_connect_timeout(),
            keep_alive_factor: Self::default_keep_alive_factor(),
            no_keepalive_timeout: Self::default_no_keepalive_timeout(),
            qos_retry_interval: Self::default_qos_retry_interval(),
            qos_max_retries: Self::default_qos_max_retries(),
            session_expiry: Self::default_session_expiry(),
            allow_anonymous: Self::default_allow_anonymous(),
            allow_zero_length_clientid: Self::default_allow_zero_length_clientid(),
            retain_enabled: Self::default_retain_enabled(),
            qos2_enabled: Self::default_qos2_enabled(),
            sys_topics_enabled: Self::default_sys_topics_enabled(),
            stats_interval: Self::default_stats_interval(),
            gc_collect_interval: Self::default_gc_collect_interval(),
            recv_buffer_size: Self::default_recv_buffer_size(),
            log_level: LogLevel::default(),
        }
    }
}
