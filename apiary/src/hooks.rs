// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Broker event hooks and the message interceptor pipeline.

use async_trait::async_trait;
use codec::{QoS, SubscribeAck};

/// Observer and veto points fired from the broker task.
///
/// Every method has a no-op default, so an implementation only overrides the
/// events it cares about. Hooks may await; a pure-sync hook simply returns.
/// Return values decide, nothing a hook does can abort the connection loop.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Fired after a CONNECT passed authentication, before CONNACK is
    /// written. Returning false rejects the client with CONNACK 0x05.
    async fn on_connect(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _will_topic: Option<&str>,
    ) -> bool {
        true
    }

    /// Fired for every accepted PUBLISH, after the interceptor pipeline.
    async fn on_publish(
        &self,
        _client_id: &str,
        _topic: &str,
        _payload: &[u8],
        _qos: QoS,
        _retain: bool,
    ) {
    }

    /// Fired per SUBSCRIBE filter with the grant computed so far. Returning
    /// `Some` replaces the grant, including `SubscribeAck::Failed` to
    /// reject.
    async fn on_subscribe(
        &self,
        _client_id: &str,
        _filter: &str,
        _granted: SubscribeAck,
    ) -> Option<SubscribeAck> {
        None
    }

    /// Fired per UNSUBSCRIBE filter.
    async fn on_unsubscribe(&self, _client_id: &str, _filter: &str) {}

    /// Fired when a session's connection ends. `graceful` is true when the
    /// client sent DISCONNECT first.
    async fn on_disconnect(&self, _client_id: &str, _graceful: bool) {}

    /// Fired before an abrupt disconnect publishes the will message.
    /// Returning false suppresses the publication.
    async fn on_will_publish(&self, _client_id: &str, _topic: &str, _payload: &[u8]) -> bool {
        true
    }
}

/// Mutable view of one PUBLISH handed to interceptors before routing.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,

    sender_id: Option<String>,
    dropped: bool,
}

impl MessageContext {
    #[must_use]
    pub fn new(
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        sender_id: Option<&str>,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
            sender_id: sender_id.map(ToString::to_string),
            dropped: false,
        }
    }

    /// Publisher client id; `None` for broker-originated messages.
    #[must_use]
    pub fn sender_id(&self) -> Option<&str> {
        self.sender_id.as_deref()
    }

    /// Drop this message; the pipeline stops and nothing is routed.
    pub fn discard(&mut self) {
        self.dropped = true;
    }

    #[must_use]
    pub const fn is_dropped(&self) -> bool {
        self.dropped
    }
}

/// A stage of the publish pipeline, run in registration order. May rewrite
/// topic, payload, QoS and retain flag, or discard the message entirely.
pub trait Interceptor: Send + Sync {
    fn intercept(&mut self, ctx: &mut MessageContext);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UppercaseTopic;

    impl Interceptor for UppercaseTopic {
        fn intercept(&mut self, ctx: &mut MessageContext) {
            ctx.topic = ctx.topic.to_uppercase();
        }
    }

    struct DropSecrets;

    impl Interceptor for DropSecrets {
        fn intercept(&mut self, ctx: &mut MessageContext) {
            if ctx.topic.contains("secret") {
                ctx.discard();
            }
        }
    }

    #[test]
    fn test_interceptors_mutate_and_drop() {
        let mut ctx = MessageContext::new("secret/a", b"x", QoS::AtMostOnce, false, Some("c1"));
        let mut upper = UppercaseTopic;
        let mut drop_secrets = DropSecrets;

        drop_secrets.intercept(&mut ctx);
        assert!(ctx.is_dropped());

        let mut ctx = MessageContext::new("plain/a", b"x", QoS::AtMostOnce, false, None);
        drop_secrets.intercept(&mut ctx);
        assert!(!ctx.is_dropped());
        upper.intercept(&mut ctx);
        assert_eq!(ctx.topic, "PLAIN/A");
        assert_eq!(ctx.sender_id(), None);
    }
}
