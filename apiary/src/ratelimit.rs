// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Token-bucket publish rate limiter, pluggable as an interceptor.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::hooks::{Interceptor, MessageContext};

/// Per-client token bucket. Messages beyond `max_rate` per window are
/// discarded by the interceptor pipeline.
///
/// Broker-originated publishes carry no sender id and are never limited.
#[derive(Debug)]
pub struct RateLimiter {
    max_rate: u32,
    window: Duration,

    /// client id -> (tokens left, window start).
    buckets: HashMap<String, (u32, Instant)>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(max_rate: u32, window: Duration) -> Self {
        Self {
            max_rate,
            window,
            buckets: HashMap::new(),
        }
    }

    /// Drop the bucket of a disconnected client.
    pub fn cleanup_client(&mut self, client_id: &str) {
        self.buckets.remove(client_id);
    }
}

impl Interceptor for RateLimiter {
    fn intercept(&mut self, ctx: &mut MessageContext) {
        let Some(client_id) = ctx.sender_id() else {
            return;
        };

        let now = Instant::now();
        if !self.buckets.contains_key(client_id) {
            self.buckets
                .insert(client_id.to_string(), (self.max_rate.saturating_sub(1), now));
            return;
        }
        let Some((tokens, window_start)) = self.buckets.get_mut(client_id) else {
            return;
        };

        if now.duration_since(*window_start) >= self.window {
            *tokens = self.max_rate.saturating_sub(1);
            *window_start = now;
            return;
        }

        if *tokens == 0 {
            ctx.discard();
            return;
        }
        *tokens -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::QoS;

    fn publish_ctx(sender: Option<&str>) -> MessageContext {
        MessageContext::new("t", b"x", QoS::AtMostOnce, false, sender)
    }

    #[test]
    fn test_limits_after_budget_spent() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60));

        for _ in 0..2 {
            let mut ctx = publish_ctx(Some("c1"));
            limiter.intercept(&mut ctx);
            assert!(!ctx.is_dropped());
        }

        let mut ctx = publish_ctx(Some("c1"));
        limiter.intercept(&mut ctx);
        assert!(ctx.is_dropped());
    }

    #[test]
    fn test_window_refill() {
        let mut limiter = RateLimiter::new(1, Duration::ZERO);

        let mut ctx = publish_ctx(Some("c1"));
        limiter.intercept(&mut ctx);
        assert!(!ctx.is_dropped());

        // The zero-length window has always elapsed, so the bucket refills.
        let mut ctx = publish_ctx(Some("c1"));
        limiter.intercept(&mut ctx);
        assert!(!ctx.is_dropped());
    }

    #[test]
    fn test_broker_publishes_not_limited() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(60));
        for _ in 0..5 {
            let mut ctx = publish_ctx(None);
            limiter.intercept(&mut ctx);
            assert!(!ctx.is_dropped());
        }
    }

    #[test]
    fn test_buckets_are_per_client() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(60));

        let mut ctx = publish_ctx(Some("c1"));
        limiter.intercept(&mut ctx);
        assert!(!ctx.is_dropped());

        let mut ctx = publish_ctx(Some("c2"));
        limiter.intercept(&mut ctx);
        assert!(!ctx.is_dropped());

        limiter.cleanup_client("c1");
        let mut ctx = publish_ctx(Some("c1"));
        limiter.intercept(&mut ctx);
        assert!(!ctx.is_dropped());
    }
}
