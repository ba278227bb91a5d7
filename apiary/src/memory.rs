// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Free-memory watermarks checked at connection admission.

use std::collections::HashMap;

use crate::session::Session;

/// Pending-table bound applied by the trim sweep.
const TRIM_MAX_PENDING: usize = 5;

/// Offline-queue bound applied by the trim sweep.
const TRIM_MAX_QUEUED: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLevel {
    Ok,
    Low,
    Critical,
}

/// Watches available memory and shields the broker from exhaustion.
///
/// `Low` triggers a queue trim across all sessions, `Critical` refuses new
/// connections. On platforms without a memory metric every check reports
/// `Ok`.
#[derive(Debug)]
pub struct MemoryGuard {
    low_watermark: u64,
    critical_watermark: u64,

    #[cfg(unix)]
    system: sysinfo::System,
}

impl MemoryGuard {
    /// Default low watermark: 8 MB of available memory.
    pub const DEFAULT_LOW_WATERMARK: u64 = 8 * 1024 * 1024;

    /// Default critical watermark: 2 MB of available memory.
    pub const DEFAULT_CRITICAL_WATERMARK: u64 = 2 * 1024 * 1024;

    #[must_use]
    pub fn new() -> Self {
        Self::with_watermarks(Self::DEFAULT_LOW_WATERMARK, Self::DEFAULT_CRITICAL_WATERMARK)
    }

    #[must_use]
    pub fn with_watermarks(low_watermark: u64, critical_watermark: u64) -> Self {
        Self {
            low_watermark,
            critical_watermark,
            #[cfg(unix)]
            system: sysinfo::System::new(),
        }
    }

    /// Current free/used memory in bytes, if the platform exposes it.
    #[cfg(unix)]
    pub fn snapshot(&mut self) -> Option<(u64, u64)> {
        self.system.refresh_memory();
        Some((self.system.available_memory(), self.system.used_memory()))
    }

    #[cfg(not(unix))]
    pub fn snapshot(&mut self) -> Option<(u64, u64)> {
        None
    }

    /// Check the current memory level.
    pub fn check(&mut self) -> MemoryLevel {
        let Some((available, _used)) = self.snapshot() else {
            return MemoryLevel::Ok;
        };
        if available < self.critical_watermark {
            MemoryLevel::Critical
        } else if available < self.low_watermark {
            MemoryLevel::Low
        } else {
            MemoryLevel::Ok
        }
    }

    /// Shrink pending tables and offline queues across all sessions.
    pub fn trim_queues(sessions: &mut HashMap<String, Session>) {
        for session in sessions.values_mut() {
            session.trim_queues(TRIM_MAX_PENDING, TRIM_MAX_QUEUED);
        }
    }
}

impl Default for MemoryGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use codec::{PacketId, QoS};
    use std::time::Instant;

    use crate::qos::OutboundQoS1;

    #[test]
    fn test_zero_watermarks_report_ok() {
        // With both watermarks at zero no real host can be below them.
        let mut guard = MemoryGuard::with_watermarks(0, 0);
        assert_eq!(guard.check(), MemoryLevel::Ok);
    }

    #[test]
    fn test_trim_queues_bounds() {
        let mut sessions = HashMap::new();
        let mut session = Session::new("c1", false);
        for i in 1..=20u16 {
            session.pending_qos1.insert(
                PacketId::new(i),
                OutboundQoS1 {
                    topic: "t".to_string(),
                    payload: Bytes::from_static(b"x"),
                    qos: QoS::AtLeastOnce,
                    retry_count: 0,
                    timestamp: Instant::now(),
                },
            );
            session.queue_message("t", Bytes::from_static(b"x"), QoS::AtLeastOnce, 50);
        }
        sessions.insert("c1".to_string(), session);

        MemoryGuard::trim_queues(&mut sessions);

        let session = &sessions["c1"];
        assert!(session.pending_qos1.len() <= TRIM_MAX_PENDING);
        assert!(session.queued_count() <= TRIM_MAX_QUEUED);
    }
}
