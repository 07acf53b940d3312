//! Hub options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Heartbeat settings shared by every connection of a hub.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatOptions {
    /// Send server heartbeats at all.
    pub enabled: bool,
    /// Interval between ticks in milliseconds.
    pub interval_ms: u64,
    /// Time allowed for an ack before the connection is closed.
    /// `None` or `0` disables the timeout.
    pub timeout_ms: Option<u64>,
}

impl HeartbeatOptions {
    /// Tick interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Ack timeout, or `None` when infinite.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 15_000,
            timeout_ms: Some(30_000),
        }
    }
}

/// Backing strategy for group membership.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStoreKind {
    /// Concurrent map; O(1) add/remove, live iteration during broadcast.
    #[default]
    Concurrent,
    /// Immutable member array rebuilt per mutation; snapshot broadcasts.
    Snapshot,
}

/// Configuration for a hub.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubOptions {
    /// Heartbeat settings.
    pub heartbeat: HeartbeatOptions,
    /// Include the underlying error message in error frames.
    pub return_error_detail: bool,
    /// Time allowed for a client-result reply. `None` or `0` waits forever.
    pub client_result_timeout_ms: Option<u64>,
    /// Capacity of each connection's outbound frame queue.
    pub outbound_queue_capacity: usize,
    /// Capacity of each connection's inbound request queue.
    pub request_queue_capacity: usize,
    /// Group membership backing.
    pub group_store: GroupStoreKind,
    /// Largest frame accepted by length-delimited transports.
    pub max_frame_len: usize,
}

impl HubOptions {
    /// Client-result timeout, or `None` when unbounded.
    pub fn client_result_timeout(&self) -> Option<Duration> {
        self.client_result_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatOptions::default(),
            return_error_detail: false,
            client_result_timeout_ms: Some(5_000),
            outbound_queue_capacity: 1024,
            request_queue_capacity: 10,
            group_store: GroupStoreKind::Concurrent,
            max_frame_len: 16 * 1024 * 1024, // 16 MB
        }
    }
}
