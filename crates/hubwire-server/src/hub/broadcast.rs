//! Encode-once fan-out to groups of connections.

use std::sync::Arc;

use hubwire_core::{ConnectionId, FrameCodec, MessageSerializer, ReliabilityRouter, Route};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};

use super::DisconnectReason;
use super::connection::HubConnection;
use super::groups::GroupStore;
use crate::errors::HubError;
use crate::metrics::{BROADCAST_DELIVERIES_TOTAL, BROADCAST_DROPS_TOTAL, SLOW_CLIENT_DISCONNECTS_TOTAL};

/// Maximum total lifetime frame drops before forcibly disconnecting a slow client.
pub const MAX_TOTAL_DROPS: u64 = 100;

/// Group membership plus broadcast delivery.
pub struct GroupBroadcaster<S> {
    store: Arc<dyn GroupStore>,
    codec: Arc<FrameCodec<S>>,
    router: ReliabilityRouter,
}

impl<S: MessageSerializer> GroupBroadcaster<S> {
    /// Create a broadcaster over a store.
    pub fn new(store: Arc<dyn GroupStore>, codec: Arc<FrameCodec<S>>, router: ReliabilityRouter) -> Self {
        Self { store, codec, router }
    }

    /// Add a connection to a group. Closed connections are refused.
    pub fn add(&self, group: &str, connection: &Arc<HubConnection>) -> bool {
        if connection.is_closed() {
            return false;
        }
        connection.track_group(group);
        let added = self.store.add(group, Arc::clone(connection));
        // Teardown may have swept the groups between the check and the insert.
        if connection.is_closed() {
            let _ = self.store.remove(group, connection.id());
            connection.untrack_group(group);
            debug!(conn_id = %connection.id(), group, "join raced teardown, undone");
            return false;
        }
        added
    }

    /// Remove a connection from a group. Unknown members are a no-op.
    pub fn remove(&self, group: &str, id: ConnectionId) -> bool {
        match self.store.remove(group, id) {
            Some(connection) => {
                connection.untrack_group(group);
                true
            }
            None => false,
        }
    }

    /// Remove a connection from every group it joined.
    pub fn remove_from_all(&self, connection: &HubConnection) -> usize {
        connection
            .take_groups()
            .iter()
            .filter(|group| self.store.remove(group, connection.id()).is_some())
            .count()
    }

    /// Number of members in a group.
    pub fn count(&self, group: &str) -> usize {
        self.store.count(group)
    }

    /// Names of every non-empty group.
    pub fn group_names(&self) -> Vec<String> {
        self.store.group_names()
    }

    /// Send to every member of a group. Returns how many frames were queued.
    pub fn broadcast_all<T>(&self, group: &str, method_id: i32, value: &T) -> Result<usize, HubError>
    where
        T: Serialize + ?Sized,
    {
        self.fan_out(group, method_id, value, |_| true)
    }

    /// Send to every member except the listed ids.
    pub fn broadcast_except<T>(
        &self,
        group: &str,
        excluded: &[ConnectionId],
        method_id: i32,
        value: &T,
    ) -> Result<usize, HubError>
    where
        T: Serialize + ?Sized,
    {
        self.fan_out(group, method_id, value, |id| !excluded.contains(&id))
    }

    /// Send to the listed members only. Ids outside the group are skipped.
    pub fn broadcast_to<T>(&self, group: &str, targets: &[ConnectionId], method_id: i32, value: &T) -> Result<usize, HubError>
    where
        T: Serialize + ?Sized,
    {
        if targets.is_empty() {
            return Ok(0);
        }
        self.fan_out(group, method_id, value, |id| targets.contains(&id))
    }

    /// Serialize once, then write the same frame to each selected member.
    fn fan_out<T>(&self, group: &str, method_id: i32, value: &T, include: impl Fn(ConnectionId) -> bool) -> Result<usize, HubError>
    where
        T: Serialize + ?Sized,
    {
        let frame = self.codec.write_broadcast(method_id, value)?;
        let mut recipients = 0usize;
        let mut queued = 0usize;

        self.store.for_each_member(group, &mut |conn| {
            if !include(conn.id()) || conn.is_closed() {
                return;
            }
            recipients += 1;
            let route = self.router.route(method_id, conn.has_secondary());
            if conn.send_routed(route, frame.clone()) {
                queued += 1;
                return;
            }
            if route == Route::Secondary {
                // Lossy channel; drops are expected.
                return;
            }
            counter!(BROADCAST_DROPS_TOTAL).increment(1);
            let drops = conn.drop_count();
            if drops >= MAX_TOTAL_DROPS {
                warn!(conn_id = %conn.id(), group, drops, "disconnecting slow client");
                counter!(SLOW_CLIENT_DISCONNECTS_TOTAL).increment(1);
                conn.close(DisconnectReason::SlowConsumer);
            } else {
                warn!(conn_id = %conn.id(), group, total_drops = drops, "failed to queue broadcast (channel full)");
            }
        });

        counter!(BROADCAST_DELIVERIES_TOTAL).increment(queued as u64);
        debug!(group, method_id, bytes = frame.len(), recipients, queued, "broadcast");
        Ok(queued)
    }
}

impl<S> std::fmt::Debug for GroupBroadcaster<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupBroadcaster").finish_non_exhaustive()
    }
}
