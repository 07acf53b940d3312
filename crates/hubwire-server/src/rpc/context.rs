//! Per-call context handed to every handler.
//!
//! The context is passed explicitly; there is no ambient "current connection".
//! It is cheap to clone and may be moved into spawned tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hubwire_core::{ConnectionId, FrameCodec, MessageSerializer};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::HubError;
use crate::hub::DisconnectReason;
use crate::hub::broadcast::GroupBroadcaster;
use crate::hub::connection::HubConnection;
use crate::hub::session::ConnectionScope;
use crate::rpc::client::ClientProxy;

/// Context of one hub method invocation or lifecycle hook.
pub struct HubCallContext<S: MessageSerializer> {
    scope: Arc<ConnectionScope<S>>,
    method_id: i32,
    message_id: Option<i16>,
    started_at: Instant,
}

impl<S: MessageSerializer> Clone for HubCallContext<S> {
    fn clone(&self) -> Self {
        Self {
            scope: Arc::clone(&self.scope),
            method_id: self.method_id,
            message_id: self.message_id,
            started_at: self.started_at,
        }
    }
}

impl<S: MessageSerializer> std::fmt::Debug for HubCallContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubCallContext")
            .field("connection_id", &self.scope.connection.id())
            .field("method_id", &self.method_id)
            .field("message_id", &self.message_id)
            .finish_non_exhaustive()
    }
}

impl<S: MessageSerializer> HubCallContext<S> {
    pub(crate) fn new(scope: Arc<ConnectionScope<S>>, method_id: i32, message_id: Option<i16>) -> Self {
        Self {
            scope,
            method_id,
            message_id,
            started_at: Instant::now(),
        }
    }

    /// Context for lifecycle hooks; the method id is 0.
    pub(crate) fn for_connection(scope: Arc<ConnectionScope<S>>) -> Self {
        Self::new(scope, 0, None)
    }

    /// Id of the calling connection.
    pub fn connection_id(&self) -> ConnectionId {
        self.scope.connection.id()
    }

    /// The calling connection.
    pub fn connection(&self) -> &Arc<HubConnection> {
        &self.scope.connection
    }

    /// Method id being invoked.
    pub fn method_id(&self) -> i32 {
        self.method_id
    }

    /// Message id of the request, or `None` for fire-and-forget calls.
    pub fn message_id(&self) -> Option<i16> {
        self.message_id
    }

    /// Whether the caller expects no response.
    pub fn is_fire_and_forget(&self) -> bool {
        self.message_id.is_none()
    }

    /// Time since the invocation started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Last measured heartbeat round trip of the calling connection.
    pub fn latency(&self) -> Option<Duration> {
        self.scope.heartbeat.latency()
    }

    /// The hub's frame codec.
    pub fn codec(&self) -> &FrameCodec<S> {
        &self.scope.shared.codec
    }

    /// The hub-wide broadcaster.
    pub fn broadcaster(&self) -> &GroupBroadcaster<S> {
        &self.scope.shared.broadcaster
    }

    // ── groups ──────────────────────────────────────────────────────

    /// Add the calling connection to a group.
    pub fn join(&self, group: &str) -> bool {
        self.broadcaster().add(group, &self.scope.connection)
    }

    /// Remove the calling connection from a group.
    pub fn leave(&self, group: &str) -> bool {
        self.broadcaster().remove(group, self.connection_id())
    }

    /// Groups the calling connection belongs to.
    pub fn groups(&self) -> Vec<String> {
        self.scope.connection.groups()
    }

    // ── broadcasts ──────────────────────────────────────────────────

    /// Send to every member of a group.
    pub fn broadcast<T: Serialize + ?Sized>(&self, group: &str, method_id: i32, value: &T) -> Result<usize, HubError> {
        self.broadcaster().broadcast_all(group, method_id, value)
    }

    /// Send only to the calling connection, if it is in the group.
    pub fn broadcast_to_self<T: Serialize + ?Sized>(&self, group: &str, method_id: i32, value: &T) -> Result<usize, HubError> {
        self.broadcaster().broadcast_to(group, &[self.connection_id()], method_id, value)
    }

    /// Send to every member of a group except the calling connection.
    pub fn broadcast_except_self<T: Serialize + ?Sized>(
        &self,
        group: &str,
        method_id: i32,
        value: &T,
    ) -> Result<usize, HubError> {
        self.broadcaster().broadcast_except(group, &[self.connection_id()], method_id, value)
    }

    /// Send to every member of a group except the listed ids.
    pub fn broadcast_except<T: Serialize + ?Sized>(
        &self,
        group: &str,
        excluded: &[ConnectionId],
        method_id: i32,
        value: &T,
    ) -> Result<usize, HubError> {
        self.broadcaster().broadcast_except(group, excluded, method_id, value)
    }

    /// Send to the listed members of a group.
    pub fn broadcast_to<T: Serialize + ?Sized>(
        &self,
        group: &str,
        targets: &[ConnectionId],
        method_id: i32,
        value: &T,
    ) -> Result<usize, HubError> {
        self.broadcaster().broadcast_to(group, targets, method_id, value)
    }

    // ── direct calls ────────────────────────────────────────────────

    /// Proxy for the calling connection.
    pub fn caller(&self) -> ClientProxy<S> {
        ClientProxy::new(Arc::clone(&self.scope))
    }

    /// Proxy for any connection of the hub.
    pub fn client(&self, id: ConnectionId) -> Option<ClientProxy<S>> {
        self.scope.shared.client(id)
    }

    /// Invoke a receiver method on the calling connection without waiting.
    pub fn push<T: Serialize + ?Sized>(&self, method_id: i32, value: &T) -> Result<bool, HubError> {
        self.caller().invoke(method_id, value)
    }

    /// Invoke a receiver method on the calling connection and await its result.
    pub async fn client_result<Req, Resp>(&self, method_id: i32, request: &Req) -> Result<Resp, HubError>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        self.caller().invoke_with_result(method_id, request).await
    }

    /// Close the calling connection after the current call.
    pub fn close(&self) {
        self.scope.connection.close(DisconnectReason::ServerClosed);
    }
}
