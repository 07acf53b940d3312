//! Hub construction and the public entry points.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use hubwire_core::{
    ConnectionId, FrameCodec, JsonSerializer, MessageSerializer, MethodTable, ReceiverMethod, ReceiverMethodMap, Reliability,
    ReliabilityRouter,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::HubOptions;
use crate::errors::HubError;
use crate::hub::DisconnectReason;
use crate::hub::broadcast::GroupBroadcaster;
use crate::hub::groups::new_group_store;
use crate::hub::heartbeat::{HeartbeatManager, HeartbeatMetadataProvider};
use crate::hub::session::{ConnectionScope, run_session};
use crate::rpc::client::ClientProxy;
use crate::rpc::context::HubCallContext;
use crate::rpc::registry::{MethodHandler, MethodRegistry, RegisteredMethod};
use crate::shutdown::{DEFAULT_DRAIN_TIMEOUT, ShutdownCoordinator, ShutdownReport};
use crate::transport::Transport;
use crate::transport::framed::framed;

/// Connection lifecycle hooks. Every hook defaults to a no-op.
#[async_trait]
pub trait HubLifecycle<S: MessageSerializer>: Send + Sync + 'static {
    /// Runs before the read loop starts. An error rejects the connection.
    async fn on_connecting(&self, _ctx: &HubCallContext<S>) -> Result<(), HubError> {
        Ok(())
    }

    /// Runs after the connection is registered, before the first frame is read.
    async fn on_connected(&self, _ctx: &HubCallContext<S>) -> Result<(), HubError> {
        Ok(())
    }

    /// Runs after teardown. Errors are logged.
    async fn on_disconnected(&self, _ctx: &HubCallContext<S>, _reason: &DisconnectReason) -> Result<(), HubError> {
        Ok(())
    }
}

/// Lifecycle that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLifecycle;

impl<S: MessageSerializer> HubLifecycle<S> for NoopLifecycle {}

/// State shared by every session of a hub.
pub(crate) struct HubShared<S: MessageSerializer> {
    pub(crate) options: HubOptions,
    pub(crate) codec: Arc<FrameCodec<S>>,
    pub(crate) methods: MethodTable<RegisteredMethod<S>>,
    pub(crate) router: ReliabilityRouter,
    pub(crate) broadcaster: GroupBroadcaster<S>,
    pub(crate) heartbeat: HeartbeatManager,
    pub(crate) lifecycle: Arc<dyn HubLifecycle<S>>,
    pub(crate) shutdown: ShutdownCoordinator,
    pub(crate) connections: DashMap<ConnectionId, Arc<ConnectionScope<S>>>,
}

impl<S: MessageSerializer> HubShared<S> {
    pub(crate) fn client(&self, id: ConnectionId) -> Option<ClientProxy<S>> {
        self.connections
            .get(&id)
            .map(|scope| ClientProxy::new(Arc::clone(scope.value())))
    }
}

/// A streaming hub: the method table, groups and heartbeats shared by all of
/// its connections.
pub struct Hub<S: MessageSerializer = JsonSerializer> {
    shared: Arc<HubShared<S>>,
}

impl<S: MessageSerializer> Clone for Hub<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: MessageSerializer> std::fmt::Debug for Hub<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("methods", &self.shared.methods.len())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl Hub<JsonSerializer> {
    /// Builder using JSON payloads.
    pub fn builder() -> HubBuilder<JsonSerializer> {
        HubBuilder::with_serializer(JsonSerializer)
    }
}

impl<S: MessageSerializer> Hub<S> {
    /// Serve one connection until it ends.
    pub async fn serve(&self, transport: Transport) -> DisconnectReason {
        let id = ConnectionId::new();
        self.shared
            .shutdown
            .track(id, run_session(Arc::clone(&self.shared), transport, id))
            .await
    }

    /// Serve one connection on a new task.
    pub fn spawn(&self, transport: Transport) -> JoinHandle<DisconnectReason> {
        let hub = self.clone();
        tokio::spawn(async move { hub.serve(transport).await })
    }

    /// Serve a length-delimited byte stream, e.g. an accepted TCP socket.
    pub fn spawn_io<T>(&self, io: T) -> JoinHandle<DisconnectReason>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.spawn(framed(io, self.shared.options.max_frame_len))
    }

    /// Group membership and broadcasting.
    pub fn broadcaster(&self) -> &GroupBroadcaster<S> {
        &self.shared.broadcaster
    }

    /// Proxy for a live connection.
    pub fn client(&self, id: ConnectionId) -> Option<ClientProxy<S>> {
        self.shared.client(id)
    }

    /// Ids of live connections.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.shared.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Heartbeat manager.
    pub fn heartbeat(&self) -> &HeartbeatManager {
        &self.shared.heartbeat
    }

    /// Options the hub was built with.
    pub fn options(&self) -> &HubOptions {
        &self.shared.options
    }

    /// Number of registered methods.
    pub fn method_count(&self) -> usize {
        self.shared.methods.len()
    }

    /// Disconnect every session and stop heartbeats without waiting.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.heartbeat.shutdown();
    }

    /// Disconnect every session, then wait for them to finish teardown.
    ///
    /// `timeout` defaults to thirty seconds. The report lists each session
    /// that ended during the drain with its disconnect reason.
    pub async fn shutdown_gracefully(&self, timeout: Option<Duration>) -> ShutdownReport {
        self.shared.heartbeat.shutdown();
        self.shared.shutdown.drain(timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT)).await
    }

    /// Session tracker and shutdown state.
    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.shared.shutdown
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.token()
    }
}

/// Builder for [`Hub`].
pub struct HubBuilder<S: MessageSerializer> {
    options: HubOptions,
    serializer: S,
    methods: MethodRegistry<S>,
    receivers: Vec<ReceiverMethod>,
    default_reliability: Reliability,
    lifecycle: Option<Arc<dyn HubLifecycle<S>>>,
    metadata: Option<Arc<dyn HeartbeatMetadataProvider>>,
    shutdown: Option<CancellationToken>,
}

impl<S: MessageSerializer> HubBuilder<S> {
    /// Builder with a custom payload serializer.
    pub fn with_serializer(serializer: S) -> Self {
        Self {
            options: HubOptions::default(),
            serializer,
            methods: MethodRegistry::new(),
            receivers: Vec::new(),
            default_reliability: Reliability::Reliable,
            lifecycle: None,
            metadata: None,
            shutdown: None,
        }
    }

    /// Replace the options.
    #[must_use]
    pub fn options(mut self, options: HubOptions) -> Self {
        self.options = options;
        self
    }

    /// Register a hub method under the FNV-1a id of its name.
    #[must_use]
    pub fn method(mut self, name: impl Into<String>, handler: impl MethodHandler<S>) -> Self {
        let _ = self.methods.register(name, handler);
        self
    }

    /// Register a hub method under an explicit id.
    #[must_use]
    pub fn method_with_id(mut self, name: impl Into<String>, id: i32, handler: impl MethodHandler<S>) -> Self {
        let _ = self.methods.register_with_id(name, id, handler);
        self
    }

    /// Declare a client receiver method.
    #[must_use]
    pub fn receiver(mut self, method: ReceiverMethod) -> Self {
        self.receivers.push(method);
        self
    }

    /// Reliability class for receivers without an override.
    #[must_use]
    pub fn default_reliability(mut self, reliability: Reliability) -> Self {
        self.default_reliability = reliability;
        self
    }

    /// Install lifecycle hooks.
    #[must_use]
    pub fn lifecycle(mut self, lifecycle: impl HubLifecycle<S>) -> Self {
        self.lifecycle = Some(Arc::new(lifecycle));
        self
    }

    /// Append metadata to every server heartbeat.
    #[must_use]
    pub fn heartbeat_metadata(mut self, provider: impl HeartbeatMetadataProvider) -> Self {
        self.metadata = Some(Arc::new(provider));
        self
    }

    /// Tie the hub to an external shutdown token.
    #[must_use]
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Validate registrations and build the hub.
    ///
    /// Fails on colliding or reserved method ids, and on awaitable receiver
    /// methods that are not reliable.
    pub fn build(self) -> Result<Hub<S>, HubError> {
        let methods = self.methods.build()?;
        let (map, resolved) = ReceiverMethodMap::build(self.default_reliability, &self.receivers)?;
        for receiver in &resolved {
            debug!(
                receiver = %receiver.name,
                method_id = receiver.id,
                reliability = %receiver.reliability,
                awaitable = receiver.awaitable,
                "receiver method"
            );
        }

        let codec = Arc::new(FrameCodec::new(self.serializer));
        let router = ReliabilityRouter::new(map);
        let broadcaster = GroupBroadcaster::new(new_group_store(self.options.group_store), Arc::clone(&codec), router.clone());
        let heartbeat = HeartbeatManager::new(&self.options.heartbeat, self.metadata);

        info!(
            methods = methods.len(),
            buckets = methods.bucket_count(),
            max_conflict = methods.max_conflict(),
            receivers = resolved.len(),
            heartbeat = self.options.heartbeat.enabled,
            "hub built"
        );

        Ok(Hub {
            shared: Arc::new(HubShared {
                options: self.options,
                codec,
                methods,
                router,
                broadcaster,
                heartbeat,
                lifecycle: self.lifecycle.unwrap_or_else(|| Arc::new(NoopLifecycle)),
                shutdown: ShutdownCoordinator::with_token(self.shutdown.unwrap_or_default()),
                connections: DashMap::new(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::registry::handler_fn;
    use assert_matches::assert_matches;
    use hubwire_core::{MethodTableError, ReliabilityError};

    fn echo() -> impl MethodHandler<JsonSerializer> {
        handler_fn(|_ctx: HubCallContext<JsonSerializer>, value: String| async move { Ok(value) })
    }

    #[test]
    fn builds_with_defaults() {
        let hub = Hub::builder().method("Echo", echo()).build().unwrap();
        assert_eq!(hub.method_count(), 1);
        assert_eq!(hub.connection_count(), 0);
        assert!(hub.options().heartbeat.enabled);
    }

    #[test]
    fn duplicate_methods_fail_before_serving() {
        let err = Hub::builder().method("Echo", echo()).method("Echo", echo()).build().unwrap_err();
        assert_matches!(err, HubError::Registration(MethodTableError::DuplicateMethodName { .. }));
    }

    #[test]
    fn awaitable_unreliable_receiver_fails() {
        let err = Hub::builder()
            .receiver(ReceiverMethod::awaitable("Confirm").with_reliability(Reliability::Unreliable))
            .build()
            .unwrap_err();
        assert_matches!(err, HubError::Receiver(ReliabilityError::AwaitableMustBeReliable { .. }));
    }

    #[test]
    fn shutdown_cancels_token() {
        let token = CancellationToken::new();
        let hub = Hub::builder().shutdown_token(token.clone()).build().unwrap();
        hub.shutdown();
        assert!(token.is_cancelled());
        assert!(hub.shutdown_token().is_cancelled());
        assert!(hub.coordinator().is_shutting_down());
    }

    #[tokio::test]
    async fn graceful_shutdown_without_sessions_completes() {
        let hub = Hub::builder().build().unwrap();
        let report = hub.shutdown_gracefully(Some(Duration::from_millis(100))).await;
        assert!(report.completed());
        assert!(report.disconnected.is_empty());
        assert!(hub.shutdown_token().is_cancelled());
    }
}
