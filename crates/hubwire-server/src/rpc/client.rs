//! Server-to-client invocations on a single connection.

use std::sync::Arc;
use std::time::Instant;

use hubwire_core::{ConnectionId, MessageSerializer};
use metrics::{counter, histogram};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::errors::HubError;
use crate::hub::DisconnectReason;
use crate::hub::session::ConnectionScope;
use crate::metrics::{CLIENT_RESULT_CALLS_TOTAL, CLIENT_RESULT_DURATION_SECONDS, CLIENT_RESULT_FAULTS_TOTAL};

/// Handle for invoking receiver methods on one connection.
pub struct ClientProxy<S: MessageSerializer> {
    scope: Arc<ConnectionScope<S>>,
}

impl<S: MessageSerializer> Clone for ClientProxy<S> {
    fn clone(&self) -> Self {
        Self {
            scope: Arc::clone(&self.scope),
        }
    }
}

impl<S: MessageSerializer> std::fmt::Debug for ClientProxy<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProxy")
            .field("connection_id", &self.scope.connection.id())
            .finish()
    }
}

impl<S: MessageSerializer> ClientProxy<S> {
    pub(crate) fn new(scope: Arc<ConnectionScope<S>>) -> Self {
        Self { scope }
    }

    /// Target connection id.
    pub fn connection_id(&self) -> ConnectionId {
        self.scope.connection.id()
    }

    /// Whether the target connection is still open.
    pub fn is_connected(&self) -> bool {
        !self.scope.connection.is_closed()
    }

    /// Queue a receiver invocation, routed by the method's reliability class.
    ///
    /// Returns `false` if the frame could not be queued.
    pub fn invoke<T: Serialize + ?Sized>(&self, method_id: i32, value: &T) -> Result<bool, HubError> {
        let shared = &self.scope.shared;
        let frame = shared.codec.write_broadcast(method_id, value)?;
        let connection = &self.scope.connection;
        let route = shared.router.route(method_id, connection.has_secondary());
        Ok(connection.send_routed(route, frame))
    }

    /// Invoke a receiver method and await the client's reply.
    ///
    /// Always sent on the reliable stream. Fails with
    /// [`HubError::ClientResultTimeout`] when the configured timeout passes,
    /// and with [`HubError::PendingResultCancelled`] if the connection goes
    /// away first.
    pub async fn invoke_with_result<Req, Resp>(&self, method_id: i32, request: &Req) -> Result<Resp, HubError>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        let started = Instant::now();
        counter!(CLIENT_RESULT_CALLS_TOTAL).increment(1);
        let result = self.round_trip(method_id, request).await;
        histogram!(CLIENT_RESULT_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        let payload = result.inspect_err(|err| {
            counter!(CLIENT_RESULT_FAULTS_TOTAL, "error_type" => err.kind()).increment(1);
            warn!(conn_id = %self.connection_id(), method_id, error = %err, "client result failed");
        })?;
        Ok(self.scope.shared.codec.decode(&payload)?)
    }

    async fn round_trip<Req>(&self, method_id: i32, request: &Req) -> Result<bytes::Bytes, HubError>
    where
        Req: Serialize + ?Sized + Sync,
    {
        let scope = &self.scope;
        let pending = scope.pending.register()?;
        let message_id = pending.message_id();

        // Returning early drops `pending`, which releases its entry.
        let frame = scope.shared.codec.write_client_result_request(method_id, message_id, request)?;
        if !scope.connection.send_reliable(frame).await {
            return Err(HubError::ConnectionClosed);
        }
        debug!(conn_id = %scope.connection.id(), method_id, message_id, "client result requested");

        match scope.shared.options.client_result_timeout() {
            Some(limit) => tokio::time::timeout(limit, pending.wait())
                .await
                .unwrap_or(Err(HubError::ClientResultTimeout(limit))),
            None => pending.wait().await,
        }
    }

    /// Close the target connection.
    pub fn close(&self) {
        self.scope.connection.close(DisconnectReason::ServerClosed);
    }
}
