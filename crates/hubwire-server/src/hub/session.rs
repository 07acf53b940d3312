//! The per-connection session: writer tasks, read loop and teardown.
//!
//! One task reads frames. Requests go through a bounded queue to a consumer
//! task that dispatches them one at a time. The reader therefore keeps
//! draining client-result replies and heartbeat acks while a handler is
//! suspended. Every outbound frame goes through the connection's queues to a
//! single writer task per channel.
//!
//! Teardown order:
//! 1. unregister from heartbeats
//! 2. fault outstanding client results
//! 3. drain the request consumer (bounded wait)
//! 4. close the connection
//! 5. leave every group and the connection map
//! 6. flush the writers (bounded wait)
//! 7. run the disconnect hook

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hubwire_core::frame::write_client_heartbeat;
use hubwire_core::{ClientFrame, ConnectionId, MessageSerializer};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::DisconnectReason;
use super::connection::HubConnection;
use super::dispatch::dispatch;
use super::heartbeat::HeartbeatHandle;
use super::pending::PendingResultRegistry;
use crate::errors::HubError;
use crate::metrics::{CONNECTION_DURATION_SECONDS, CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL, DISCONNECTIONS_TOTAL};
use crate::rpc::context::HubCallContext;
use crate::server::HubShared;
use crate::transport::{FrameSink, FrameSource, Transport};

/// How long teardown waits for the request consumer and the writers.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything the engine knows about one live connection.
pub(crate) struct ConnectionScope<S: MessageSerializer> {
    pub(crate) connection: Arc<HubConnection>,
    pub(crate) pending: PendingResultRegistry,
    pub(crate) heartbeat: Arc<HeartbeatHandle>,
    pub(crate) shared: Arc<HubShared<S>>,
}

struct QueuedRequest {
    method_id: i32,
    message_id: Option<i16>,
    payload: Bytes,
}

/// Run one connection until it ends and return why it ended.
#[instrument(skip_all, fields(conn_id = %id))]
pub(crate) async fn run_session<S: MessageSerializer>(
    shared: Arc<HubShared<S>>,
    transport: Transport,
    id: ConnectionId,
) -> DisconnectReason {
    let Transport { source, sink, secondary } = transport;
    let capacity = shared.options.outbound_queue_capacity.max(1);

    let (primary_tx, primary_rx) = mpsc::channel(capacity);
    let (secondary_tx, secondary_parts) = match secondary {
        Some(sink) => {
            let (tx, rx) = mpsc::channel(capacity);
            (Some(tx), Some((sink, rx)))
        }
        None => (None, None),
    };
    let connection = Arc::new(HubConnection::new(id, primary_tx, secondary_tx));

    let mut writers = vec![tokio::spawn(write_loop(sink, primary_rx, Arc::clone(&connection), true))];
    if let Some((sink, rx)) = secondary_parts {
        writers.push(tokio::spawn(write_loop(sink, rx, Arc::clone(&connection), false)));
    }

    let heartbeat = shared.heartbeat.register(Arc::clone(&connection));
    let scope = Arc::new(ConnectionScope {
        connection,
        pending: PendingResultRegistry::new(),
        heartbeat,
        shared: Arc::clone(&shared),
    });
    let _ = shared.connections.insert(id, Arc::clone(&scope));
    counter!(CONNECTIONS_TOTAL).increment(1);
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
    info!(secondary = scope.connection.has_secondary(), "client connected");

    let ctx = HubCallContext::for_connection(Arc::clone(&scope));
    let (reason, consumer) = match shared.lifecycle.on_connecting(&ctx).await {
        Err(err) => {
            warn!(error = %err, "connection rejected");
            (DisconnectReason::Rejected(err.to_string()), None)
        }
        Ok(()) => {
            if let Err(err) = shared.lifecycle.on_connected(&ctx).await {
                warn!(error = %err, "on_connected hook failed");
            }
            let (queue_tx, queue_rx) = mpsc::channel(shared.options.request_queue_capacity.max(1));
            let consumer = tokio::spawn(consume_requests(Arc::clone(&scope), queue_rx));
            let reason = read_loop(&scope, source, queue_tx).await;
            (reason, Some(consumer))
        }
    };

    teardown(&scope, &ctx, reason, consumer, writers).await
}

async fn read_loop<S: MessageSerializer>(
    scope: &Arc<ConnectionScope<S>>,
    mut source: Box<dyn FrameSource>,
    queue: mpsc::Sender<QueuedRequest>,
) -> DisconnectReason {
    let shared = &scope.shared;
    let connection = &scope.connection;

    loop {
        let next = tokio::select! {
            biased;
            reason = stopped(scope) => break reason,
            next = source.next_frame() => next,
        };
        let frame = match next {
            None => break DisconnectReason::ClientClosed,
            Some(Err(err)) => break DisconnectReason::TransportError(err.to_string()),
            Some(Ok(frame)) => frame,
        };
        let frame = match ClientFrame::parse(frame) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "malformed frame, closing connection");
                break DisconnectReason::MalformedFrame(err.to_string());
            }
        };

        let request = match frame {
            ClientFrame::Request {
                method_id,
                message_id,
                payload,
            } => QueuedRequest {
                method_id,
                message_id: Some(message_id),
                payload,
            },
            ClientFrame::FireAndForget { method_id, payload } => QueuedRequest {
                method_id,
                message_id: None,
                payload,
            },
            ClientFrame::ClientResultReply { message_id, payload, .. } => {
                if !scope.pending.complete(message_id, payload) {
                    debug!(message_id, "client result reply for unknown id");
                }
                continue;
            }
            ClientFrame::ClientResultError { message_id, payload } => {
                let error = match shared.codec.decode_error(&payload) {
                    Ok(e) => HubError::ClientResult {
                        code: e.code,
                        detail: e.detail,
                        message: e.message,
                    },
                    Err(err) => HubError::Codec(err),
                };
                if !scope.pending.fault(message_id, error) {
                    debug!(message_id, "client result error for unknown id");
                }
                continue;
            }
            ClientFrame::HeartbeatAck { sequence } => {
                let _ = scope.heartbeat.ack(sequence);
                continue;
            }
            ClientFrame::ClientHeartbeat {
                sequence,
                client_sent_at,
                extra,
            } => {
                if !connection.send(write_client_heartbeat(sequence, client_sent_at, &extra)) {
                    debug!(sequence, "client heartbeat echo dropped");
                }
                continue;
            }
        };

        let sent = tokio::select! {
            biased;
            reason = stopped(scope) => break reason,
            sent = queue.send(request) => sent,
        };
        if sent.is_err() {
            // The consumer only stops early when the connection is closed.
            break connection.close_reason().unwrap_or(DisconnectReason::ServerClosed);
        }
    }
}

/// Resolves when the connection must stop for a reason other than the stream.
async fn stopped<S: MessageSerializer>(scope: &ConnectionScope<S>) -> DisconnectReason {
    tokio::select! {
        biased;
        () = scope.shared.shutdown.cancelled() => DisconnectReason::ServerShutdown,
        () = scope.heartbeat.timed_out() => DisconnectReason::HeartbeatTimeout,
        () = scope.connection.closed() => scope
            .connection
            .close_reason()
            .unwrap_or(DisconnectReason::ServerClosed),
    }
}

async fn consume_requests<S: MessageSerializer>(scope: Arc<ConnectionScope<S>>, mut queue: mpsc::Receiver<QueuedRequest>) {
    while let Some(request) = queue.recv().await {
        let Some(frame) = dispatch(&scope, request.method_id, request.message_id, request.payload).await else {
            continue;
        };
        if !scope.connection.send_reliable(frame).await {
            break;
        }
    }
}

async fn write_loop(mut sink: Box<dyn FrameSink>, mut rx: mpsc::Receiver<Bytes>, connection: Arc<HubConnection>, primary: bool) {
    loop {
        // Queued frames are flushed before a close is honoured.
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            () = connection.closed() => break,
        };
        if let Err(err) = sink.send_frame(frame).await {
            debug!(primary, error = %err, "write failed");
            if primary {
                connection.close(DisconnectReason::TransportError(err.to_string()));
            }
            break;
        }
    }
    if let Err(err) = sink.close().await {
        debug!(primary, error = %err, "close failed");
    }
}

async fn teardown<S: MessageSerializer>(
    scope: &Arc<ConnectionScope<S>>,
    ctx: &HubCallContext<S>,
    reason: DisconnectReason,
    consumer: Option<JoinHandle<()>>,
    writers: Vec<JoinHandle<()>>,
) -> DisconnectReason {
    let shared = &scope.shared;
    let connection = &scope.connection;
    let id = connection.id();

    shared.heartbeat.unregister(id);
    let faulted = scope.pending.cancel_all(|| HubError::PendingResultCancelled);

    if let Some(consumer) = consumer {
        if !join_within(consumer, DRAIN_TIMEOUT).await {
            warn!("request queue did not drain in time");
        }
    }

    // Closed first so a late join from a detached task is refused or undone.
    connection.close(reason.clone());
    let groups = shared.broadcaster.remove_from_all(connection);
    let _ = shared.connections.remove(&id);

    for writer in writers {
        if !join_within(writer, DRAIN_TIMEOUT).await {
            debug!("writer did not finish in time");
        }
    }

    if let Err(err) = shared.lifecycle.on_disconnected(ctx, &reason).await {
        warn!(error = %err, "on_disconnected hook failed");
    }

    counter!(DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
    info!(%reason, groups, faulted, "client disconnected");
    reason
}

/// Wait for a task, aborting it after `limit`. Returns whether it finished.
async fn join_within(mut task: JoinHandle<()>, limit: Duration) -> bool {
    if tokio::time::timeout(limit, &mut task).await.is_ok() {
        true
    } else {
        task.abort();
        false
    }
}
