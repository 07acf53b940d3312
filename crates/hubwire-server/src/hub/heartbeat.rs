//! Server heartbeats and per-connection liveness.
//!
//! One tick task is shared by every registered connection. It starts when the
//! first connection registers and stops when the last one unregisters. Each
//! tick writes the same heartbeat frame to every connection and arms that
//! connection's ack timeout if it is not already running. An ack carrying
//! the most recent sequence disarms the timeout and records latency. When a
//! timeout expires the handle's token is cancelled and the connection is
//! closed with [`DisconnectReason::HeartbeatTimeout`].

use std::sync::atomic::{AtomicI16, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hubwire_core::ConnectionId;
use hubwire_core::frame::write_server_heartbeat;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

use super::DisconnectReason;
use super::connection::HubConnection;
use crate::config::HeartbeatOptions;
use crate::metrics::{HEARTBEAT_LATENCY_SECONDS, HEARTBEAT_TICKS_TOTAL, HEARTBEAT_TIMEOUTS_TOTAL};

/// Supplies extra bytes appended to every server heartbeat.
pub trait HeartbeatMetadataProvider: Send + Sync + 'static {
    /// Append metadata to `buf`. Returning `false` sends no metadata.
    fn write_metadata(&self, buf: &mut BytesMut) -> bool;
}

/// Called with the connection id and measured latency after a matching ack.
pub type AckCallback = Arc<dyn Fn(ConnectionId, Duration) + Send + Sync>;

/// Shared heartbeat driver for all connections of a hub.
#[derive(Clone)]
pub struct HeartbeatManager {
    inner: Arc<Inner>,
}

struct Inner {
    enabled: bool,
    interval: Duration,
    timeout: Option<Duration>,
    metadata: Option<Arc<dyn HeartbeatMetadataProvider>>,
    handles: DashMap<ConnectionId, Arc<HeartbeatHandle>>,
    registered: AtomicUsize,
    timer: Mutex<Option<CancellationToken>>,
    sequence: AtomicI16,
}

impl HeartbeatManager {
    /// Create a manager from options.
    pub fn new(options: &HeartbeatOptions, metadata: Option<Arc<dyn HeartbeatMetadataProvider>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                enabled: options.enabled,
                interval: options.interval(),
                timeout: options.timeout(),
                metadata,
                handles: DashMap::new(),
                registered: AtomicUsize::new(0),
                timer: Mutex::new(None),
                sequence: AtomicI16::new(0),
            }),
        }
    }

    /// A manager that never sends heartbeats and never times out.
    pub fn disabled() -> Self {
        Self::new(
            &HeartbeatOptions {
                enabled: false,
                ..HeartbeatOptions::default()
            },
            None,
        )
    }

    /// Whether heartbeats are sent at all.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Register a connection and return its handle.
    ///
    /// When heartbeats are disabled the handle is inert.
    pub fn register(&self, connection: Arc<HubConnection>) -> Arc<HeartbeatHandle> {
        let handle = Arc::new(HeartbeatHandle::new(connection));
        if !self.inner.enabled {
            return handle;
        }
        if let Some(previous) = self.inner.handles.insert(handle.connection_id(), Arc::clone(&handle)) {
            previous.dispose();
            return handle;
        }
        if self.inner.registered.fetch_add(1, Ordering::AcqRel) == 0 {
            self.start_timer();
        }
        handle
    }

    /// Unregister a connection and dispose its handle.
    pub fn unregister(&self, id: ConnectionId) {
        let Some((_, handle)) = self.inner.handles.remove(&id) else {
            return;
        };
        handle.dispose();
        if self.inner.registered.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.stop_timer();
        }
    }

    /// Handle of a registered connection.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<HeartbeatHandle>> {
        self.inner.handles.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered connections.
    pub fn registered_count(&self) -> usize {
        self.inner.registered.load(Ordering::Acquire)
    }

    /// Whether the shared tick task is running.
    pub fn is_timer_running(&self) -> bool {
        self.inner.timer.lock().is_some()
    }

    /// Stop the tick task and dispose every handle.
    pub fn shutdown(&self) {
        if let Some(token) = self.inner.timer.lock().take() {
            token.cancel();
        }
        let ids: Vec<ConnectionId> = self.inner.handles.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.inner.handles.remove(&id) {
                handle.dispose();
            }
        }
        self.inner.registered.store(0, Ordering::Release);
    }

    fn start_timer(&self) {
        let mut timer = self.inner.timer.lock();
        if timer.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let interval = self.inner.interval;
        drop(tokio::spawn(run_ticks(Arc::downgrade(&self.inner), interval, token.clone())));
        *timer = Some(token);
        debug!(interval_ms = interval.as_millis() as u64, "heartbeat timer started");
    }

    fn stop_timer(&self) {
        let mut timer = self.inner.timer.lock();
        // A register may have raced in after the count hit zero.
        if self.inner.registered.load(Ordering::Acquire) != 0 {
            return;
        }
        if let Some(token) = timer.take() {
            token.cancel();
            debug!("heartbeat timer stopped");
        }
    }
}

impl std::fmt::Debug for HeartbeatManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatManager")
            .field("enabled", &self.inner.enabled)
            .field("interval", &self.inner.interval)
            .field("timeout", &self.inner.timeout)
            .field("registered", &self.registered_count())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn tick(&self) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let sent_at_ms = Utc::now().timestamp_millis();

        let mut metadata = BytesMut::new();
        if let Some(provider) = &self.metadata {
            if !provider.write_metadata(&mut metadata) {
                metadata.clear();
            }
        }
        let frame = write_server_heartbeat(sequence, sent_at_ms, &metadata);

        let handles: Vec<Arc<HeartbeatHandle>> = self.handles.iter().map(|entry| Arc::clone(entry.value())).collect();
        for handle in &handles {
            handle.send_heartbeat(sequence, frame.clone(), self.timeout);
        }

        counter!(HEARTBEAT_TICKS_TOTAL).increment(1);
        debug!(sequence, recipients = handles.len(), "heartbeat sent");
    }
}

async fn run_ticks(inner: Weak<Inner>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.tick();
            }
        }
    }
}

/// Liveness state of one connection.
pub struct HeartbeatHandle {
    connection: Arc<HubConnection>,
    timeout_token: CancellationToken,
    state: Mutex<HandleState>,
    on_ack: Mutex<Option<AckCallback>>,
}

#[derive(Default)]
struct HandleState {
    waiting_sequence: Option<i16>,
    sent_at: Option<Instant>,
    latency: Option<Duration>,
    last_received_at: Option<DateTime<Utc>>,
    timer: Option<(u64, JoinHandle<()>)>,
    generation: u64,
    disposed: bool,
}

impl HeartbeatHandle {
    fn new(connection: Arc<HubConnection>) -> Self {
        Self {
            connection,
            timeout_token: CancellationToken::new(),
            state: Mutex::new(HandleState::default()),
            on_ack: Mutex::new(None),
        }
    }

    /// Id of the owning connection.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Resolves when the ack timeout fires.
    pub fn timed_out(&self) -> WaitForCancellationFuture<'_> {
        self.timeout_token.cancelled()
    }

    /// Whether the ack timeout has fired.
    pub fn is_timed_out(&self) -> bool {
        self.timeout_token.is_cancelled()
    }

    /// Round-trip time measured by the most recent matching ack.
    pub fn latency(&self) -> Option<Duration> {
        self.state.lock().latency
    }

    /// Wall-clock time of the most recent matching ack.
    pub fn last_received_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_received_at
    }

    /// Install a callback invoked after each matching ack.
    pub fn set_ack_callback(&self, callback: AckCallback) {
        *self.on_ack.lock() = Some(callback);
    }

    /// Process a client ack. Returns `false` for stale or unknown sequences.
    pub fn ack(&self, sequence: i16) -> bool {
        let latency = {
            let mut state = self.state.lock();
            if state.disposed || state.waiting_sequence != Some(sequence) {
                debug!(conn_id = %self.connection.id(), sequence, "ignoring heartbeat ack");
                return false;
            }
            state.waiting_sequence = None;
            let latency = state.sent_at.map_or(Duration::ZERO, |sent| sent.elapsed());
            state.latency = Some(latency);
            state.last_received_at = Some(Utc::now());
            if let Some((_, task)) = state.timer.take() {
                task.abort();
            }
            latency
        };

        histogram!(HEARTBEAT_LATENCY_SECONDS).record(latency.as_secs_f64());
        let callback = self.on_ack.lock().clone();
        if let Some(callback) = callback {
            callback(self.connection.id(), latency);
        }
        true
    }

    fn send_heartbeat(self: &Arc<Self>, sequence: i16, frame: Bytes, timeout: Option<Duration>) {
        if self.timeout_token.is_cancelled() {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.waiting_sequence = Some(sequence);
            state.sent_at = Some(Instant::now());
            if let Some(timeout) = timeout {
                if state.timer.is_none() {
                    state.generation += 1;
                    let generation = state.generation;
                    let weak = Arc::downgrade(self);
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        if let Some(handle) = weak.upgrade() {
                            handle.expire(generation);
                        }
                    });
                    state.timer = Some((generation, task));
                }
            }
        }
        if !self.connection.send(frame) {
            debug!(conn_id = %self.connection.id(), sequence, "heartbeat not queued (queue full or closed)");
        }
    }

    fn expire(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.disposed || !matches!(state.timer, Some((armed, _)) if armed == generation) {
                return;
            }
            state.timer = None;
        }
        warn!(conn_id = %self.connection.id(), "heartbeat timed out, closing connection");
        counter!(HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
        self.timeout_token.cancel();
        self.connection.close(DisconnectReason::HeartbeatTimeout);
    }

    fn dispose(&self) {
        let mut state = self.state.lock();
        state.disposed = true;
        if let Some((_, task)) = state.timer.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for HeartbeatHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatHandle")
            .field("connection_id", &self.connection.id())
            .field("timed_out", &self.is_timed_out())
            .finish_non_exhaustive()
    }
}
