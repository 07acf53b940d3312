//! Per-connection state shared by the session, groups and heartbeats.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use hubwire_core::{ConnectionId, Route};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::DisconnectReason;

/// A connected client as seen by every engine component.
///
/// Outbound frames are queued onto the session's writer task; this type never
/// touches the transport directly.
#[derive(Debug)]
pub struct HubConnection {
    id: ConnectionId,
    connected_at: Instant,
    primary: mpsc::Sender<Bytes>,
    secondary: Option<mpsc::Sender<Bytes>>,
    groups: Mutex<BTreeSet<String>>,
    dropped_frames: AtomicU64,
    close_token: CancellationToken,
    close_reason: Mutex<Option<DisconnectReason>>,
}

impl HubConnection {
    /// Create a connection over the given outbound queues.
    pub fn new(id: ConnectionId, primary: mpsc::Sender<Bytes>, secondary: Option<mpsc::Sender<Bytes>>) -> Self {
        Self {
            id,
            connected_at: Instant::now(),
            primary,
            secondary,
            groups: Mutex::new(BTreeSet::new()),
            dropped_frames: AtomicU64::new(0),
            close_token: CancellationToken::new(),
            close_reason: Mutex::new(None),
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether a secondary channel is attached.
    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }

    /// Queue a frame on the primary stream without waiting.
    ///
    /// Returns `false` if the queue is full or closed, and increments the
    /// dropped frame counter.
    pub fn send(&self, frame: Bytes) -> bool {
        if self.primary.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Queue a frame on the primary stream, waiting for queue space.
    ///
    /// Returns `false` once the connection is closed.
    pub async fn send_reliable(&self, frame: Bytes) -> bool {
        tokio::select! {
            biased;
            sent = self.primary.send(frame) => sent.is_ok(),
            () = self.close_token.cancelled() => false,
        }
    }

    /// Queue a frame on the channel chosen by the router.
    ///
    /// Drops on a full secondary channel are expected and are not counted.
    pub fn send_routed(&self, route: Route, frame: Bytes) -> bool {
        match (route, &self.secondary) {
            (Route::Secondary, Some(secondary)) => secondary.try_send(frame).is_ok(),
            _ => self.send(frame),
        }
    }

    /// Total frames dropped on the primary stream.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Ask the session to disconnect. The first reason wins.
    pub fn close(&self, reason: DisconnectReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.close_token.cancel();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.close_token.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.close_token.cancelled()
    }

    /// Reason passed to the first [`close`](Self::close) call.
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.close_reason.lock().clone()
    }

    /// Names of the groups this connection belongs to, sorted.
    pub fn groups(&self) -> Vec<String> {
        self.groups.lock().iter().cloned().collect()
    }

    pub(crate) fn track_group(&self, group: &str) {
        let _ = self.groups.lock().insert(group.to_owned());
    }

    pub(crate) fn untrack_group(&self, group: &str) {
        let _ = self.groups.lock().remove(group);
    }

    pub(crate) fn take_groups(&self) -> Vec<String> {
        std::mem::take(&mut *self.groups.lock()).into_iter().collect()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
