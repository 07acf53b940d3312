//! Correlation of server-initiated client-result calls.
//!
//! Ids come from the negative range `-2..=i16::MIN`, walking downward and
//! wrapping, skipping any id that is still outstanding. On teardown every
//! outstanding entry is faulted so no caller waits forever. Dropping a
//! [`PendingResult`] before its reply arrives releases its entry.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use hubwire_core::constants::{CLIENT_RESULT_ID_SPACE, CLIENT_RESULT_MAX_ID};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::errors::HubError;

type Reply = Result<Bytes, HubError>;

/// Outstanding client-result calls of one connection.
#[derive(Debug)]
pub struct PendingResultRegistry {
    inner: Arc<Mutex<State>>,
}

#[derive(Debug)]
struct State {
    entries: HashMap<i16, Entry>,
    next_id: i16,
    // Tells a reused id apart from the entry a stale handle registered.
    next_generation: u64,
    closed: bool,
}

#[derive(Debug)]
struct Entry {
    generation: u64,
    tx: oneshot::Sender<Reply>,
}

/// Awaitable side of a registered entry. Dropping it forgets the entry.
#[derive(Debug)]
pub struct PendingResult {
    message_id: i16,
    generation: u64,
    rx: oneshot::Receiver<Reply>,
    registry: Weak<Mutex<State>>,
}

impl PendingResult {
    /// Message id to put on the client-result request frame.
    pub fn message_id(&self) -> i16 {
        self.message_id
    }

    /// Wait for the reply payload.
    pub async fn wait(mut self) -> Result<Bytes, HubError> {
        (&mut self.rx).await.unwrap_or(Err(HubError::PendingResultCancelled))
    }
}

impl Drop for PendingResult {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut state = registry.lock();
        if state
            .entries
            .get(&self.message_id)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            let _ = state.entries.remove(&self.message_id);
        }
    }
}

impl PendingResultRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                entries: HashMap::new(),
                next_id: CLIENT_RESULT_MAX_ID,
                next_generation: 0,
                closed: false,
            })),
        }
    }

    /// Allocate an id and its completion.
    pub fn register(&self) -> Result<PendingResult, HubError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(HubError::ConnectionClosed);
        }
        if state.entries.len() >= CLIENT_RESULT_ID_SPACE {
            return Err(HubError::TooManyPendingResults);
        }
        let message_id = loop {
            let candidate = state.next_id;
            state.next_id = if candidate == i16::MIN {
                CLIENT_RESULT_MAX_ID
            } else {
                candidate - 1
            };
            if !state.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        let generation = state.next_generation;
        state.next_generation += 1;
        let (tx, rx) = oneshot::channel();
        let _ = state.entries.insert(message_id, Entry { generation, tx });
        Ok(PendingResult {
            message_id,
            generation,
            rx,
            registry: Arc::downgrade(&self.inner),
        })
    }

    /// Complete an entry with the client's payload. Unknown ids return `false`.
    pub fn complete(&self, message_id: i16, payload: Bytes) -> bool {
        self.resolve(message_id, Ok(payload))
    }

    /// Fault an entry. Unknown ids return `false`.
    pub fn fault(&self, message_id: i16, error: HubError) -> bool {
        self.resolve(message_id, Err(error))
    }

    /// Forget an entry without completing it.
    pub fn remove(&self, message_id: i16) -> bool {
        self.inner.lock().entries.remove(&message_id).is_some()
    }

    /// Fault every outstanding entry and refuse new registrations.
    ///
    /// Returns how many entries were faulted.
    pub fn cancel_all(&self, error: impl Fn() -> HubError) -> usize {
        let drained: Vec<_> = {
            let mut state = self.inner.lock();
            state.closed = true;
            state.entries.drain().collect()
        };
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(error()));
        }
        count
    }

    /// Number of outstanding entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve(&self, message_id: i16, reply: Reply) -> bool {
        let Some(entry) = self.inner.lock().entries.remove(&message_id) else {
            return false;
        };
        // The waiter may have timed out and gone away.
        let _ = entry.tx.send(reply);
        true
    }
}

impl Default for PendingResultRegistry {
    fn default() -> Self {
        Self::new()
    }
}
