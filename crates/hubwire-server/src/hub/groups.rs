//! Group membership stores.
//!
//! Two backings share the [`GroupStore`] seam:
//!
//! - [`ConcurrentGroupStore`]: nested concurrent maps. Add and remove are
//!   cheap; broadcasts iterate live shards.
//! - [`SnapshotGroupStore`]: each group is an immutable member array that is
//!   rebuilt on every mutation. Broadcasts iterate a snapshot with no lock held.
//!
//! Empty groups are removed from both stores.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use hubwire_core::ConnectionId;
use parking_lot::RwLock;

use super::connection::HubConnection;
use crate::config::GroupStoreKind;

/// Named sets of connections.
pub trait GroupStore: Send + Sync + 'static {
    /// Add a connection. Returns `false` if it was already a member.
    fn add(&self, group: &str, connection: Arc<HubConnection>) -> bool;

    /// Remove a connection, returning it if it was a member.
    fn remove(&self, group: &str, id: ConnectionId) -> Option<Arc<HubConnection>>;

    /// Visit every member of a group.
    fn for_each_member(&self, group: &str, visit: &mut dyn FnMut(&Arc<HubConnection>));

    /// Number of members in a group.
    fn count(&self, group: &str) -> usize;

    /// Names of every non-empty group.
    fn group_names(&self) -> Vec<String>;
}

/// Build the store selected by options.
pub fn new_group_store(kind: GroupStoreKind) -> Arc<dyn GroupStore> {
    match kind {
        GroupStoreKind::Concurrent => Arc::new(ConcurrentGroupStore::new()),
        GroupStoreKind::Snapshot => Arc::new(SnapshotGroupStore::new()),
    }
}

// ── concurrent ──────────────────────────────────────────────────────

/// Group store backed by nested concurrent maps.
#[derive(Debug, Default)]
pub struct ConcurrentGroupStore {
    groups: DashMap<String, DashMap<ConnectionId, Arc<HubConnection>>>,
}

impl ConcurrentGroupStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl GroupStore for ConcurrentGroupStore {
    fn add(&self, group: &str, connection: Arc<HubConnection>) -> bool {
        let members = self.groups.entry(group.to_owned()).or_default();
        members.insert(connection.id(), connection).is_none()
    }

    fn remove(&self, group: &str, id: ConnectionId) -> Option<Arc<HubConnection>> {
        let removed = self.groups.get(group)?.remove(&id).map(|(_, conn)| conn);
        if removed.is_some() {
            let _ = self.groups.remove_if(group, |_, members| members.is_empty());
        }
        removed
    }

    fn for_each_member(&self, group: &str, visit: &mut dyn FnMut(&Arc<HubConnection>)) {
        if let Some(members) = self.groups.get(group) {
            for member in members.iter() {
                visit(member.value());
            }
        }
    }

    fn count(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, |members| members.len())
    }

    fn group_names(&self) -> Vec<String> {
        self.groups
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }
}

// ── snapshot ────────────────────────────────────────────────────────

type Members = Arc<[Arc<HubConnection>]>;

/// Group store whose member lists are immutable snapshots.
#[derive(Debug, Default)]
pub struct SnapshotGroupStore {
    groups: RwLock<HashMap<String, Members>>,
}

impl SnapshotGroupStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self, group: &str) -> Option<Members> {
        self.groups.read().get(group).cloned()
    }
}

impl GroupStore for SnapshotGroupStore {
    fn add(&self, group: &str, connection: Arc<HubConnection>) -> bool {
        let mut groups = self.groups.write();
        let current = groups.get(group);
        if current.is_some_and(|members| members.iter().any(|m| m.id() == connection.id())) {
            return false;
        }
        let rebuilt: Members = current
            .map(|members| members.iter().cloned())
            .into_iter()
            .flatten()
            .chain(std::iter::once(connection))
            .collect();
        let _ = groups.insert(group.to_owned(), rebuilt);
        true
    }

    fn remove(&self, group: &str, id: ConnectionId) -> Option<Arc<HubConnection>> {
        let mut groups = self.groups.write();
        let members = groups.get(group)?;
        let position = members.iter().position(|m| m.id() == id)?;
        let removed = Arc::clone(&members[position]);
        if members.len() == 1 {
            let _ = groups.remove(group);
        } else {
            let rebuilt: Members = members
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != position)
                .map(|(_, m)| Arc::clone(m))
                .collect();
            let _ = groups.insert(group.to_owned(), rebuilt);
        }
        Some(removed)
    }

    fn for_each_member(&self, group: &str, visit: &mut dyn FnMut(&Arc<HubConnection>)) {
        // Iterate outside the lock.
        if let Some(members) = self.snapshot(group) {
            for member in members.iter() {
                visit(member);
            }
        }
    }

    fn count(&self, group: &str) -> usize {
        self.groups.read().get(group).map_or(0, |members| members.len())
    }

    fn group_names(&self) -> Vec<String> {
        self.groups.read().keys().cloned().collect()
    }
}
