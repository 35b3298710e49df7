//! Membership of live connections eligible for broadcasts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{oneshot, Mutex, MutexGuard};
use ulid::Ulid;

use crate::error::HubResult;

/// Opaque identity of one open connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Ulid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Write half of a connection. Only the dispatcher writes; whoever evicts closes.
#[async_trait]
pub trait PeerSink: Send {
    /// Send one encoded sample
    async fn send(&mut self, payload: &str) -> HubResult<()>;

    /// Close the channel. Must be harmless on an already-closed channel.
    async fn close(&mut self);
}

/// One registered connection: its write half plus the signal that tells its
/// reader it has been evicted. Dropping the entry fires the signal.
pub struct Member {
    pub sink: Box<dyn PeerSink>,
    evicted: oneshot::Sender<()>,
}

impl Member {
    /// Wake the connection's reader so it stops and drops the socket
    pub fn evict(self) -> Box<dyn PeerSink> {
        let _ = self.evicted.send(());
        self.sink
    }
}

pub type Members = HashMap<ConnectionId, Member>;

/// Set of registered connections behind a single lock
#[derive(Default)]
pub struct ConnectionRegistry {
    members: Mutex<Members>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Returns the eviction signal for its reader, or None
    /// (keeping the existing entry) on a duplicate id.
    ///
    /// The signal resolves once the connection leaves the registry by any path.
    pub async fn register(
        &self,
        id: ConnectionId,
        sink: Box<dyn PeerSink>,
    ) -> Option<oneshot::Receiver<()>> {
        let mut members = self.members.lock().await;
        if members.contains_key(&id) {
            tracing::warn!(connection = %id, "Duplicate registration ignored");
            return None;
        }
        let (evicted, signal) = oneshot::channel();
        members.insert(id, Member { sink, evicted });
        tracing::debug!(connection = %id, peers = members.len(), "Connection registered");
        Some(signal)
    }

    /// Remove a connection and hand back its sink so the caller can close it.
    /// Absent ids are a no-op.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Box<dyn PeerSink>> {
        let mut members = self.members.lock().await;
        let removed = members.remove(&id).map(Member::evict);
        if removed.is_some() {
            tracing::debug!(connection = %id, peers = members.len(), "Connection unregistered");
        }
        removed
    }

    /// Copy of the current membership
    pub async fn snapshot(&self) -> Vec<ConnectionId> {
        self.members.lock().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.lock().await.is_empty()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.members.lock().await.contains_key(&id)
    }

    /// Remove every member, returning their sinks
    pub async fn drain(&self) -> Vec<(ConnectionId, Box<dyn PeerSink>)> {
        self.members
            .lock()
            .await
            .drain()
            .map(|(id, member)| (id, member.evict()))
            .collect()
    }

    /// Exclusive access to the member map for one broadcast.
    /// Register/unregister wait until the guard is dropped.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Members> {
        self.members.lock().await
    }
}
