//! Live connection registry.
//!
//! One authoritative table of connections guarded by a read-write lock:
//! writers are connection accept, disconnect, the cleanup sweep, and the
//! subscribe/unsubscribe mutators; every fan-out takes a short read
//! snapshot. Writer handles are never shared across tasks; each connection
//! owns a bounded frame channel whose receiver feeds the HTTP response
//! body, and everyone else goes through [`SseConnection::send`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use cmp_eventstore::{ConnectionSnapshot, FilterSets};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::frame::SseFrame;

/// Per-connection subscription and filter state.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionState {
    /// Event-type labels this connection wants; empty means all types
    pub event_types: HashSet<String>,
    /// VM ids for VM-family events
    pub vm_ids: HashSet<String>,
    /// Provider ids for provider-family events
    pub provider_ids: HashSet<String>,
    /// Filter sets applied to kubernetes/network events
    pub filters: FilterSets,
}

/// Outcome of a frame write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Channel full; the frame was dropped to protect the fan-out path
    Dropped,
    /// Receiver gone; the connection has been cancelled
    Closed,
}

/// One live SSE session.
pub struct SseConnection {
    pub id: String,
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub cancel: CancellationToken,
    created_at: i64,
    last_seen: AtomicI64,
    state: RwLock<SubscriptionState>,
    sender: mpsc::Sender<String>,
}

impl SseConnection {
    /// Create a connection and hand back the receiver that feeds the HTTP
    /// response body.
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        workspace_id: Option<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let now = Utc::now().timestamp();
        let connection = Arc::new(Self {
            id: id.into(),
            user_id: user_id.into(),
            workspace_id,
            cancel: CancellationToken::new(),
            created_at: now,
            last_seen: AtomicI64::new(now),
            state: RwLock::new(SubscriptionState::default()),
            sender,
        });
        (connection, receiver)
    }

    /// Queue a frame for this client. A full channel drops the frame; a
    /// closed channel cancels the connection so cleanup can reap it.
    pub fn send(&self, frame: &SseFrame) -> SendOutcome {
        match self.sender.try_send(frame.render()) {
            Ok(()) => {
                self.last_seen.store(Utc::now().timestamp(), Ordering::Relaxed);
                SendOutcome::Delivered
            }
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.cancel.cancel();
                SendOutcome::Closed
            }
        }
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Seconds since the last successful write.
    pub fn idle_secs(&self) -> i64 {
        (Utc::now().timestamp() - self.last_seen()).max(0)
    }

    /// Clone the subscription state for matching.
    pub async fn subscription(&self) -> SubscriptionState {
        self.state.read().await.clone()
    }

    /// Mutate the subscription state under the connection lock.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut SubscriptionState) -> R) -> R {
        let mut state = self.state.write().await;
        f(&mut state)
    }

    /// Snapshot for the Redis mirror.
    pub async fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.state.read().await;
        ConnectionSnapshot {
            connection_id: self.id.clone(),
            user_id: self.user_id.clone(),
            workspace_id: self.workspace_id.clone(),
            subscribed_event_types: state.event_types.clone(),
            subscribed_vm_ids: state.vm_ids.clone(),
            subscribed_provider_ids: state.provider_ids.clone(),
            filters: state.filters.clone(),
            last_seen: self.last_seen(),
        }
    }
}

/// Authoritative table of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<SseConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, connection: Arc<SseConnection>) {
        let mut connections = self.connections.write().await;
        debug!(connection_id = %connection.id, user_id = %connection.user_id, "connection registered");
        connections.insert(connection.id.clone(), connection);
    }

    pub async fn remove(&self, connection_id: &str) -> Option<Arc<SseConnection>> {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(connection_id);
        if removed.is_some() {
            debug!(connection_id, "connection removed");
        }
        removed
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<SseConnection>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    /// The caller's active connection: the most recently created live
    /// session for the user.
    pub async fn find_for_user(&self, user_id: &str) -> Option<Arc<SseConnection>> {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.user_id == user_id && !c.cancel.is_cancelled())
            .max_by_key(|c| c.created_at())
            .cloned()
    }

    /// Snapshot of every live connection, for fan-out.
    pub async fn all(&self) -> Vec<Arc<SseConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive() {
        let (connection, mut rx) = SseConnection::new("c-1", "u1", None, 4);
        let before = connection.last_seen();

        let outcome = connection.send(&SseFrame::Heartbeat);
        assert_eq!(outcome, SendOutcome::Delivered);
        assert!(connection.last_seen() >= before);
        assert_eq!(rx.recv().await.unwrap(), ": heartbeat\n\n");
    }

    #[tokio::test]
    async fn test_full_channel_drops_frame() {
        let (connection, _rx) = SseConnection::new("c-1", "u1", None, 1);
        assert_eq!(connection.send(&SseFrame::Heartbeat), SendOutcome::Delivered);
        assert_eq!(connection.send(&SseFrame::Heartbeat), SendOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_closed_channel_cancels_connection() {
        let (connection, rx) = SseConnection::new("c-1", "u1", None, 4);
        drop(rx);

        assert_eq!(connection.send(&SseFrame::Heartbeat), SendOutcome::Closed);
        assert!(connection.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_find_for_user_prefers_latest_live() {
        let registry = ConnectionRegistry::new();
        let (older, _rx1) = SseConnection::new("c-1", "u1", None, 4);
        let (newer, _rx2) = SseConnection::new("c-2", "u1", None, 4);
        registry.insert(older.clone()).await;
        registry.insert(newer.clone()).await;

        // Cancelled connections are not candidates.
        newer.cancel.cancel();
        let found = registry.find_for_user("u1").await.unwrap();
        assert_eq!(found.id, "c-1");

        assert!(registry.find_for_user("other").await.is_none());
    }

    #[tokio::test]
    async fn test_subscription_mutation_idempotent() {
        let (connection, _rx) = SseConnection::new("c-1", "u1", None, 4);

        for _ in 0..2 {
            connection
                .mutate(|s| s.event_types.insert("vm-created".to_string()))
                .await;
        }
        let state = connection.subscription().await;
        assert_eq!(state.event_types.len(), 1);

        // Removing a non-member is a no-op.
        let removed = connection
            .mutate(|s| s.event_types.remove("network-vpc-created"))
            .await;
        assert!(!removed);
    }
}
