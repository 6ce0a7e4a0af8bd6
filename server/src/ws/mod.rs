pub mod handler;
pub mod session;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push frames to a specific
/// client; the session's writer task drains the receiving end into the sink.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// Connection registry: the single source of truth for which users are
/// reachable in-process right now. At most one live connection per user.
///
/// An explicitly constructed value carried in AppState — never a process
/// global. All operations are O(1) under DashMap's shard locks, and nothing
/// slow (I/O, persistence, sends) happens while a shard lock is held.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<DashMap<i64, ConnectionSender>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `tx` as the user's live connection. Last write wins: a newer
    /// connection silently replaces any prior one. Returns the superseded
    /// sender, if any, so the caller can close it explicitly.
    pub fn register(&self, user_id: i64, tx: ConnectionSender) -> Option<ConnectionSender> {
        self.inner.insert(user_id, tx)
    }

    /// Current live connection for a user, if any. Pure read, never blocks
    /// beyond the shard lock, never fails.
    pub fn lookup(&self, user_id: i64) -> Option<ConnectionSender> {
        self.inner.get(&user_id).map(|entry| entry.value().clone())
    }

    /// Remove the user's entry — but only while it still belongs to `tx`.
    /// A superseded session unwinding late must not evict its successor.
    /// No-op if the user has no entry.
    pub fn unregister(&self, user_id: i64, tx: &ConnectionSender) {
        self.inner
            .remove_if(&user_id, |_, current| current.same_channel(tx));
    }
}
