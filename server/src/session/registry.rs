//! Connection registry: who is online, and on which channel

use super::connection::ChannelHandle;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Maps each principal to its currently active channel
///
/// At most one handle per principal. A later `join` replaces the earlier
/// handle without closing it, so a superseded connection stays open but stops
/// receiving broadcasts.
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<String, ChannelHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Map `principal_id` to `handle`, returning the handle it superseded
    pub async fn join(&self, principal_id: impl Into<String>, handle: ChannelHandle) -> Option<ChannelHandle> {
        let principal_id = principal_id.into();
        let mut entries = self.entries.write().await;
        let previous = entries.insert(principal_id.clone(), handle);
        if let Some(ref prev) = previous {
            debug!("{} superseded {} for {}", entries[&principal_id].id(), prev.id(), principal_id);
        }
        previous
    }

    /// Remove the mapping that points at `handle`
    ///
    /// A handle that was already superseded (or already left) matches nothing
    /// and the call is a no-op. Returns the principal whose entry was removed.
    pub async fn leave(&self, handle: &ChannelHandle) -> Option<String> {
        let mut entries = self.entries.write().await;
        let principal_id = entries
            .iter()
            .find(|(_, mapped)| *mapped == handle)
            .map(|(principal_id, _)| principal_id.clone())?;
        entries.remove(&principal_id);
        Some(principal_id)
    }

    /// Handle currently mapped for `principal_id`
    pub async fn lookup(&self, principal_id: &str) -> Option<ChannelHandle> {
        self.entries.read().await.get(principal_id).cloned()
    }

    /// Snapshot of every registered handle at call time
    pub async fn all_handles(&self) -> Vec<ChannelHandle> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Principals currently online, sorted
    pub async fn online_principals(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
