//! Connection registry
//!
//! Maps each conversation id to the connections currently subscribed to it.
//! Entries live in a sharded map, so insert, remove and broadcast on one
//! conversation hold that entry's lock and never see a half-updated set.
//! Empty entries are pruned.

use std::collections::HashMap;

use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::connection::{CloseReason, ConnectionHandle, ConnectionId};
use super::{ConversationId, UserId};

/// Outcome of one broadcast
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections whose queue accepted the frame
    pub delivered: usize,
    /// Connections dropped because they could not take the frame
    pub dropped: Vec<ConnectionId>,
}

/// Conversation id -> open connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<ConversationId, HashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a conversation, creating the entry if needed
    pub fn insert(&self, conversation_id: ConversationId, id: ConnectionId, handle: ConnectionHandle) {
        self.entries
            .entry(conversation_id)
            .or_default()
            .insert(id, handle);
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn remove(&self, conversation_id: ConversationId, id: ConnectionId) -> bool {
        let removed = match self.entries.get_mut(&conversation_id) {
            Some(mut entry) => entry.remove(&id).is_some(),
            None => false,
        };
        // The entry guard above must be released before pruning
        self.entries
            .remove_if(&conversation_id, |_, entry| entry.is_empty());
        removed
    }

    /// Queue a frame on every connection of a conversation
    ///
    /// Never waits on a peer: a connection whose queue is full or closed is
    /// removed from the entry and asked to close.
    pub fn broadcast(
        &self,
        conversation_id: ConversationId,
        frame: &str,
        skip: Option<ConnectionId>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut unreachable = Vec::new();

        if let Some(entry) = self.entries.get(&conversation_id) {
            for (id, handle) in entry.iter() {
                if skip == Some(*id) {
                    continue;
                }
                match handle.sender.try_send(frame.to_string()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            conversation_id,
                            connection_id = %id,
                            user_id = handle.user_id,
                            "Outbound queue full, dropping connection"
                        );
                        unreachable.push((*id, handle.clone(), CloseReason::QueueFull));
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(conversation_id, connection_id = %id, "Outbound queue closed");
                        unreachable.push((*id, handle.clone(), CloseReason::PeerClosed));
                    }
                }
            }
        }

        for (id, handle, reason) in unreachable {
            self.remove(conversation_id, id);
            handle.closer.close(reason);
            report.dropped.push(id);
        }

        report
    }

    /// Remove every connection `user_id` holds on a conversation and close
    /// them with `reason`. Returns how many were removed.
    pub fn evict_user(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        reason: CloseReason,
    ) -> usize {
        let evicted: Vec<ConnectionHandle> = match self.entries.get_mut(&conversation_id) {
            Some(mut entry) => {
                let ids: Vec<ConnectionId> = entry
                    .iter()
                    .filter(|(_, handle)| handle.user_id == user_id)
                    .map(|(id, _)| *id)
                    .collect();
                ids.iter().filter_map(|id| entry.remove(id)).collect()
            }
            None => Vec::new(),
        };
        self.entries
            .remove_if(&conversation_id, |_, entry| entry.is_empty());

        for handle in &evicted {
            handle.closer.close(reason);
        }
        evicted.len()
    }

    /// Number of connections registered under a conversation
    pub fn connection_count(&self, conversation_id: ConversationId) -> usize {
        self.entries
            .get(&conversation_id)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    /// Whether a connection is registered under a conversation
    #[allow(dead_code)]
    pub fn contains(&self, conversation_id: ConversationId, id: ConnectionId) -> bool {
        self.entries
            .get(&conversation_id)
            .is_some_and(|entry| entry.contains_key(&id))
    }

    /// Number of non-empty entries
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Total open connections across all conversations
    pub fn total_connections(&self) -> usize {
        self.entries.iter().map(|entry| entry.len()).sum()
    }

    /// Ask every registered connection to close
    pub fn close_all(&self, reason: CloseReason) {
        for entry in self.entries.iter() {
            for handle in entry.values() {
                handle.closer.close(reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::connection::{Connection, Outbound};

    fn register(registry: &ConnectionRegistry, cid: ConversationId, uid: UserId, cap: usize) -> (Connection, Outbound) {
        let (conn, outbound) = Connection::open(cid, uid, cap);
        registry.insert(cid, conn.id(), conn.handle());
        (conn, outbound)
    }

    #[test]
    fn test_insert_and_remove() {
        let registry = ConnectionRegistry::new();
        let (conn, _out) = register(&registry, 7, 1, 4);

        assert!(registry.contains(7, conn.id()));
        assert_eq!(registry.connection_count(7), 1);
        assert_eq!(registry.entry_count(), 1);

        assert!(registry.remove(7, conn.id()));
        assert!(!registry.contains(7, conn.id()));
        // Empty entries are pruned
        assert_eq!(registry.entry_count(), 0);
    }

    #[test]
    fn test_remove_idempotent() {
        let registry = ConnectionRegistry::new();
        let (conn, _out) = register(&registry, 7, 1, 4);

        assert!(registry.remove(7, conn.id()));
        assert!(!registry.remove(7, conn.id()));
        assert!(!registry.remove(9, conn.id()));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_entry_members() {
        let registry = ConnectionRegistry::new();
        let (_a, mut out_a) = register(&registry, 7, 1, 4);
        let (_b, mut out_b) = register(&registry, 7, 2, 4);
        let (_c, mut out_c) = register(&registry, 9, 3, 4);

        let report = registry.broadcast(7, "hello", None);
        assert_eq!(report.delivered, 2);
        assert!(report.dropped.is_empty());

        assert_eq!(out_a.receiver.recv().await.unwrap(), "hello");
        assert_eq!(out_b.receiver.recv().await.unwrap(), "hello");
        assert!(out_c.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let registry = ConnectionRegistry::new();
        let (a, mut out_a) = register(&registry, 7, 1, 4);
        let (_b, mut out_b) = register(&registry, 7, 2, 4);

        let report = registry.broadcast(7, "hello", Some(a.id()));
        assert_eq!(report.delivered, 1);
        assert!(out_a.receiver.try_recv().is_err());
        assert_eq!(out_b.receiver.recv().await.unwrap(), "hello");
    }

    #[test]
    fn test_broadcast_to_empty_conversation() {
        let registry = ConnectionRegistry::new();
        let report = registry.broadcast(42, "hello", None);
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_slow_peer() {
        let registry = ConnectionRegistry::new();
        let (slow, slow_out) = register(&registry, 7, 1, 1);
        let (_fast, mut fast_out) = register(&registry, 7, 2, 8);

        let first = registry.broadcast(7, "one", None);
        assert_eq!(first.delivered, 2);

        // Nobody drains the slow queue
        let second = registry.broadcast(7, "two", None);
        assert_eq!(second.delivered, 1);
        assert_eq!(second.dropped, vec![slow.id()]);
        assert!(!registry.contains(7, slow.id()));
        assert_eq!(slow_out.closer.reason(), Some(CloseReason::QueueFull));

        assert_eq!(fast_out.receiver.recv().await.unwrap(), "one");
        assert_eq!(fast_out.receiver.recv().await.unwrap(), "two");

        // Later broadcasts no longer try the dropped peer
        let third = registry.broadcast(7, "three", None);
        assert_eq!(third.delivered, 1);
        assert!(third.dropped.is_empty());
    }

    #[test]
    fn test_closed_queue_is_pruned() {
        let registry = ConnectionRegistry::new();
        let (conn, outbound) = register(&registry, 7, 1, 4);
        drop(outbound);

        let report = registry.broadcast(7, "hello", None);
        assert_eq!(report.delivered, 0);
        assert_eq!(report.dropped, vec![conn.id()]);
        assert_eq!(registry.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_evict_user_closes_only_their_connections() {
        let registry = ConnectionRegistry::new();
        let (tab1, tab1_out) = register(&registry, 7, 2, 4);
        let (tab2, tab2_out) = register(&registry, 7, 2, 4);
        let (_stay, mut stay_out) = register(&registry, 7, 1, 4);
        let (elsewhere, _elsewhere_out) = register(&registry, 9, 2, 4);

        assert_eq!(registry.evict_user(7, 2, CloseReason::Removed), 2);
        assert!(!registry.contains(7, tab1.id()));
        assert!(!registry.contains(7, tab2.id()));
        assert_eq!(tab1_out.closer.reason(), Some(CloseReason::Removed));
        assert_eq!(tab2_out.closer.reason(), Some(CloseReason::Removed));

        // Other conversations of the same user are untouched
        assert!(registry.contains(9, elsewhere.id()));
        assert!(!elsewhere.is_closed());

        let report = registry.broadcast(7, "after", None);
        assert_eq!(report.delivered, 1);
        assert_eq!(stay_out.receiver.recv().await.unwrap(), "after");

        assert_eq!(registry.evict_user(7, 2, CloseReason::Removed), 0);
        assert_eq!(registry.evict_user(7, 1, CloseReason::Removed), 1);
        assert_eq!(registry.connection_count(7), 0);
        assert_eq!(registry.entry_count(), 1);
    }

    #[test]
    fn test_totals() {
        let registry = ConnectionRegistry::new();
        let (_a, _oa) = register(&registry, 7, 1, 4);
        let (_b, _ob) = register(&registry, 7, 2, 4);
        let (_c, _oc) = register(&registry, 9, 1, 4);

        assert_eq!(registry.connection_count(7), 2);
        assert_eq!(registry.connection_count(8), 0);
        assert_eq!(registry.entry_count(), 2);
        assert_eq!(registry.total_connections(), 3);
    }

    #[test]
    fn test_close_all() {
        let registry = ConnectionRegistry::new();
        let (a, _oa) = register(&registry, 7, 1, 4);
        let (b, _ob) = register(&registry, 9, 2, 4);

        registry.close_all(CloseReason::Shutdown);
        assert!(a.is_closed());
        assert!(b.is_closed());
    }
}
