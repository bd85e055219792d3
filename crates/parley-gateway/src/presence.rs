use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use parley_types::events::ServerEvent;
use parley_types::models::{Identity, PresenceInfo};

/// Outbound event queue of one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    /// Create a handle with a fresh connection id. Returns (handle, receiver).
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conn_id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Queue an event. Returns false if the connection is already gone.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

struct PresenceEntry {
    identity: Identity,
    /// `Some` while online.
    handle: Option<ConnectionHandle>,
    last_seen: Option<DateTime<Utc>>,
}

/// Who is online, and how to reach them. Entries are never removed; going
/// offline only clears the handle and stamps `last_seen`.
#[derive(Clone)]
pub struct PresenceDirectory {
    entries: Arc<RwLock<HashMap<Uuid, PresenceEntry>>>,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Mark `identity` online on `handle`, replacing any previous session.
    /// Returns the displaced handle, if there was one.
    pub async fn register(
        &self,
        identity: Identity,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let mut entries = self.entries.write().await;

        let displaced = match entries.get_mut(&identity.id) {
            Some(entry) => {
                entry.identity = identity;
                entry.handle.replace(handle)
            }
            None => {
                entries.insert(
                    identity.id,
                    PresenceEntry {
                        identity,
                        handle: Some(handle),
                        last_seen: None,
                    },
                );
                None
            }
        };

        broadcast_snapshot(&entries);
        displaced
    }

    /// Mark a user offline, but only if `conn_id` still owns the session.
    /// Returns the time stamped as last seen.
    pub async fn deregister(&self, user_id: Uuid, conn_id: Uuid) -> Option<DateTime<Utc>> {
        let mut entries = self.entries.write().await;

        let entry = entries.get_mut(&user_id)?;
        if entry.handle.as_ref().map(ConnectionHandle::conn_id) != Some(conn_id) {
            // A newer connection has taken over
            return None;
        }

        let now = Utc::now();
        entry.handle = None;
        entry.last_seen = Some(now);

        broadcast_snapshot(&entries);
        Some(now)
    }

    pub async fn handle_of(&self, user_id: Uuid) -> Option<ConnectionHandle> {
        self.entries
            .read()
            .await
            .get(&user_id)
            .and_then(|e| e.handle.clone())
    }

    /// Handles of every online user.
    pub async fn handles(&self) -> Vec<ConnectionHandle> {
        self.entries
            .read()
            .await
            .values()
            .filter_map(|e| e.handle.clone())
            .collect()
    }

    pub async fn handles_except(&self, user_id: Uuid) -> Vec<ConnectionHandle> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(id, _)| **id != user_id)
            .filter_map(|(_, e)| e.handle.clone())
            .collect()
    }

    pub async fn is_current(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        self.entries
            .read()
            .await
            .get(&user_id)
            .and_then(|e| e.handle.as_ref())
            .is_some_and(|h| h.conn_id() == conn_id)
    }

    pub async fn last_seen(&self, user_id: Uuid) -> Option<DateTime<Utc>> {
        self.entries.read().await.get(&user_id).and_then(|e| e.last_seen)
    }

    pub async fn online_count(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.handle.is_some())
            .count()
    }
}

impl Default for PresenceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot_of(entries: &HashMap<Uuid, PresenceEntry>) -> Vec<PresenceInfo> {
    let mut users: Vec<PresenceInfo> = entries
        .values()
        .map(|e| PresenceInfo {
            identity: e.identity.clone(),
            online: e.handle.is_some(),
            last_seen: e.last_seen,
        })
        .collect();
    users.sort_by(|a, b| {
        a.identity
            .display_name
            .cmp(&b.identity.display_name)
            .then(a.identity.id.cmp(&b.identity.id))
    });
    users
}

/// Called with the write lock held, so broadcasts go out in mutation order.
fn broadcast_snapshot(entries: &HashMap<Uuid, PresenceEntry>) {
    let users = snapshot_of(entries);
    for handle in entries.values().filter_map(|e| e.handle.as_ref()) {
        handle.send(ServerEvent::PresenceSnapshot {
            users: users.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(n: u128, name: &str) -> Identity {
        Identity::new(Uuid::from_u128(n), name)
    }

    fn next_snapshot(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<PresenceInfo> {
        match rx.try_recv() {
            Ok(ServerEvent::PresenceSnapshot { users }) => users,
            other => panic!("expected presence snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_broadcasts_to_everyone() {
        let presence = PresenceDirectory::new();
        let (a, mut a_rx) = ConnectionHandle::new();
        let (b, mut b_rx) = ConnectionHandle::new();

        presence.register(user(1, "alice"), a).await;
        assert_eq!(next_snapshot(&mut a_rx).len(), 1);

        presence.register(user(2, "bob"), b).await;
        let seen_by_alice = next_snapshot(&mut a_rx);
        let seen_by_bob = next_snapshot(&mut b_rx);
        assert_eq!(seen_by_alice, seen_by_bob);
        assert!(seen_by_alice.iter().all(|u| u.online));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deregister_keeps_entry() {
        let presence = PresenceDirectory::new();
        let (a, _a_rx) = ConnectionHandle::new();
        let (b, mut b_rx) = ConnectionHandle::new();
        let a_conn = a.conn_id();

        presence.register(user(1, "alice"), a).await;
        presence.register(user(2, "bob"), b).await;
        while b_rx.try_recv().is_ok() {}

        let stamped = presence.deregister(Uuid::from_u128(1), a_conn).await;
        assert!(stamped.is_some());
        assert_eq!(presence.last_seen(Uuid::from_u128(1)).await, stamped);

        let users = next_snapshot(&mut b_rx);
        let alice = users.iter().find(|u| u.identity.display_name == "alice").unwrap();
        assert!(!alice.online);
        assert_eq!(alice.last_seen, stamped);
        assert_eq!(presence.online_count().await, 1);
    }

    #[tokio::test]
    async fn test_stale_connection_cannot_deregister() {
        let presence = PresenceDirectory::new();
        let (old, _old_rx) = ConnectionHandle::new();
        let (new, _new_rx) = ConnectionHandle::new();
        let old_conn = old.conn_id();
        let new_conn = new.conn_id();

        presence.register(user(1, "alice"), old).await;
        let displaced = presence.register(user(1, "alice"), new).await;
        assert_eq!(displaced.map(|h| h.conn_id()), Some(old_conn));

        assert!(presence.deregister(Uuid::from_u128(1), old_conn).await.is_none());
        assert!(presence.is_current(Uuid::from_u128(1), new_conn).await);
        assert_eq!(presence.online_count().await, 1);
    }
}
