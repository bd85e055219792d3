use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::trace;
use uuid::Uuid;

use parley_types::events::ServerEvent;
use parley_types::models::Identity;

use crate::presence::PresenceDirectory;
use crate::rooms::RoomMembership;

/// Where a user is typing: a channel, or the global lobby (`None`).
pub type TypingScope = Option<Uuid>;

struct TypingEntry {
    identity: Identity,
    /// Bumped on every start; an expiry timer only removes the entry it armed.
    generation: u64,
    timer: AbortHandle,
}

type ScopeState = HashMap<Uuid, TypingEntry>;

/// Ephemeral "who is typing" state with per-(scope, user) expiry timers.
#[derive(Clone)]
pub struct TypingAggregator {
    inner: Arc<TypingInner>,
}

struct TypingInner {
    scopes: DashMap<TypingScope, Arc<Mutex<ScopeState>>>,
    rooms: RoomMembership,
    presence: PresenceDirectory,
    window: Duration,
    next_generation: AtomicU64,
}

impl TypingAggregator {
    pub fn new(rooms: RoomMembership, presence: PresenceDirectory, window: Duration) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                scopes: DashMap::new(),
                rooms,
                presence,
                window,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Insert or refresh a typing entry and re-arm its expiry timer.
    pub async fn start(&self, identity: &Identity, scope: TypingScope) {
        let slot = self.scope(scope);
        let mut typing = slot.lock().await;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let timer = self.arm(identity.id, scope, generation);
        let previous = typing.insert(
            identity.id,
            TypingEntry {
                identity: identity.clone(),
                generation,
                timer,
            },
        );
        if let Some(previous) = previous {
            previous.timer.abort();
        }

        self.publish(scope, &typing, identity.id).await;
    }

    /// Remove a typing entry. Returns false, without broadcasting, if there was none.
    pub async fn stop(&self, user_id: Uuid, scope: TypingScope) -> bool {
        let Some(slot) = self.existing_scope(scope) else {
            return false;
        };
        {
            let mut typing = slot.lock().await;
            let Some(entry) = typing.remove(&user_id) else {
                return false;
            };
            entry.timer.abort();

            self.publish(scope, &typing, user_id).await;
        }
        drop(slot);
        self.prune(scope);
        true
    }

    /// Remove the user from every scope, rebroadcasting each one that changed.
    pub async fn clear_identity(&self, user_id: Uuid) -> Vec<TypingScope> {
        let slots: Vec<(TypingScope, Arc<Mutex<ScopeState>>)> = self
            .inner
            .scopes
            .iter()
            .map(|s| (*s.key(), s.value().clone()))
            .collect();

        let mut cleared = Vec::new();
        for (scope, slot) in slots {
            let mut typing = slot.lock().await;
            if let Some(entry) = typing.remove(&user_id) {
                entry.timer.abort();
                self.publish(scope, &typing, user_id).await;
                cleared.push(scope);
            }
        }
        for scope in &cleared {
            self.prune(*scope);
        }
        cleared
    }

    /// Current typing set of a scope, in broadcast order.
    pub async fn typing_in(&self, scope: TypingScope) -> Vec<Identity> {
        match self.existing_scope(scope) {
            Some(slot) => snapshot_of(&*slot.lock().await),
            None => Vec::new(),
        }
    }

    async fn expire(&self, user_id: Uuid, scope: TypingScope, generation: u64) {
        let Some(slot) = self.existing_scope(scope) else {
            return;
        };
        {
            let mut typing = slot.lock().await;

            // A fresher start or an explicit stop got here first.
            if typing.get(&user_id).map(|e| e.generation) != Some(generation) {
                return;
            }
            typing.remove(&user_id);
            trace!("Typing entry for {} in {:?} expired", user_id, scope);

            self.publish(scope, &typing, user_id).await;
        }
        drop(slot);
        self.prune(scope);
    }

    /// Drop a scope nobody is typing in. Only when the map holds the sole
    /// reference, so a concurrent `start` never writes into a detached set.
    fn prune(&self, scope: TypingScope) {
        self.inner.scopes.remove_if(&scope, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|typing| typing.is_empty())
        });
    }

    fn arm(&self, user_id: Uuid, scope: TypingScope, generation: u64) -> AbortHandle {
        let this = self.clone();
        let window = self.inner.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            this.expire(user_id, scope, generation).await;
        })
        .abort_handle()
    }

    /// Sends the scope's typing set to everyone but `actor`. Called with the
    /// scope lock held so snapshots leave in mutation order.
    async fn publish(&self, scope: TypingScope, typing: &ScopeState, actor: Uuid) {
        let audience = match scope {
            Some(channel_id) => self.inner.rooms.members_except(channel_id, actor),
            None => self.inner.presence.handles_except(actor).await,
        };

        let event = ServerEvent::TypingSnapshot {
            channel_id: scope,
            users: snapshot_of(typing),
        };
        for handle in audience {
            handle.send(event.clone());
        }
    }

    fn scope(&self, scope: TypingScope) -> Arc<Mutex<ScopeState>> {
        Arc::clone(&*self.inner.scopes.entry(scope).or_default())
    }

    fn existing_scope(&self, scope: TypingScope) -> Option<Arc<Mutex<ScopeState>>> {
        self.inner.scopes.get(&scope).map(|s| s.value().clone())
    }
}

fn snapshot_of(typing: &ScopeState) -> Vec<Identity> {
    let mut users: Vec<Identity> = typing.values().map(|e| e.identity.clone()).collect();
    users.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id)));
    users
}
