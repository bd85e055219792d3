use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use parley_types::events::ServerEvent;
use parley_types::models::Identity;

use crate::presence::ConnectionHandle;

#[derive(Clone)]
struct Member {
    identity: Identity,
    handle: ConnectionHandle,
}

/// Live channel subscriptions: channel_id -> (user_id -> member).
/// Each channel lives in its own map shard, so joins and leaves on
/// different channels do not contend.
#[derive(Clone)]
pub struct RoomMembership {
    channels: Arc<DashMap<Uuid, HashMap<Uuid, Member>>>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
        }
    }

    /// Subscribe a connection to a channel. Returns false if the user was
    /// already subscribed; in that case nobody is notified.
    pub fn join(&self, identity: &Identity, channel_id: Uuid, handle: &ConnectionHandle) -> bool {
        let mut members = self.channels.entry(channel_id).or_default();

        if let Some(existing) = members.get_mut(&identity.id) {
            // Same user on a newer connection: follow the new handle quietly.
            existing.handle = handle.clone();
            return false;
        }

        let event = ServerEvent::MemberJoined {
            identity: identity.clone(),
            channel_id,
        };
        for member in members.values() {
            member.handle.send(event.clone());
        }

        members.insert(
            identity.id,
            Member {
                identity: identity.clone(),
                handle: handle.clone(),
            },
        );
        true
    }

    /// Unsubscribe a user. Returns false (and notifies nobody) if they were not subscribed.
    pub fn leave(&self, user_id: Uuid, channel_id: Uuid) -> bool {
        {
            let Some(mut members) = self.channels.get_mut(&channel_id) else {
                return false;
            };
            let Some(removed) = members.remove(&user_id) else {
                return false;
            };
            notify_left(&members, &removed.identity, channel_id);
        }

        self.channels
            .remove_if(&channel_id, |_, members| members.is_empty());
        true
    }

    /// Drop every subscription owned by connection `conn_id`. Returns the
    /// channels that were left.
    pub fn leave_all(&self, user_id: Uuid, conn_id: Uuid) -> Vec<Uuid> {
        let mut left = Vec::new();

        for mut channel in self.channels.iter_mut() {
            let channel_id = *channel.key();
            let members = channel.value_mut();

            let owned = members
                .get(&user_id)
                .is_some_and(|m| m.handle.conn_id() == conn_id);
            if !owned {
                continue;
            }

            if let Some(removed) = members.remove(&user_id) {
                notify_left(members, &removed.identity, channel_id);
                left.push(channel_id);
            }
        }

        self.channels.retain(|_, members| !members.is_empty());
        left
    }

    /// Handles of everyone subscribed to the channel right now.
    pub fn members_of(&self, channel_id: Uuid) -> Vec<ConnectionHandle> {
        self.channels
            .get(&channel_id)
            .map(|members| members.values().map(|m| m.handle.clone()).collect())
            .unwrap_or_default()
    }

    /// Handles of every subscriber except `user_id`.
    pub fn members_except(&self, channel_id: Uuid, user_id: Uuid) -> Vec<ConnectionHandle> {
        self.channels
            .get(&channel_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|(id, _)| **id != user_id)
                    .map(|(_, m)| m.handle.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn member_ids(&self, channel_id: Uuid) -> Vec<Uuid> {
        self.channels
            .get(&channel_id)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, user_id: Uuid, channel_id: Uuid) -> bool {
        self.channels
            .get(&channel_id)
            .is_some_and(|members| members.contains_key(&user_id))
    }
}

impl Default for RoomMembership {
    fn default() -> Self {
        Self::new()
    }
}

fn notify_left(members: &HashMap<Uuid, Member>, identity: &Identity, channel_id: Uuid) {
    let event = ServerEvent::MemberLeft {
        identity: identity.clone(),
        channel_id,
    };
    for member in members.values() {
        member.handle.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn user(n: u128) -> Identity {
        Identity::new(Uuid::from_u128(n), format!("user{}", n))
    }

    #[test]
    fn test_join_notifies_others_once() {
        let rooms = RoomMembership::new();
        let channel = Uuid::from_u128(100);
        let (a, mut a_rx) = ConnectionHandle::new();
        let (b, mut b_rx) = ConnectionHandle::new();

        assert!(rooms.join(&user(1), channel, &a));
        assert!(rooms.join(&user(2), channel, &b));
        assert!(!rooms.join(&user(2), channel, &b));

        assert!(matches!(
            a_rx.try_recv(),
            Ok(ServerEvent::MemberJoined { identity, .. }) if identity.id == Uuid::from_u128(2)
        ));
        assert!(a_rx.try_recv().is_err());
        // The joiner is never told about their own join.
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn test_leave_notifies_remaining() {
        let rooms = RoomMembership::new();
        let channel = Uuid::from_u128(100);
        let (a, mut a_rx) = ConnectionHandle::new();
        let (b, mut b_rx) = ConnectionHandle::new();

        rooms.join(&user(1), channel, &a);
        rooms.join(&user(2), channel, &b);
        while a_rx.try_recv().is_ok() {}

        assert!(rooms.leave(Uuid::from_u128(2), channel));
        assert!(!rooms.leave(Uuid::from_u128(2), channel));
        assert!(matches!(a_rx.try_recv(), Ok(ServerEvent::MemberLeft { .. })));
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());
        assert_eq!(rooms.member_ids(channel), vec![Uuid::from_u128(1)]);
    }

    #[test]
    fn test_membership_tracks_last_action() {
        let rooms = RoomMembership::new();
        let channel = Uuid::from_u128(100);
        let handles: Vec<_> = (0..4).map(|_| ConnectionHandle::new()).collect();

        // (user, join?) in order; the final state is the last action per user
        let script = [(0, true), (1, true), (0, false), (2, true), (1, true), (3, true), (2, false), (0, true)];
        for (n, join) in script {
            if join {
                rooms.join(&user(n), channel, &handles[n as usize].0);
            } else {
                rooms.leave(Uuid::from_u128(n), channel);
            }
        }

        let members: HashSet<Uuid> = rooms.member_ids(channel).into_iter().collect();
        let expected: HashSet<Uuid> = [0, 1, 3].into_iter().map(Uuid::from_u128).collect();
        assert_eq!(members, expected);
        assert_eq!(rooms.members_of(channel).len(), 3);
    }

    #[test]
    fn test_leave_all_only_for_owning_connection() {
        let rooms = RoomMembership::new();
        let (old, _old_rx) = ConnectionHandle::new();
        let (new, _new_rx) = ConnectionHandle::new();
        let c1 = Uuid::from_u128(100);
        let c2 = Uuid::from_u128(200);

        rooms.join(&user(1), c1, &old);
        rooms.join(&user(1), c2, &old);
        // Newer session re-joins c2 only
        rooms.join(&user(1), c2, &new);

        let mut left = rooms.leave_all(Uuid::from_u128(1), old.conn_id());
        left.sort();
        assert_eq!(left, vec![c1]);
        assert!(rooms.is_member(Uuid::from_u128(1), c2));
        assert!(!rooms.is_member(Uuid::from_u128(1), c1));
        assert!(rooms.member_ids(c1).is_empty());
    }
}
