use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_types::events::{ClientCommand, ServerEvent};
use parley_types::models::{Channel, Identity};

use crate::error::{HubError, HubResult};
use crate::fanout::{Draft, FanoutKey};
use crate::keyed::KeyedLocks;
use crate::presence::{ConnectionHandle, PresenceDirectory};
use crate::rooms::RoomMembership;
use crate::store::{self, Store};
use crate::typing::TypingAggregator;

/// Hub tunables.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long a typing indicator lives without a refresh.
    pub typing_expiry: Duration,
    /// Capacity of each connection's inbound command queue.
    pub inbound_queue: usize,
    /// Ping interval; two missed Pongs drop the connection.
    pub heartbeat_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            typing_expiry: Duration::from_millis(3000),
            inbound_queue: 64,
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// One admitted connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: Identity,
    pub handle: ConnectionHandle,
}

impl Session {
    pub fn user_id(&self) -> Uuid {
        self.identity.id
    }

    pub fn conn_id(&self) -> Uuid {
        self.handle.conn_id()
    }
}

/// The live-connection coordination core. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    pub(crate) inner: Arc<HubInner>,
}

pub(crate) struct HubInner {
    pub(crate) config: HubConfig,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) presence: PresenceDirectory,
    pub(crate) rooms: RoomMembership,
    pub(crate) typing: TypingAggregator,
    /// Serializes persist+publish per channel / direct conversation.
    pub(crate) fanout_locks: KeyedLocks<FanoutKey>,
    /// Serializes reaction and read-receipt updates per message.
    pub(crate) message_locks: KeyedLocks<Uuid>,
    presence_writes: mpsc::UnboundedSender<PresenceWrite>,
}

struct PresenceWrite {
    identity: Identity,
    online: bool,
    last_seen: Option<DateTime<Utc>>,
}

impl Hub {
    pub fn new(store: Arc<dyn Store>, config: HubConfig) -> Self {
        let presence = PresenceDirectory::new();
        let rooms = RoomMembership::new();
        let typing = TypingAggregator::new(rooms.clone(), presence.clone(), config.typing_expiry);
        let presence_writes = spawn_presence_writer(store.clone());

        Self {
            inner: Arc::new(HubInner {
                config,
                store,
                presence,
                rooms,
                typing,
                fanout_locks: KeyedLocks::new(),
                message_locks: KeyedLocks::new(),
                presence_writes,
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn presence(&self) -> &PresenceDirectory {
        &self.inner.presence
    }

    pub fn rooms(&self) -> &RoomMembership {
        &self.inner.rooms
    }

    pub fn typing(&self) -> &TypingAggregator {
        &self.inner.typing
    }

    /// Admit an authenticated identity. The first event on the returned
    /// receiver is `ready`, followed by the presence snapshot.
    pub async fn connect(&self, identity: Identity) -> (Session, mpsc::UnboundedReceiver<ServerEvent>) {
        let (handle, rx) = ConnectionHandle::new();
        handle.send(ServerEvent::Ready {
            identity: identity.clone(),
        });

        if let Some(displaced) = self
            .inner
            .presence
            .register(identity.clone(), handle.clone())
            .await
        {
            info!(
                "{} ({}) replaced session {}",
                identity.display_name,
                identity.id,
                displaced.conn_id()
            );
        }
        self.persist_presence(identity.clone(), true, None);

        (Session { identity, handle }, rx)
    }

    /// Apply a command, reporting any failure to the originating connection only.
    pub async fn dispatch(&self, session: &Session, cmd: ClientCommand) {
        if let Err(e) = self.handle_command(session, cmd).await {
            match &e {
                HubError::Store(_) => {} // already logged where it happened
                _ => debug!(
                    "{} ({}) command rejected: {}",
                    session.identity.display_name,
                    session.user_id(),
                    e
                ),
            }
            session.handle.send(e.to_event());
        }
    }

    pub async fn handle_command(&self, session: &Session, cmd: ClientCommand) -> HubResult<()> {
        match cmd {
            ClientCommand::JoinChannel { channel_id } => {
                self.join_channel(session, channel_id).await
            }

            ClientCommand::LeaveChannel { channel_id } => {
                self.leave_channel(session, channel_id).await
            }

            ClientCommand::SendMessage {
                channel_id,
                content,
                kind,
                file,
            } => {
                let draft = Draft {
                    channel_id,
                    recipient_id: None,
                    content,
                    kind,
                    file,
                };
                self.send_message(session, draft).await.map(|_| ())
            }

            ClientCommand::DirectMessage {
                recipient_id,
                content,
                kind,
                file,
            } => {
                let draft = Draft {
                    channel_id: None,
                    recipient_id: Some(recipient_id),
                    content,
                    kind,
                    file,
                };
                self.send_message(session, draft).await.map(|_| ())
            }

            ClientCommand::TypingStart { channel_id } => {
                self.ensure_typing_scope(session, channel_id).await?;
                self.inner.typing.start(&session.identity, channel_id).await;
                Ok(())
            }

            ClientCommand::TypingStop { channel_id } => {
                self.ensure_typing_scope(session, channel_id).await?;
                self.inner.typing.stop(session.user_id(), channel_id).await;
                Ok(())
            }

            ClientCommand::ToggleReaction { message_id, emoji } => self
                .toggle_reaction(session, message_id, &emoji)
                .await
                .map(|_| ()),

            ClientCommand::MarkRead { message_id } => {
                self.mark_read(session, message_id).await.map(|_| ())
            }
        }
    }

    pub async fn join_channel(&self, session: &Session, channel_id: Uuid) -> HubResult<()> {
        // A displaced connection must not pull subscriptions back to its handle.
        if !self
            .inner
            .presence
            .is_current(session.user_id(), session.conn_id())
            .await
        {
            return Err(HubError::Auth("session replaced by a newer connection".into()));
        }
        let channel = self.ensure_channel(channel_id).await?;

        if self
            .inner
            .rooms
            .join(&session.identity, channel_id, &session.handle)
        {
            info!(
                "{} ({}) joined channel {} ({})",
                session.identity.display_name,
                session.user_id(),
                channel.name,
                channel_id
            );
        }
        Ok(())
    }

    pub async fn leave_channel(&self, session: &Session, channel_id: Uuid) -> HubResult<()> {
        let channel = self.ensure_channel(channel_id).await?;

        if self.inner.rooms.leave(session.user_id(), channel_id) {
            info!(
                "{} ({}) left channel {} ({})",
                session.identity.display_name,
                session.user_id(),
                channel.name,
                channel_id
            );
            self.inner
                .typing
                .stop(session.user_id(), Some(channel_id))
                .await;
        }
        Ok(())
    }

    /// Tear down a connection: subscriptions, then typing state, then presence,
    /// so nobody ever sees an offline user still typing or subscribed.
    pub async fn disconnect(&self, session: &Session) {
        let user_id = session.user_id();
        let conn_id = session.conn_id();

        let left = self.inner.rooms.leave_all(user_id, conn_id);

        // A newer session for the same user keeps its typing state.
        if self.inner.presence.is_current(user_id, conn_id).await {
            self.inner.typing.clear_identity(user_id).await;
        }

        match self.inner.presence.deregister(user_id, conn_id).await {
            Some(last_seen) => {
                self.persist_presence(session.identity.clone(), false, Some(last_seen));
                info!(
                    "{} ({}) disconnected, left {} channel(s)",
                    session.identity.display_name,
                    user_id,
                    left.len()
                );
            }
            None => debug!(
                "{} ({}) stale connection {} closed",
                session.identity.display_name, user_id, conn_id
            ),
        }
    }

    pub(crate) async fn ensure_channel(&self, channel_id: Uuid) -> HubResult<Channel> {
        store::blocking(&self.inner.store, "get_channel", move |s| {
            s.get_channel(channel_id)
        })
        .await?
        .ok_or_else(|| HubError::channel_not_found(channel_id))
    }

    /// A channel scope must exist; subscribers skip the store lookup.
    async fn ensure_typing_scope(&self, session: &Session, scope: Option<Uuid>) -> HubResult<()> {
        match scope {
            Some(channel_id) if !self.inner.rooms.is_member(session.user_id(), channel_id) => {
                self.ensure_channel(channel_id).await.map(|_| ())
            }
            _ => Ok(()),
        }
    }

    /// Queue a presence write. Writes are applied in order by a background
    /// task, so a slow store never holds up the connection.
    fn persist_presence(&self, identity: Identity, online: bool, last_seen: Option<DateTime<Utc>>) {
        let _ = self.inner.presence_writes.send(PresenceWrite {
            identity,
            online,
            last_seen,
        });
    }
}

fn spawn_presence_writer(store: Arc<dyn Store>) -> mpsc::UnboundedSender<PresenceWrite> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PresenceWrite>();
    tokio::spawn(async move {
        while let Some(write) = rx.recv().await {
            let user_id = write.identity.id;
            let online = write.online;
            if store::blocking(&store, "record_presence", move |s| {
                s.record_presence(&write.identity, write.online, write.last_seen)
            })
            .await
            .is_err()
            {
                warn!("Presence for {} not persisted (online={})", user_id, online);
            }
        }
    });
    tx
}
