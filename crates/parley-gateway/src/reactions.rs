use chrono::{SubsecRound, Utc};
use tracing::debug;
use uuid::Uuid;

use parley_types::events::ServerEvent;
use parley_types::models::Message;

use crate::error::{HubError, HubResult};
use crate::hub::{Hub, Session};
use crate::presence::ConnectionHandle;
use crate::store;

impl Hub {
    /// Add the (user, emoji) reaction if absent, remove it if present, then
    /// re-publish the message to its audience. Returns the updated message.
    pub async fn toggle_reaction(
        &self,
        session: &Session,
        message_id: Uuid,
        emoji: &str,
    ) -> HubResult<Message> {
        let emoji = emoji.trim().to_string();
        if emoji.is_empty() {
            return Err(HubError::validation("reaction emoji is empty"));
        }

        let user_id = session.user_id();
        let _guard = self.inner.message_locks.lock(message_id).await;

        let message = self.load_message(message_id).await?;
        let added = !message.has_reaction(user_id, &emoji);

        let stored_emoji = emoji.clone();
        if added {
            store::blocking(&self.inner.store, "append_reaction", move |s| {
                s.append_reaction(message_id, user_id, &stored_emoji)
            })
            .await?;
        } else {
            store::blocking(&self.inner.store, "remove_reaction", move |s| {
                s.remove_reaction(message_id, user_id, &stored_emoji)
            })
            .await?;
        }

        let updated = self.load_message(message_id).await?;
        debug!(
            "{} ({}) {} {} on message {}",
            session.identity.display_name,
            user_id,
            if added { "added" } else { "removed" },
            emoji,
            message_id
        );

        for handle in self.audience_of(&updated).await {
            handle.send(ServerEvent::MessagePublished(updated.clone()));
        }
        Ok(updated)
    }

    /// Record that the user has read a message. Only the first read for a
    /// user notifies the sender; returns whether this call recorded it.
    pub async fn mark_read(&self, session: &Session, message_id: Uuid) -> HubResult<bool> {
        let user_id = session.user_id();
        let _guard = self.inner.message_locks.lock(message_id).await;

        let message = self.load_message(message_id).await?;
        if message.is_read_by(user_id) {
            return Ok(false);
        }

        let inserted = store::blocking(&self.inner.store, "append_read_by", move |s| {
            s.append_read_by(message_id, user_id)
        })
        .await?;
        if !inserted {
            return Ok(false);
        }

        if let Some(handle) = self.inner.presence.handle_of(message.sender.id).await {
            handle.send(ServerEvent::ReadReceipt {
                message_id,
                identity: session.identity.clone(),
                read_at: Utc::now().trunc_subsecs(3),
            });
        }
        Ok(true)
    }

    async fn load_message(&self, message_id: Uuid) -> HubResult<Message> {
        store::blocking(&self.inner.store, "get_message", move |s| {
            s.get_message(message_id)
        })
        .await?
        .ok_or_else(|| HubError::message_not_found(message_id))
    }

    /// Channel subscribers for channel messages, both participants for direct
    /// messages, everyone online for messages with neither.
    async fn audience_of(&self, message: &Message) -> Vec<ConnectionHandle> {
        if let Some(channel_id) = message.channel_id {
            return self.inner.rooms.members_of(channel_id);
        }

        if let Some(recipient_id) = message.recipient_id {
            let mut handles = Vec::with_capacity(2);
            if let Some(h) = self.inner.presence.handle_of(message.sender.id).await {
                handles.push(h);
            }
            if recipient_id != message.sender.id {
                if let Some(h) = self.inner.presence.handle_of(recipient_id).await {
                    handles.push(h);
                }
            }
            return handles;
        }

        self.inner.presence.handles().await
    }
}
