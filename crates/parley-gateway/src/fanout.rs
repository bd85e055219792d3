use tracing::{debug, warn};
use uuid::Uuid;

use parley_types::events::ServerEvent;
use parley_types::models::{FileRef, Identity, Message, MessageKind, NewMessage};

use crate::error::{HubError, HubResult};
use crate::hub::{Hub, Session};
use crate::store;

/// Lock key for message ordering: one per channel, one per direct conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FanoutKey {
    Channel(Uuid),
    Direct(Uuid, Uuid),
}

impl FanoutKey {
    /// Both participants map to the same key regardless of who sends.
    pub fn direct(a: Uuid, b: Uuid) -> Self {
        if a <= b {
            Self::Direct(a, b)
        } else {
            Self::Direct(b, a)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Channel(Uuid),
    Direct(Uuid),
}

/// A message as submitted by a client, before validation.
/// Largest file size the store can record (SQLite INTEGER).
const MAX_FILE_SIZE: u64 = i64::MAX as u64;

#[derive(Debug, Clone, Default)]
pub struct Draft {
    pub channel_id: Option<Uuid>,
    pub recipient_id: Option<Uuid>,
    pub content: Option<String>,
    pub kind: MessageKind,
    pub file: Option<FileRef>,
}

impl Draft {
    /// Checks there is exactly one target and something to send.
    pub fn validate(self, sender: Identity) -> HubResult<(Target, NewMessage)> {
        let target = match (self.channel_id, self.recipient_id) {
            (Some(channel_id), None) if !channel_id.is_nil() => Target::Channel(channel_id),
            (None, Some(recipient_id)) if !recipient_id.is_nil() => Target::Direct(recipient_id),
            (Some(_), Some(_)) => {
                return Err(HubError::validation(
                    "a message targets a channel or a recipient, not both",
                ));
            }
            _ => return Err(HubError::validation("message has no channel or recipient")),
        };

        let content = self
            .content
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        let file = self.file.filter(|f| !f.url.trim().is_empty());
        if file.as_ref().and_then(|f| f.size).is_some_and(|size| size > MAX_FILE_SIZE) {
            return Err(HubError::validation("file size out of range"));
        }
        if content.is_none() && file.is_none() {
            return Err(HubError::validation("message has no content or file"));
        }

        let (channel_id, recipient_id) = match target {
            Target::Channel(id) => (Some(id), None),
            Target::Direct(id) => (None, Some(id)),
        };

        Ok((
            target,
            NewMessage {
                sender,
                channel_id,
                recipient_id,
                content,
                file,
                kind: self.kind,
            },
        ))
    }
}

impl Hub {
    /// Persist a message and publish it. Channel messages go to every current
    /// subscriber except the sender; direct messages go to the recipient and
    /// are echoed back to the sending connection.
    pub async fn send_message(&self, session: &Session, draft: Draft) -> HubResult<Message> {
        let sender_id = session.user_id();
        let (target, new) = draft.validate(session.identity.clone())?;

        match target {
            Target::Channel(channel_id) => {
                let message = {
                    let _order = self.inner.fanout_locks.lock(FanoutKey::Channel(channel_id)).await;

                    self.ensure_channel(channel_id).await?;
                    let message = self.persist(new).await?;

                    let message_id = message.id;
                    if store::blocking(&self.inner.store, "set_channel_last_message", move |s| {
                        s.set_channel_last_message(channel_id, message_id)
                    })
                    .await
                    .is_err()
                    {
                        warn!("Last message of channel {} not updated to {}", channel_id, message_id);
                    }

                    let audience = self.inner.rooms.members_except(channel_id, sender_id);
                    debug!(
                        "Message {} in channel {} -> {} subscriber(s)",
                        message.id,
                        channel_id,
                        audience.len()
                    );
                    for handle in &audience {
                        handle.send(ServerEvent::MessagePublished(message.clone()));
                    }
                    message
                };

                self.inner.typing.stop(sender_id, Some(channel_id)).await;
                Ok(message)
            }

            Target::Direct(recipient_id) => {
                let _order = self
                    .inner
                    .fanout_locks
                    .lock(FanoutKey::direct(sender_id, recipient_id))
                    .await;

                let message = self.persist(new).await?;

                if recipient_id != sender_id {
                    match self.inner.presence.handle_of(recipient_id).await {
                        Some(handle) => {
                            handle.send(ServerEvent::MessagePublished(message.clone()));
                        }
                        None => debug!(
                            "Direct message {} stored for offline user {}",
                            message.id, recipient_id
                        ),
                    }
                }
                session
                    .handle
                    .send(ServerEvent::MessagePublished(message.clone()));

                Ok(message)
            }
        }
    }

    async fn persist(&self, new: NewMessage) -> HubResult<Message> {
        store::blocking(&self.inner.store, "create_message", move |s| {
            s.create_message(new)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity::new(Uuid::from_u128(1), "alice")
    }

    fn text(content: &str) -> Option<String> {
        Some(content.to_string())
    }

    #[test]
    fn test_requires_exactly_one_target() {
        let none = Draft {
            content: text("hi"),
            ..Default::default()
        };
        assert!(matches!(none.validate(alice()), Err(HubError::Validation(_))));

        let both = Draft {
            channel_id: Some(Uuid::from_u128(10)),
            recipient_id: Some(Uuid::from_u128(2)),
            content: text("hi"),
            ..Default::default()
        };
        assert!(matches!(both.validate(alice()), Err(HubError::Validation(_))));

        let nil = Draft {
            recipient_id: Some(Uuid::nil()),
            content: text("hi"),
            ..Default::default()
        };
        assert!(matches!(nil.validate(alice()), Err(HubError::Validation(_))));
    }

    #[test]
    fn test_blank_content_without_file_rejected() {
        let blank = Draft {
            channel_id: Some(Uuid::from_u128(10)),
            content: text("   "),
            ..Default::default()
        };
        assert!(matches!(blank.validate(alice()), Err(HubError::Validation(_))));
    }

    #[test]
    fn test_file_only_message_accepted() {
        let draft = Draft {
            recipient_id: Some(Uuid::from_u128(2)),
            kind: MessageKind::File,
            file: Some(FileRef {
                url: "/uploads/report.pdf".into(),
                name: Some("report.pdf".into()),
                size: None,
            }),
            ..Default::default()
        };
        let (target, new) = draft.validate(alice()).unwrap();
        assert_eq!(target, Target::Direct(Uuid::from_u128(2)));
        assert!(new.content.is_none());
        assert_eq!(new.kind, MessageKind::File);
    }

    #[test]
    fn test_oversized_file_rejected() {
        let file = |size| FileRef {
            url: "/uploads/huge.bin".into(),
            name: None,
            size: Some(size),
        };
        let huge = Draft {
            channel_id: Some(Uuid::from_u128(10)),
            kind: MessageKind::File,
            file: Some(file(u64::MAX)),
            ..Default::default()
        };
        assert!(matches!(huge.validate(alice()), Err(HubError::Validation(_))));

        let largest = Draft {
            channel_id: Some(Uuid::from_u128(10)),
            kind: MessageKind::File,
            file: Some(file(i64::MAX as u64)),
            ..Default::default()
        };
        assert!(largest.validate(alice()).is_ok());
    }

    #[test]
    fn test_content_trimmed() {
        let draft = Draft {
            channel_id: Some(Uuid::from_u128(10)),
            content: text("  hi there \n"),
            ..Default::default()
        };
        let (_, new) = draft.validate(alice()).unwrap();
        assert_eq!(new.content.as_deref(), Some("hi there"));
        assert_eq!(new.channel_id, Some(Uuid::from_u128(10)));
    }

    #[test]
    fn test_direct_key_symmetric() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        assert_eq!(FanoutKey::direct(a, b), FanoutKey::direct(b, a));
    }
}
