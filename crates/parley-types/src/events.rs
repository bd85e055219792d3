use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{FileRef, Identity, Message, MessageKind, PresenceInfo};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Server confirms successful authentication
    Ready { identity: Identity },

    /// Full presence list, sent to everyone after any connect/disconnect
    PresenceSnapshot { users: Vec<PresenceInfo> },

    /// A message was created, or its reactions changed
    MessagePublished(Message),

    /// Everyone currently typing in a channel (or the lobby when `channel_id` is None)
    TypingSnapshot {
        channel_id: Option<Uuid>,
        users: Vec<Identity>,
    },

    MemberJoined { identity: Identity, channel_id: Uuid },

    MemberLeft { identity: Identity, channel_id: Uuid },

    /// Delivered to the sender of `message_id` the first time `identity` reads it
    ReadReceipt {
        message_id: Uuid,
        identity: Identity,
        read_at: DateTime<Utc>,
    },

    /// A command from this connection failed. Never broadcast.
    OperationError { code: String, message: String },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    JoinChannel { channel_id: Uuid },

    LeaveChannel { channel_id: Uuid },

    /// Post to a channel. `channel_id` is required; it is optional on the
    /// wire so a missing target surfaces as a validation error.
    SendMessage {
        #[serde(default)]
        channel_id: Option<Uuid>,
        #[serde(default)]
        content: Option<String>,
        #[serde(default, rename = "type")]
        kind: MessageKind,
        #[serde(default)]
        file: Option<FileRef>,
    },

    DirectMessage {
        recipient_id: Uuid,
        #[serde(default)]
        content: Option<String>,
        #[serde(default, rename = "type")]
        kind: MessageKind,
        #[serde(default)]
        file: Option<FileRef>,
    },

    TypingStart {
        #[serde(default)]
        channel_id: Option<Uuid>,
    },

    TypingStop {
        #[serde(default)]
        channel_id: Option<Uuid>,
    },

    ToggleReaction { message_id: Uuid, emoji: String },

    MarkRead { message_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_send_message() {
        let raw = r#"{"type":"send_message","data":{"channel_id":"00000000-0000-0000-0000-000000000001","content":"hi"}}"#;
        let cmd: ClientCommand = serde_json::from_str(raw).unwrap();
        match cmd {
            ClientCommand::SendMessage {
                channel_id,
                content,
                kind,
                file,
            } => {
                assert_eq!(channel_id, Some(Uuid::from_u128(1)));
                assert_eq!(content.as_deref(), Some("hi"));
                assert_eq!(kind, MessageKind::Text);
                assert!(file.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_decode_lobby_typing() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"typing_start","data":{}}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::TypingStart { channel_id: None }));
    }

    #[test]
    fn test_decode_file_message() {
        let raw = r#"{"type":"direct_message","data":{"recipient_id":"00000000-0000-0000-0000-000000000002","type":"image","file":{"url":"/uploads/a.png","size":42}}}"#;
        let cmd: ClientCommand = serde_json::from_str(raw).unwrap();
        let ClientCommand::DirectMessage { kind, file, .. } = cmd else {
            panic!("expected direct_message");
        };
        assert_eq!(kind, MessageKind::Image);
        assert_eq!(file.unwrap().size, Some(42));
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(serde_json::from_str::<ClientCommand>(r#"{"type":"nuke","data":{}}"#).is_err());
    }

    #[test]
    fn test_error_event_shape() {
        let event = ServerEvent::OperationError {
            code: "not_found".into(),
            message: "channel not found".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "operation_error");
        assert_eq!(json["data"]["code"], "not_found");
    }
}
