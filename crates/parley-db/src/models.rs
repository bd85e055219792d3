//! Database row types. These map directly to SQLite rows and are kept
//! distinct from the wire models in parley-types.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use uuid::Uuid;

use parley_types::models::{
    Channel, FileRef, Identity, Message, MessageKind, Reaction, ReadMark,
};

pub struct ChannelRow {
    pub id: String,
    pub name: String,
    pub last_message_id: Option<String>,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub channel_id: Option<String>,
    pub recipient_id: Option<String>,
    pub content: Option<String>,
    pub kind: String,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub edited: bool,
    pub created_at: String,
}

pub struct ReactionRow {
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}

pub struct ReadReceiptRow {
    pub user_id: String,
    pub read_at: String,
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // Rows written by sqlite's datetime('now') have no timezone.
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .with_context(|| format!("Corrupt timestamp '{}'", raw))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("Corrupt id '{}'", raw))
}

fn parse_opt_uuid(raw: Option<&str>) -> Result<Option<Uuid>> {
    raw.map(parse_uuid).transpose()
}

impl ChannelRow {
    pub fn into_channel(self) -> Result<Channel> {
        Ok(Channel {
            id: parse_uuid(&self.id)?,
            name: self.name,
            last_message_id: parse_opt_uuid(self.last_message_id.as_deref())?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

impl MessageRow {
    pub fn into_message(
        self,
        reactions: Vec<ReactionRow>,
        receipts: Vec<ReadReceiptRow>,
    ) -> Result<Message> {
        let file = self.file_url.map(|url| FileRef {
            url,
            name: self.file_name,
            size: self.file_size.and_then(|s| u64::try_from(s).ok()),
        });

        let reactions = reactions
            .into_iter()
            .map(|r| -> Result<Reaction> {
                Ok(Reaction {
                    user_id: parse_uuid(&r.user_id)?,
                    emoji: r.emoji,
                    created_at: parse_timestamp(&r.created_at)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let read_by = receipts
            .into_iter()
            .map(|r| -> Result<ReadMark> {
                Ok(ReadMark {
                    user_id: parse_uuid(&r.user_id)?,
                    read_at: parse_timestamp(&r.read_at)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Message {
            id: parse_uuid(&self.id)?,
            sender: Identity::new(parse_uuid(&self.sender_id)?, self.sender_name),
            channel_id: parse_opt_uuid(self.channel_id.as_deref())?,
            recipient_id: parse_opt_uuid(self.recipient_id.as_deref())?,
            content: self.content,
            file,
            kind: MessageKind::parse(&self.kind),
            created_at: parse_timestamp(&self.created_at)?,
            reactions,
            read_by,
            edited: self.edited,
        })
    }
}
