use crate::Database;
use crate::models::{
    ChannelRow, MessageRow, ReactionRow, ReadReceiptRow, format_timestamp,
};
use anyhow::Result;
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use parley_types::models::{Channel, Identity, Message, NewMessage};

impl Database {
    // -- Users --

    /// Upsert a user's presence. A `None` last_seen keeps the stored value.
    pub fn record_presence(
        &self,
        identity: &Identity,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, online, last_seen) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    online = excluded.online,
                    last_seen = COALESCE(excluded.last_seen, users.last_seen)",
                rusqlite::params![
                    identity.id.to_string(),
                    identity.display_name,
                    online,
                    last_seen.map(format_timestamp),
                ],
            )?;
            Ok(())
        })
    }

    // -- Channels --

    pub fn create_channel(&self, name: &str) -> Result<Channel> {
        let id = Uuid::new_v4();
        // Stored with millisecond precision; keep the returned value identical.
        let now = Utc::now().trunc_subsecs(3);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO channels (id, name, created_at) VALUES (?1, ?2, ?3)",
                (id.to_string(), name, format_timestamp(now)),
            )?;
            Ok(())
        })?;

        Ok(Channel {
            id,
            name: name.to_string(),
            last_message_id: None,
            created_at: now,
        })
    }

    pub fn get_channel(&self, id: Uuid) -> Result<Option<Channel>> {
        self.with_conn(|conn| query_channel(conn, &id.to_string()))?
            .map(ChannelRow::into_channel)
            .transpose()
    }

    pub fn set_channel_last_message(&self, channel_id: Uuid, message_id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE channels SET last_message_id = ?1 WHERE id = ?2",
                (message_id.to_string(), channel_id.to_string()),
            )?;
            if updated == 0 {
                anyhow::bail!("Channel not found: {}", channel_id);
            }
            Ok(())
        })
    }

    // -- Messages --

    pub fn create_message(&self, new: NewMessage) -> Result<Message> {
        let id = Uuid::new_v4();
        let now = Utc::now().trunc_subsecs(3);
        let file_size = new
            .file
            .as_ref()
            .and_then(|f| f.size)
            .map(i64::try_from)
            .transpose()?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, sender_id, sender_name, channel_id, recipient_id, content,
                                       kind, file_url, file_name, file_size, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    id.to_string(),
                    new.sender.id.to_string(),
                    new.sender.display_name,
                    new.channel_id.map(|c| c.to_string()),
                    new.recipient_id.map(|r| r.to_string()),
                    new.content,
                    new.kind.as_str(),
                    new.file.as_ref().map(|f| f.url.as_str()),
                    new.file.as_ref().and_then(|f| f.name.as_deref()),
                    file_size,
                    format_timestamp(now),
                ],
            )?;
            Ok(())
        })?;

        Ok(Message {
            id,
            sender: new.sender,
            channel_id: new.channel_id,
            recipient_id: new.recipient_id,
            content: new.content,
            file: new.file,
            kind: new.kind,
            created_at: now,
            reactions: vec![],
            read_by: vec![],
            edited: false,
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        let id = id.to_string();
        let loaded = self.with_conn(|conn| {
            let Some(row) = query_message(conn, &id)? else {
                return Ok(None);
            };
            let reactions = query_reactions(conn, &id)?;
            let receipts = query_read_receipts(conn, &id)?;
            Ok(Some((row, reactions, receipts)))
        })?;

        loaded
            .map(|(row, reactions, receipts)| row.into_message(reactions, receipts))
            .transpose()
    }

    // -- Reactions --

    /// Adds a reaction. Adding an existing (user, emoji) pair is a no-op.
    pub fn append_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO reactions (message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    message_id.to_string(),
                    user_id.to_string(),
                    emoji,
                    format_timestamp(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn remove_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                rusqlite::params![message_id.to_string(), user_id.to_string(), emoji],
            )?;
            Ok(())
        })
    }

    // -- Read receipts --

    /// Marks a message read. Returns false if the user had already read it.
    pub fn append_read_by(&self, message_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    message_id.to_string(),
                    user_id.to_string(),
                    format_timestamp(Utc::now()),
                ],
            )?;
            Ok(inserted > 0)
        })
    }
}

fn query_channel(conn: &Connection, id: &str) -> Result<Option<ChannelRow>> {
    let mut stmt = conn
        .prepare("SELECT id, name, last_message_id, created_at FROM channels WHERE id = ?1")?;

    let row = stmt
        .query_row([id], |row| {
            Ok(ChannelRow {
                id: row.get(0)?,
                name: row.get(1)?,
                last_message_id: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_message(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, sender_id, sender_name, channel_id, recipient_id, content, kind,
                file_url, file_name, file_size, edited, created_at
         FROM messages
         WHERE id = ?1",
    )?;

    let row = stmt
        .query_row([id], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                sender_id: row.get(1)?,
                sender_name: row.get(2)?,
                channel_id: row.get(3)?,
                recipient_id: row.get(4)?,
                content: row.get(5)?,
                kind: row.get(6)?,
                file_url: row.get(7)?,
                file_name: row.get(8)?,
                file_size: row.get(9)?,
                edited: row.get(10)?,
                created_at: row.get(11)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_reactions(conn: &Connection, message_id: &str) -> Result<Vec<ReactionRow>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, emoji, created_at FROM reactions WHERE message_id = ?1 ORDER BY rowid",
    )?;

    let rows = stmt
        .query_map([message_id], |row| {
            Ok(ReactionRow {
                user_id: row.get(0)?,
                emoji: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn query_read_receipts(conn: &Connection, message_id: &str) -> Result<Vec<ReadReceiptRow>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, read_at FROM read_receipts WHERE message_id = ?1 ORDER BY rowid",
    )?;

    let rows = stmt
        .query_map([message_id], |row| {
            Ok(ReadReceiptRow {
                user_id: row.get(0)?,
                read_at: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
