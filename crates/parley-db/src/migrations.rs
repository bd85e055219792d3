use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL,
            online      INTEGER NOT NULL DEFAULT 0,
            last_seen   TEXT
        );

        CREATE TABLE IF NOT EXISTS channels (
            id               TEXT PRIMARY KEY,
            name             TEXT NOT NULL UNIQUE,
            last_message_id  TEXT,
            created_at       TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            sender_id       TEXT NOT NULL,
            sender_name     TEXT NOT NULL,
            channel_id      TEXT REFERENCES channels(id),
            recipient_id    TEXT,
            content         TEXT,
            kind            TEXT NOT NULL DEFAULT 'text',
            file_url        TEXT,
            file_name       TEXT,
            file_size       INTEGER,
            edited          INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_channel
            ON messages(channel_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_direct
            ON messages(sender_id, recipient_id);

        CREATE TABLE IF NOT EXISTS reactions (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL,
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE(message_id, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);

        CREATE TABLE IF NOT EXISTS read_receipts (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL,
            read_at     TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );

        -- Seed the default general channel
        INSERT OR IGNORE INTO channels (id, name, created_at)
            VALUES ('00000000-0000-0000-0000-000000000001', 'general', '1970-01-01T00:00:00.000Z');
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
