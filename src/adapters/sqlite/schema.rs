use rusqlite::Connection;

use crate::types::Result;

pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS threads (
            id              TEXT PRIMARY KEY,   -- UUIDv7
            thread_key      TEXT NOT NULL UNIQUE,
            subject         TEXT NOT NULL,
            participants    TEXT NOT NULL DEFAULT '[]',  -- JSON array, sorted
            created_at      INTEGER NOT NULL,   -- unix epoch ms
            updated_at      INTEGER NOT NULL    -- unix epoch ms
        );

        CREATE INDEX IF NOT EXISTS idx_threads_updated ON threads(updated_at DESC);

        CREATE TABLE IF NOT EXISTS messages (
            id                  TEXT PRIMARY KEY,   -- UUIDv7
            message_id          TEXT NOT NULL UNIQUE,  -- RFC 5322 Message-ID, no brackets
            thread_id           TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            sender              TEXT NOT NULL,
            recipients          TEXT NOT NULL,      -- ', ' delimited
            cc                  TEXT,               -- ', ' delimited
            subject             TEXT NOT NULL,
            body_text           TEXT NOT NULL,
            body_html           TEXT,
            in_reply_to         TEXT,
            references_ids      TEXT,               -- '<a> <b>'
            received_at         INTEGER NOT NULL,   -- unix epoch ms
            is_sent_by_system   INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, received_at);
        ",
    )?;

    Ok(())
}
