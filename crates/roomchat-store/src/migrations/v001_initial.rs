//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `users`, `messages`, `message_reads`, and
//! `notifications`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- opaque identity-provider id
    display_name TEXT,
    avatar_ref   TEXT,
    online       INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    last_seen    TEXT,                        -- RFC-3339, microseconds, UTC
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Messages (append-only per room)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT, -- insertion order, tie-breaker
    id          TEXT NOT NULL UNIQUE,              -- UUID v4
    room_key    TEXT NOT NULL,                     -- "<low>_<high>"
    member_low  TEXT NOT NULL,
    member_high TEXT NOT NULL,
    sender      TEXT NOT NULL,
    text        TEXT NOT NULL,
    timestamp   TEXT NOT NULL                      -- store-assigned
);

CREATE INDEX IF NOT EXISTS idx_messages_room_ts
    ON messages(room_key, timestamp, seq);
CREATE INDEX IF NOT EXISTS idx_messages_member_low ON messages(member_low);
CREATE INDEX IF NOT EXISTS idx_messages_member_high ON messages(member_high);

-- ----------------------------------------------------------------
-- Read receipts (the readBy set; rows are never removed)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_reads (
    message_id TEXT NOT NULL,                 -- FK -> messages(id)
    user_id    TEXT NOT NULL,
    read_at    TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Deferred notifications (never deleted, only marked read)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS notifications (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    sender_id    TEXT NOT NULL,
    receiver_id  TEXT NOT NULL,
    message_id   TEXT,                        -- triggering message
    message_text TEXT NOT NULL,
    timestamp    TEXT NOT NULL,
    is_read      INTEGER NOT NULL DEFAULT 0,
    was_offline  INTEGER NOT NULL DEFAULT 1,
    read_at      TEXT
);

CREATE INDEX IF NOT EXISTS idx_notifications_receiver_unread
    ON notifications(receiver_id, is_read, sender_id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
