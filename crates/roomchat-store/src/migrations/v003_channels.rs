//! v003 -- Group channels joined by code.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Channels
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channels (
    id          TEXT PRIMARY KEY NOT NULL,   -- "<name>_<code>"
    name        TEXT NOT NULL,
    code        TEXT NOT NULL UNIQUE,        -- 4-digit join code
    max_members INTEGER NOT NULL,
    created_by  TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Channel membership
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channel_members (
    channel_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    joined_at  TEXT NOT NULL,

    PRIMARY KEY (channel_id, user_id),
    FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_channel_members_user ON channel_members(user_id);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
