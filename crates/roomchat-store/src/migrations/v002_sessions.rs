use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Local session bookkeeping (current user, active room)
CREATE TABLE IF NOT EXISTS session (
    key        TEXT PRIMARY KEY NOT NULL,
    value      TEXT NOT NULL,              -- JSON-encoded
    updated_at TEXT NOT NULL
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
