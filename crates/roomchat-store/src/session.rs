//! Local key-value store for session bookkeeping (current user, active room).
//!
//! Values are JSON-encoded so callers can persist any serde type.

use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::database::{fmt_ts, now_ts, Database};
use crate::error::Result;

impl Database {
    pub fn session_set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        self.conn().execute(
            "INSERT INTO session (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, encoded, fmt_ts(&now_ts())],
        )?;
        Ok(())
    }

    pub fn session_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM session WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Returns `true` if a value was removed.
    pub fn session_remove(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM session WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomchat_shared::{room_key, RoomKey, UserId};

    #[test]
    fn test_session_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.db");
        let alice = UserId::parse("alice").unwrap();
        let room = room_key(&alice, &UserId::parse("bob").unwrap());

        {
            let db = Database::open_at(&path).unwrap();
            db.session_set("current_user_id", &alice).unwrap();
            db.session_set("active_room", &room).unwrap();
        }

        let db = Database::open_at(&path).unwrap();
        assert_eq!(db.session_get::<UserId>("current_user_id").unwrap(), Some(alice));
        assert_eq!(db.session_get::<RoomKey>("active_room").unwrap(), Some(room));
        assert!(db.session_remove("active_room").unwrap());
        assert!(!db.session_remove("active_room").unwrap());
        assert_eq!(db.session_get::<RoomKey>("active_room").unwrap(), None);
    }

    #[test]
    fn test_session_rejects_malformed_value() {
        let db = Database::open_in_memory().unwrap();
        db.session_set("current_user_id", &"bad_id").unwrap();
        assert!(db.session_get::<UserId>("current_user_id").is_err());
    }
}
