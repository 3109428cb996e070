//! CRUD operations for [`User`] records and their presence fields.

use chrono::{DateTime, Utc};
use rusqlite::params;

use roomchat_shared::UserId;

use crate::database::{conversion_err, fmt_ts, not_found, now_ts, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{PresenceRecord, User};

pub(crate) const USER_COLUMNS: &str =
    "id, display_name, avatar_ref, online, last_seen, created_at, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Create the user if absent, otherwise merge the profile fields.
    ///
    /// Presence columns are left untouched on update.
    pub fn upsert_user(
        &self,
        id: &UserId,
        display_name: Option<&str>,
        avatar_ref: Option<&str>,
    ) -> Result<User> {
        let now = fmt_ts(&now_ts());
        self.conn().execute(
            "INSERT INTO users (id, display_name, avatar_ref, online, last_seen, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, NULL, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 display_name = COALESCE(excluded.display_name, users.display_name),
                 avatar_ref   = COALESCE(excluded.avatar_ref, users.avatar_ref),
                 updated_at   = excluded.updated_at",
            params![id.as_str(), display_name, avatar_ref, now],
        )?;
        self.get_user(id)
    }

    /// Write the presence flag and refresh `last_seen` to store time.
    pub fn set_presence(&self, id: &UserId, online: bool) -> Result<PresenceRecord> {
        let now = now_ts();
        let affected = self.conn().execute(
            "UPDATE users SET online = ?1, last_seen = ?2, updated_at = ?2 WHERE id = ?3",
            params![online, fmt_ts(&now), id.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("user {id}")));
        }
        Ok(PresenceRecord {
            user_id: id.clone(),
            online,
            last_seen: Some(now),
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_user(&self, id: &UserId) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.as_str()],
                row_to_user,
            )
            .map_err(not_found(format!("user {id}")))
    }

    /// List all users ordered by id.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id ASC"))?;
        let rows = stmt.query_map([], row_to_user)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn get_presence(&self, id: &UserId) -> Result<PresenceRecord> {
        self.get_user(id).map(|u| PresenceRecord::from(&u))
    }
}

pub(crate) fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id_str: String = row.get(0)?;
    let display_name: Option<String> = row.get(1)?;
    let avatar_ref: Option<String> = row.get(2)?;
    let online: bool = row.get(3)?;
    let last_seen_str: Option<String> = row.get(4)?;
    let created_str: String = row.get(5)?;
    let updated_str: String = row.get(6)?;

    let id = UserId::parse(id_str).map_err(|e| conversion_err(0, e))?;
    let last_seen: Option<DateTime<Utc>> =
        last_seen_str.map(|s| parse_ts(4, &s)).transpose()?;

    Ok(User {
        id,
        display_name,
        avatar_ref,
        online,
        last_seen,
        created_at: parse_ts(5, &created_str)?,
        updated_at: parse_ts(6, &updated_str)?,
    })
}
