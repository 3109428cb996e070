//! CRUD operations for [`Channel`] records and their membership.

use rusqlite::params;

use roomchat_shared::{ChannelCode, ChannelId, UserId};

use crate::database::{conversion_err, fmt_ts, not_found, now_ts, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{Channel, User};
use crate::users::{row_to_user, USER_COLUMNS};

const CHANNEL_COLUMNS: &str = "c.id, c.name, c.code, c.max_members, c.created_by, c.created_at,
     (SELECT COUNT(*) FROM channel_members cm WHERE cm.channel_id = c.id)";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a channel with `creator` as its first member, in one transaction.
    ///
    /// A code that is already in use yields [`StoreError::Conflict`].
    pub fn create_channel(
        &self,
        name: &str,
        code: &ChannelCode,
        max_members: u32,
        creator: &UserId,
    ) -> Result<Channel> {
        self.get_user(creator)?;

        let id = ChannelId::new(name, code);
        let now = fmt_ts(&now_ts());
        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO channels (id, name, code, max_members, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.as_str(),
                name,
                code.as_str(),
                max_members,
                creator.as_str(),
                now
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(format!("channel code {code}"))
            }
            other => StoreError::Sqlite(other),
        })?;
        tx.execute(
            "INSERT INTO channel_members (channel_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
            params![id.as_str(), creator.as_str(), now],
        )?;
        tx.commit()?;

        self.get_channel(&id)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_channel(&self, id: &ChannelId) -> Result<Channel> {
        self.conn()
            .query_row(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels c WHERE c.id = ?1"),
                params![id.as_str()],
                row_to_channel,
            )
            .map_err(not_found(format!("channel {id}")))
    }

    pub fn find_channel_by_code(&self, code: &ChannelCode) -> Result<Channel> {
        self.conn()
            .query_row(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels c WHERE c.code = ?1"),
                params![code.as_str()],
                row_to_channel,
            )
            .map_err(not_found(format!("channel with code {code}")))
    }

    /// List all channels, newest first.
    pub fn list_channels(&self) -> Result<Vec<Channel>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels c ORDER BY c.created_at DESC, c.id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_channel)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Members of a channel with their presence, in join order.
    pub fn channel_members(&self, id: &ChannelId) -> Result<Vec<User>> {
        self.get_channel(id)?;
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {USER_COLUMNS}
             FROM channel_members cm JOIN users u ON u.id = cm.user_id
             WHERE cm.channel_id = ?1
             ORDER BY cm.joined_at ASC, cm.rowid ASC"
        ))?;
        let rows = stmt.query_map(params![id.as_str()], row_to_user)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Add `user` to the channel. Returns `false` if it was already a member.
    ///
    /// A full channel yields [`StoreError::Rejected`].
    pub fn join_channel(&self, id: &ChannelId, user: &UserId) -> Result<bool> {
        self.get_user(user)?;

        let tx = self.conn().unchecked_transaction()?;
        let channel = tx
            .query_row(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels c WHERE c.id = ?1"),
                params![id.as_str()],
                row_to_channel,
            )
            .map_err(not_found(format!("channel {id}")))?;
        let already: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM channel_members WHERE channel_id = ?1 AND user_id = ?2)",
            params![id.as_str(), user.as_str()],
            |row| row.get(0),
        )?;
        if already {
            return Ok(false);
        }
        if channel.is_full() {
            return Err(StoreError::Rejected(format!(
                "channel {} is full ({} members)",
                channel.name, channel.max_members
            )));
        }
        tx.execute(
            "INSERT INTO channel_members (channel_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
            params![id.as_str(), user.as_str(), fmt_ts(&now_ts())],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Remove `user` from the channel. Returns `true` if it was a member.
    pub fn leave_channel(&self, id: &ChannelId, user: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM channel_members WHERE channel_id = ?1 AND user_id = ?2",
            params![id.as_str(), user.as_str()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<Channel> {
    let id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let code_str: String = row.get(2)?;
    let max_members: u32 = row.get(3)?;
    let creator_str: String = row.get(4)?;
    let created_str: String = row.get(5)?;
    let member_count: u32 = row.get(6)?;

    Ok(Channel {
        id: ChannelId::from(id_str),
        name,
        code: ChannelCode::parse(code_str).map_err(|e| conversion_err(2, e))?,
        max_members,
        created_by: UserId::parse(creator_str).map_err(|e| conversion_err(4, e))?,
        created_at: parse_ts(5, &created_str)?,
        member_count,
    })
}
