use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use roomchat_shared::{MessageId, RoomKey, UserId};

use crate::database::{conversion_err, fmt_ts, now_ts, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{Message, RoomPreview};

const MESSAGE_COLUMNS: &str = "seq, id, room_key, sender, text, timestamp";

impl Database {
    /// Append a message to `room`, assigning id, sequence and timestamp.
    ///
    /// The timestamp is store time, clamped so it never goes below the newest
    /// timestamp already in the room. The insert is a single statement inside
    /// a transaction, so a message is either fully written or not at all.
    pub fn append_message(&self, room: &RoomKey, sender: &UserId, text: &str) -> Result<Message> {
        if !room.contains(sender) {
            return Err(StoreError::Malformed {
                entity: "message",
                reason: format!("sender {sender} is not a member of room {room}"),
            });
        }

        let tx = self.conn().unchecked_transaction()?;

        let newest: Option<String> = tx
            .query_row(
                "SELECT MAX(timestamp) FROM messages WHERE room_key = ?1",
                params![room.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        let mut timestamp = now_ts();
        if let Some(newest) = newest {
            let newest = parse_ts(0, &newest)?;
            if newest > timestamp {
                tracing::debug!(room = %room, "clock behind newest message, clamping timestamp");
                timestamp = newest;
            }
        }

        let id = MessageId::new();
        let (low, high) = room.members();
        tx.execute(
            "INSERT INTO messages (id, room_key, member_low, member_high, sender, text, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.0.to_string(),
                room.to_string(),
                low.as_str(),
                high.as_str(),
                sender.as_str(),
                text,
                fmt_ts(&timestamp),
            ],
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;

        Ok(Message {
            id,
            room_key: room.clone(),
            sender: sender.clone(),
            text: text.to_string(),
            timestamp,
            seq,
            read_by: BTreeSet::new(),
        })
    }

    /// Full ordered log of a room: ascending timestamp, ties by insertion.
    pub fn get_room_messages(&self, room: &RoomKey) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE room_key = ?1
             ORDER BY timestamp ASC, seq ASC"
        ))?;
        let rows = stmt.query_map(params![room.to_string()], row_to_message)?;
        let mut messages = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        self.attach_readers(room, &mut messages)?;
        Ok(messages)
    }

    /// The newest `limit` messages of a room, still in ascending order.
    pub fn get_recent_messages(&self, room: &RoomKey, limit: u32) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE room_key = ?1
             ORDER BY timestamp DESC, seq DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![room.to_string(), limit], row_to_message)?;
        let mut messages = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        messages.reverse();
        self.attach_readers(room, &mut messages)?;
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Read receipts
    // ------------------------------------------------------------------

    /// Add `user` to the message's `readBy` set. Returns `false` if already present.
    pub fn add_reader(&self, id: MessageId, user: &UserId) -> Result<bool> {
        let affected = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                 VALUES (?1, ?2, ?3)",
                params![id.0.to_string(), user.as_str(), fmt_ts(&now_ts())],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::NotFound(format!("message {id}"))
                }
                other => StoreError::Sqlite(other),
            })?;
        Ok(affected > 0)
    }

    /// Add `user` to `readBy` of exactly the listed messages of `room`, in one
    /// transaction. Messages sent by `user` or belonging to another room are
    /// skipped. Returns how many receipts were added.
    pub fn mark_messages_read(
        &self,
        room: &RoomKey,
        user: &UserId,
        ids: &[MessageId],
    ) -> Result<usize> {
        let tx = self.conn().unchecked_transaction()?;
        let read_at = fmt_ts(&now_ts());
        let mut added = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                 SELECT id, ?2, ?3 FROM messages
                 WHERE id = ?4 AND room_key = ?1 AND sender != ?2",
            )?;
            for id in ids {
                added += stmt.execute(params![
                    room.to_string(),
                    user.as_str(),
                    read_at,
                    id.0.to_string()
                ])?;
            }
        }
        tx.commit()?;
        Ok(added)
    }

    /// Messages in `room` from someone other than `user` that `user` has not read.
    pub fn count_unread_in_room(&self, room: &RoomKey, user: &UserId) -> Result<u32> {
        Ok(self.conn().query_row(
            "SELECT COUNT(*) FROM messages m
             WHERE m.room_key = ?1 AND m.sender != ?2
               AND NOT EXISTS (
                   SELECT 1 FROM message_reads r
                   WHERE r.message_id = m.id AND r.user_id = ?2
               )",
            params![room.to_string(), user.as_str()],
            |row| row.get(0),
        )?)
    }

    /// Latest message of every room `user` takes part in, newest first.
    pub fn list_room_previews(&self, user: &UserId) -> Result<Vec<RoomPreview>> {
        let mut stmt = self.conn().prepare(
            "SELECT m.room_key, m.sender, m.text, m.timestamp, m.seq
             FROM messages m
             WHERE (m.member_low = ?1 OR m.member_high = ?1)
               AND m.seq = (
                   SELECT m2.seq FROM messages m2
                   WHERE m2.room_key = m.room_key
                   ORDER BY m2.timestamp DESC, m2.seq DESC
                   LIMIT 1
               )
             ORDER BY m.timestamp DESC, m.seq DESC",
        )?;

        let rows = stmt.query_map(params![user.as_str()], |row| {
            let key_str: String = row.get(0)?;
            let sender_str: String = row.get(1)?;
            let text: String = row.get(2)?;
            let ts_str: String = row.get(3)?;
            let seq: i64 = row.get(4)?;
            Ok((key_str, sender_str, text, ts_str, seq))
        })?;

        let mut previews = Vec::new();
        for row in rows {
            let (key_str, sender_str, text, ts_str, seq) = row?;
            let room_key = RoomKey::parse(&key_str)?;
            let Some(peer) = room_key.peer_of(user).cloned() else {
                continue;
            };
            previews.push(RoomPreview {
                peer,
                last_message: text,
                last_sender: UserId::parse(sender_str)?,
                last_timestamp: parse_ts(3, &ts_str)?,
                last_seq: seq,
                room_key,
            });
        }
        Ok(previews)
    }

    fn attach_readers(&self, room: &RoomKey, messages: &mut [Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut stmt = self.conn().prepare(
            "SELECT r.message_id, r.user_id
             FROM message_reads r JOIN messages m ON m.id = r.message_id
             WHERE m.room_key = ?1",
        )?;
        let rows = stmt.query_map(params![room.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut readers: HashMap<Uuid, BTreeSet<UserId>> = HashMap::new();
        for row in rows {
            let (msg_id, user_id) = row?;
            let msg_id = Uuid::parse_str(&msg_id).map_err(|e| StoreError::Malformed {
                entity: "message_read",
                reason: e.to_string(),
            })?;
            readers
                .entry(msg_id)
                .or_default()
                .insert(UserId::parse(user_id)?);
        }

        for message in messages.iter_mut() {
            if let Some(set) = readers.remove(&message.id.0) {
                message.read_by = set;
            }
        }
        Ok(())
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let seq: i64 = row.get(0)?;
    let id_str: String = row.get(1)?;
    let key_str: String = row.get(2)?;
    let sender_str: String = row.get(3)?;
    let text: String = row.get(4)?;
    let ts_str: String = row.get(5)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion_err(1, e))?;
    let room_key = RoomKey::parse(&key_str).map_err(|e| conversion_err(2, e))?;
    let sender = UserId::parse(sender_str).map_err(|e| conversion_err(3, e))?;
    if !room_key.contains(&sender) {
        return Err(conversion_err(
            3,
            StoreError::Malformed {
                entity: "message",
                reason: format!("sender {sender} outside room {room_key}"),
            },
        ));
    }
    let timestamp: DateTime<Utc> = parse_ts(5, &ts_str)?;

    Ok(Message {
        id: MessageId(id),
        room_key,
        sender,
        text,
        timestamp,
        seq,
        read_by: BTreeSet::new(),
    })
}
