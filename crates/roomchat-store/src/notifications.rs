//! Deferred notifications for messages sent to offline receivers.

use rusqlite::params;
use uuid::Uuid;

use roomchat_shared::{MessageId, NotificationId, UserId};

use crate::database::{conversion_err, fmt_ts, now_ts, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::Notification;

const NOTIFICATION_COLUMNS: &str =
    "id, sender_id, receiver_id, message_id, message_text, timestamp, is_read, was_offline, read_at";

impl Database {
    /// Persist an unread notification for a message that reached an offline receiver.
    pub fn create_notification(
        &self,
        sender: &UserId,
        receiver: &UserId,
        message_id: Option<MessageId>,
        text: &str,
    ) -> Result<Notification> {
        let notification = Notification {
            id: NotificationId::new(),
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
            message_id,
            message_text: text.to_string(),
            timestamp: now_ts(),
            is_read: false,
            was_offline: true,
            read_at: None,
        };

        self.conn().execute(
            "INSERT INTO notifications
                 (id, sender_id, receiver_id, message_id, message_text, timestamp, is_read, was_offline, read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 1, NULL)",
            params![
                notification.id.0.to_string(),
                sender.as_str(),
                receiver.as_str(),
                message_id.map(|m| m.0.to_string()),
                text,
                fmt_ts(&notification.timestamp),
            ],
        )?;

        Ok(notification)
    }

    /// Mark every unread notification from `sender` to `receiver` as read.
    ///
    /// Runs as one transaction: either all targeted rows flip or none do.
    /// Returns the number of notifications that changed state.
    pub fn mark_notifications_read(&self, sender: &UserId, receiver: &UserId) -> Result<usize> {
        let tx = self.conn().unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE notifications SET is_read = 1, read_at = ?3
             WHERE sender_id = ?1 AND receiver_id = ?2 AND is_read = 0",
            params![sender.as_str(), receiver.as_str(), fmt_ts(&now_ts())],
        )?;
        tx.commit()?;
        Ok(changed)
    }

    /// Unread offline notifications addressed to `receiver`, newest first.
    pub fn unread_notifications(&self, receiver: &UserId) -> Result<Vec<Notification>> {
        self.query_notifications(
            &format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                 WHERE receiver_id = ?1 AND is_read = 0 AND was_offline = 1
                 ORDER BY timestamp DESC, rowid DESC"
            ),
            receiver,
        )
    }

    fn query_notifications(&self, sql: &str, receiver: &UserId) -> Result<Vec<Notification>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params![receiver.as_str()], row_to_notification)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    let id_str: String = row.get(0)?;
    let sender_str: String = row.get(1)?;
    let receiver_str: String = row.get(2)?;
    let message_id_str: Option<String> = row.get(3)?;
    let message_text: String = row.get(4)?;
    let ts_str: String = row.get(5)?;
    let is_read: bool = row.get(6)?;
    let was_offline: bool = row.get(7)?;
    let read_at_str: Option<String> = row.get(8)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion_err(0, e))?;
    let message_id = message_id_str
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| conversion_err(3, e))?;

    Ok(Notification {
        id: NotificationId(id),
        sender_id: UserId::parse(sender_str).map_err(|e| conversion_err(1, e))?,
        receiver_id: UserId::parse(receiver_str).map_err(|e| conversion_err(2, e))?,
        message_id: message_id.map(MessageId),
        message_text,
        timestamp: parse_ts(5, &ts_str)?,
        is_read,
        was_offline,
        read_at: read_at_str.map(|s| parse_ts(8, &s)).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    #[test]
    fn test_create_is_unread_and_offline() {
        let db = Database::open_in_memory().unwrap();
        let n = db
            .create_notification(&uid("bob"), &uid("alice"), None, "ping")
            .unwrap();
        assert!(!n.is_read);
        assert!(n.was_offline);
        assert_eq!(db.unread_notifications(&uid("alice")).unwrap(), vec![n]);
    }

    #[test]
    fn test_mark_read_is_scoped_and_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let (alice, bob, carol) = (uid("alice"), uid("bob"), uid("carol"));
        db.create_notification(&bob, &alice, None, "1").unwrap();
        db.create_notification(&bob, &alice, None, "2").unwrap();
        db.create_notification(&carol, &alice, None, "3").unwrap();

        assert_eq!(db.mark_notifications_read(&bob, &alice).unwrap(), 2);
        assert_eq!(db.mark_notifications_read(&bob, &alice).unwrap(), 0);

        let unread = db.unread_notifications(&alice).unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].sender_id, carol);

        let read_at: Vec<Option<String>> = db
            .conn()
            .prepare("SELECT read_at FROM notifications WHERE sender_id = 'bob'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(read_at.len(), 2);
        assert!(read_at.iter().all(Option::is_some));
    }

    #[test]
    fn test_unread_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let (alice, bob) = (uid("alice"), uid("bob"));
        db.create_notification(&bob, &alice, None, "first").unwrap();
        db.create_notification(&bob, &alice, None, "second").unwrap();
        let texts: Vec<_> = db
            .unread_notifications(&alice)
            .unwrap()
            .into_iter()
            .map(|n| n.message_text)
            .collect();
        assert_eq!(texts, vec!["second", "first"]);
    }
}
