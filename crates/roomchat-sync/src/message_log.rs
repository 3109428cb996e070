//! Message Log Store.
//!
//! Append-only ordered log per room with snapshot subscriptions. Every change
//! to a room (a new message, a `readBy` addition) re-reads the whole room and
//! pushes the ordered list to each subscriber. Redelivery is O(n) per change,
//! which is fine for conversation-sized logs but does not scale to large
//! group histories.
//!
//! Snapshots are read and published while the store lock is held, so the
//! order in which subscribers see snapshots matches the order of the writes.

use std::sync::Arc;

use tracing::{debug, warn};

use roomchat_shared::constants::MAX_MESSAGE_TEXT_LEN;
use roomchat_shared::{MessageId, RoomKey, SyncError, UserId};
use roomchat_store::{Database, Message};

use crate::backend::Backend;
use crate::error::Result;
use crate::feed::{Feed, SubscriptionHandle};
use crate::queue::EventQueue;

/// Ordered, immutable view of a room's log.
pub type Snapshot = Arc<Vec<Message>>;

pub struct MessageLog {
    backend: Backend,
    feed: Feed<RoomKey, Snapshot>,
}

impl MessageLog {
    pub fn new(backend: Backend, queue: EventQueue) -> Self {
        Self {
            backend,
            feed: Feed::new("messages", queue),
        }
    }

    /// Append `text` from `sender` to `room`.
    ///
    /// The store assigns id and timestamp. Any store failure, including an
    /// unreachable backend, is reported as `Write` so the caller keeps the text.
    pub async fn append(&self, room: &RoomKey, sender: &UserId, text: &str) -> Result<Message> {
        if !room.contains(sender) {
            return Err(SyncError::InvalidInput(format!(
                "{sender} is not a member of room {room}"
            )));
        }
        if text.is_empty() {
            return Err(SyncError::InvalidInput("message text is empty".into()));
        }
        if text.len() > MAX_MESSAGE_TEXT_LEN {
            return Err(SyncError::InvalidInput(format!(
                "message text is {} bytes, limit is {MAX_MESSAGE_TEXT_LEN}",
                text.len()
            )));
        }

        let db = self.backend.lock().await.map_err(into_write)?;
        let message = db
            .append_message(room, sender, text)
            .map_err(|e| into_write(e.into()))?;

        debug!(room = %room, id = %message.id, seq = message.seq, "message appended");
        self.publish_locked(&db, room);
        Ok(message)
    }

    /// Live ordered feed of `room`. The current log is delivered first.
    pub async fn subscribe(
        &self,
        room: &RoomKey,
        on_change: impl Fn(Snapshot) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle> {
        let db = self.backend.lock().await?;
        let snapshot = Arc::new(db.get_room_messages(room)?);
        Ok(self.feed.subscribe(room.clone(), snapshot, Arc::new(on_change)))
    }

    /// Stop delivery to `handle`. Safe to call more than once.
    pub fn close(&self, handle: &mut SubscriptionHandle) {
        handle.close();
    }

    /// Current ordered log of `room`.
    pub async fn snapshot(&self, room: &RoomKey) -> Result<Snapshot> {
        let messages = self.backend.call(|db| db.get_room_messages(room)).await?;
        Ok(Arc::new(messages))
    }

    /// The newest `limit` messages of `room`, oldest first.
    pub async fn recent(&self, room: &RoomKey, limit: u32) -> Result<Vec<Message>> {
        self.backend
            .call(|db| db.get_recent_messages(room, limit))
            .await
    }

    /// Add `user` to the `readBy` set of `message`. Returns whether it was new.
    pub(crate) async fn add_reader(&self, message: &Message, user: &UserId) -> Result<bool> {
        let db = self.backend.lock().await?;
        let added = db.add_reader(message.id, user)?;
        if added {
            self.publish_locked(&db, &message.room_key);
        }
        Ok(added)
    }

    /// Add `user` to `readBy` of the listed messages of `room` it did not send.
    pub(crate) async fn mark_read(
        &self,
        room: &RoomKey,
        user: &UserId,
        ids: &[MessageId],
    ) -> Result<usize> {
        let db = self.backend.lock().await?;
        let added = db.mark_messages_read(room, user, ids)?;
        if added > 0 {
            self.publish_locked(&db, room);
        }
        Ok(added)
    }

    /// Re-read `room` and deliver it if it changed since the last delivery.
    ///
    /// Picks up writes made by other processes sharing the same store.
    pub async fn refresh(&self, room: &RoomKey) -> Result<bool> {
        if self.feed.listener_count(room) == 0 {
            return Ok(false);
        }
        let db = self.backend.lock().await?;
        let snapshot = Arc::new(db.get_room_messages(room)?);
        Ok(self.feed.publish_if_changed(room, snapshot))
    }

    /// Rooms that currently have subscribers.
    pub fn watched_rooms(&self) -> Vec<RoomKey> {
        self.feed.keys()
    }

    pub fn subscriber_count(&self, room: &RoomKey) -> usize {
        self.feed.listener_count(room)
    }

    fn publish_locked(&self, db: &Database, room: &RoomKey) {
        if self.feed.listener_count(room) == 0 {
            return;
        }
        match db.get_room_messages(room) {
            Ok(messages) => {
                let delivered = self.feed.publish(room, Arc::new(messages));
                debug!(room = %room, subscribers = delivered, "snapshot published");
            }
            // The write itself succeeded; subscribers catch up on the next change.
            Err(e) => warn!(room = %room, error = %e, "failed to reload room snapshot"),
        }
    }
}

fn into_write(e: SyncError) -> SyncError {
    match e {
        SyncError::Connectivity(reason) => SyncError::Write(reason),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomchat_shared::room_key;
    use std::sync::Mutex;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn setup() -> (MessageLog, Backend, EventQueue) {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user(&uid("alice"), None, None).unwrap();
        db.upsert_user(&uid("bob"), None, None).unwrap();
        let backend = Backend::new(db);
        let queue = EventQueue::start();
        (MessageLog::new(backend.clone(), queue.clone()), backend, queue)
    }

    #[tokio::test]
    async fn test_subscriber_sees_initial_and_each_append() {
        let (log, _backend, queue) = setup();
        let (alice, bob) = (uid("alice"), uid("bob"));
        let room = room_key(&alice, &bob);
        log.append(&room, &alice, "first").await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _handle = log
            .subscribe(&room, move |snap: Snapshot| {
                sink.lock()
                    .unwrap()
                    .push(snap.iter().map(|m| m.text.clone()).collect::<Vec<_>>())
            })
            .await
            .unwrap();
        log.append(&room, &bob, "second").await.unwrap();
        queue.flush().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], vec!["first"]);
        assert_eq!(seen[1], vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_append_rejects_outsider_and_empty_text() {
        let (log, _backend, _queue) = setup();
        let room = room_key(&uid("alice"), &uid("bob"));

        let err = log.append(&room, &uid("carol"), "hi").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));

        let err = log.append(&room, &uid("alice"), "").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));

        let long = "x".repeat(MAX_MESSAGE_TEXT_LEN + 1);
        let err = log.append(&room, &uid("alice"), &long).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_append_when_unreachable_is_write_failure() {
        let (log, backend, _queue) = setup();
        let room = room_key(&uid("alice"), &uid("bob"));
        backend.set_reachable(false);

        let err = log.append(&room, &uid("alice"), "hi").await.unwrap_err();
        assert!(matches!(err, SyncError::Write(_)));

        backend.set_reachable(true);
        assert!(log.snapshot(&room).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reader_added_republishes() {
        let (log, _backend, queue) = setup();
        let (alice, bob) = (uid("alice"), uid("bob"));
        let room = room_key(&alice, &bob);
        let msg = log.append(&room, &alice, "hey").await.unwrap();

        let last = Arc::new(Mutex::new(None));
        let sink = last.clone();
        let _handle = log
            .subscribe(&room, move |snap: Snapshot| *sink.lock().unwrap() = Some(snap))
            .await
            .unwrap();

        assert!(log.add_reader(&msg, &bob).await.unwrap());
        assert!(!log.add_reader(&msg, &bob).await.unwrap());
        queue.flush().await;

        let snap = last.lock().unwrap().clone().unwrap();
        assert!(snap[0].is_read_by(&bob));
    }

    #[tokio::test]
    async fn test_recent_and_refresh() {
        let (log, backend, queue) = setup();
        let (alice, bob) = (uid("alice"), uid("bob"));
        let room = room_key(&alice, &bob);
        for i in 0..5 {
            log.append(&room, &alice, &format!("m{i}")).await.unwrap();
        }
        let recent = log.recent(&room, 2).await.unwrap();
        let texts: Vec<_> = recent.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m3", "m4"]);

        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let _handle = log
            .subscribe(&room, move |_snap: Snapshot| *sink.lock().unwrap() += 1)
            .await
            .unwrap();
        assert!(!log.refresh(&room).await.unwrap());

        // A write that bypasses the log, as another process would make.
        backend
            .call(|db| db.append_message(&room, &bob, "elsewhere"))
            .await
            .unwrap();
        assert!(log.refresh(&room).await.unwrap());
        queue.flush().await;
        assert_eq!(*count.lock().unwrap(), 2);
    }
}
