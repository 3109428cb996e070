//! Read/Notification Reconciler.
//!
//! Owns read-receipt and deferred-notification state and the per-user unread
//! summary. The summary is kept in a cache that is updated incrementally on
//! send and on read-marking, and it is always re-derivable from stored
//! messages and notifications: [`Reconciler::derive_summary`] recomputes it
//! from scratch, and establishing a subscription replaces the cached value
//! with a fresh derivation.
//!
//! Cache mutations only happen while the store lock is held, so the cache
//! never observes writes in a different order than the store does.
//!
//! # Presence race
//!
//! The recipient's presence is read first and the notification decision is
//! made after the append, from that reading. A conversation reads it before
//! appending and hands it to [`Reconciler::on_send_with_presence`];
//! [`Reconciler::on_send`] reads it itself. Either way the steps are not
//! atomic. A user who reconnects in the gap may get a redundant
//! notification, and one who disconnects in the gap may get none.
//! Notifications are a best-effort signal, not a delivery guarantee.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use roomchat_shared::{MessageId, RoomKey, UserId};
use roomchat_store::{Database, Message, Notification};

use crate::backend::Backend;
use crate::error::Result;
use crate::feed::{lock, Feed, SubscriptionHandle};
use crate::message_log::MessageLog;
use crate::presence::PresenceTracker;
use crate::queue::EventQueue;

/// Unread state between one user and one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadEntry {
    /// Unread deferred notifications from the peer.
    pub count: u32,
    /// Text of the latest message in the room, or of the latest unread
    /// notification if the room has no messages.
    pub last_message: String,
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Sequence of the message `last_message` came from, if any.
    pub last_seq: Option<i64>,
}

/// Peer -> unread state, for one user.
pub type UnreadSummary = BTreeMap<UserId, UnreadEntry>;

pub struct Reconciler {
    backend: Backend,
    log: Arc<MessageLog>,
    presence: Arc<PresenceTracker>,
    feed: Feed<UserId, UnreadSummary>,
    viewers: Mutex<HashMap<(RoomKey, UserId), usize>>,
    cache: Mutex<HashMap<UserId, UnreadSummary>>,
}

impl Reconciler {
    pub fn new(
        backend: Backend,
        queue: EventQueue,
        log: Arc<MessageLog>,
        presence: Arc<PresenceTracker>,
    ) -> Self {
        Self {
            backend,
            log,
            presence,
            feed: Feed::new("unread", queue),
            viewers: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Viewing state
    // ------------------------------------------------------------------

    /// Record that `viewer` has `room` open. Nested opens are counted.
    pub fn enter_room(&self, room: &RoomKey, viewer: &UserId) {
        *lock(&self.viewers)
            .entry((room.clone(), viewer.clone()))
            .or_insert(0) += 1;
        debug!(room = %room, viewer = %viewer, "viewer entered room");
    }

    pub fn leave_room(&self, room: &RoomKey, viewer: &UserId) {
        let mut viewers = lock(&self.viewers);
        let key = (room.clone(), viewer.clone());
        if let Some(count) = viewers.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                viewers.remove(&key);
            }
            debug!(room = %room, viewer = %viewer, "viewer left room");
        }
    }

    pub fn is_viewing(&self, room: &RoomKey, viewer: &UserId) -> bool {
        lock(&self.viewers).contains_key(&(room.clone(), viewer.clone()))
    }

    // ------------------------------------------------------------------
    // Read receipts
    // ------------------------------------------------------------------

    /// Add `viewer` to `message.readBy` if it is not the sender and is
    /// actively viewing the room. Returns whether a receipt was added.
    pub async fn mark_delivered(&self, message: &Message, viewer: &UserId) -> Result<bool> {
        if *viewer == message.sender || !self.is_viewing(&message.room_key, viewer) {
            return Ok(false);
        }
        self.log.add_reader(message, viewer).await
    }

    /// [`Self::mark_delivered`] for a batch of messages `viewer` has seen, in
    /// one transaction.
    ///
    /// Only the given messages are marked. Anything appended to `room` after
    /// them stays unread until it shows up in a later batch.
    pub async fn mark_all_delivered(
        &self,
        room: &RoomKey,
        seen: &[Message],
        viewer: &UserId,
    ) -> Result<usize> {
        if !room.contains(viewer) || !self.is_viewing(room, viewer) {
            return Ok(0);
        }
        let ids: Vec<MessageId> = seen
            .iter()
            .filter(|m| m.room_key == *room && m.sender != *viewer && !m.is_read_by(viewer))
            .map(|m| m.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        self.log.mark_read(room, viewer, &ids).await
    }

    /// Messages from the peer in `room` that `viewer` has not read.
    pub async fn unread_in_room(&self, room: &RoomKey, viewer: &UserId) -> Result<u32> {
        self.backend
            .call(|db| db.count_unread_in_room(room, viewer))
            .await
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Post-append hook: notify `recipient` if offline and fold the message
    /// into cached summaries.
    ///
    /// Never fails. A notification that cannot be stored is logged and
    /// skipped; the message itself is already in the log.
    pub async fn on_send(&self, message: &Message, recipient: &UserId) -> Option<Notification> {
        if !is_recipient(message, recipient) {
            return None;
        }
        let recipient_online = self.presence.is_online(recipient).await;
        self.on_send_with_presence(message, recipient, recipient_online)
            .await
    }

    /// [`Self::on_send`] with the recipient's presence already read, for a
    /// sender that checks presence before appending.
    pub async fn on_send_with_presence(
        &self,
        message: &Message,
        recipient: &UserId,
        recipient_online: bool,
    ) -> Option<Notification> {
        if !is_recipient(message, recipient) {
            return None;
        }

        let db = match self.backend.lock().await {
            Ok(db) => db,
            Err(e) => {
                warn!(id = %message.id, error = %e, "could not reconcile sent message");
                self.invalidate(&[&message.sender, recipient]);
                return None;
            }
        };

        let notification = if recipient_online {
            None
        } else {
            match db.create_notification(
                &message.sender,
                recipient,
                Some(message.id),
                &message.text,
            ) {
                Ok(n) => {
                    info!(
                        sender = %message.sender,
                        receiver = %recipient,
                        id = %n.id,
                        "deferred notification created"
                    );
                    Some(n)
                }
                Err(e) => {
                    warn!(
                        sender = %message.sender,
                        receiver = %recipient,
                        error = %e,
                        "failed to create deferred notification"
                    );
                    None
                }
            }
        };

        self.apply_message(message, recipient);
        if let Some(n) = &notification {
            self.apply_notification(n);
        }
        drop(db);

        notification
    }

    /// Mark every unread notification from `sender` to `receiver` read.
    ///
    /// Atomic and idempotent. Returns the number of notifications that changed.
    pub async fn mark_notifications_read(
        &self,
        sender: &UserId,
        receiver: &UserId,
    ) -> Result<usize> {
        let db = self.backend.lock().await?;
        let changed = db.mark_notifications_read(sender, receiver)?;
        debug!(sender = %sender, receiver = %receiver, changed, "notifications marked read");

        let updated = {
            let mut cache = lock(&self.cache);
            cache.get_mut(receiver).map(|summary| {
                let drop_entry = match summary.get_mut(sender) {
                    Some(entry) => {
                        entry.count = 0;
                        entry.last_seq.is_none()
                    }
                    None => false,
                };
                if drop_entry {
                    summary.remove(sender);
                }
                summary.clone()
            })
        };
        if let Some(summary) = updated {
            self.feed.publish_if_changed(receiver, summary);
        }
        drop(db);
        Ok(changed)
    }

    /// Unread offline notifications addressed to `user`, newest first.
    pub async fn unread_notifications(&self, user: &UserId) -> Result<Vec<Notification>> {
        self.backend.call(|db| db.unread_notifications(user)).await
    }

    // ------------------------------------------------------------------
    // Unread summary
    // ------------------------------------------------------------------

    /// Cached summary for `user`, derived on first use.
    pub async fn unread_summary(&self, user: &UserId) -> Result<UnreadSummary> {
        let cached = lock(&self.cache).get(user).cloned();
        if let Some(summary) = cached {
            return Ok(summary);
        }
        let db = self.backend.lock().await?;
        let summary = derive(&db, user)?;
        lock(&self.cache)
            .entry(user.clone())
            .or_insert_with(|| summary.clone());
        Ok(summary)
    }

    /// Recompute the summary for `user` from stored state, bypassing the cache.
    pub async fn derive_summary(&self, user: &UserId) -> Result<UnreadSummary> {
        let db = self.backend.lock().await?;
        Ok(derive(&db, user)?)
    }

    /// Re-derive, replace the cached value, and deliver it if it changed.
    pub async fn refresh(&self, user: &UserId) -> Result<bool> {
        let db = self.backend.lock().await?;
        let summary = derive(&db, user)?;
        lock(&self.cache).insert(user.clone(), summary.clone());
        Ok(self.feed.publish_if_changed(user, summary))
    }

    /// Live unread summary for `user`.
    ///
    /// Establishing the subscription re-derives the summary and replaces the
    /// cache, so any drift is corrected here.
    pub async fn subscribe(
        &self,
        user: &UserId,
        on_change: impl Fn(UnreadSummary) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle> {
        let db = self.backend.lock().await?;
        let summary = derive(&db, user)?;
        let drifted = lock(&self.cache)
            .insert(user.clone(), summary.clone())
            .is_some_and(|cached| cached != summary);
        if drifted {
            warn!(user = %user, "cached unread summary drifted, replaced");
        }
        Ok(self.feed.subscribe(user.clone(), summary, Arc::new(on_change)))
    }

    /// Users whose summary currently has subscribers.
    pub fn watched_users(&self) -> Vec<UserId> {
        self.feed.keys()
    }

    fn apply_message(&self, message: &Message, recipient: &UserId) {
        let sender = &message.sender;
        let mut touched = Vec::new();
        {
            let mut cache = lock(&self.cache);
            for (owner, peer) in [(sender, recipient), (recipient, sender)] {
                if let Some(summary) = cache.get_mut(owner) {
                    let entry = summary.entry(peer.clone()).or_default();
                    if entry.last_seq.map_or(true, |seq| message.seq > seq) {
                        entry.last_message = message.text.clone();
                        entry.last_timestamp = Some(message.timestamp);
                        entry.last_seq = Some(message.seq);
                    }
                    touched.push((owner.clone(), summary.clone()));
                }
            }
        }
        for (owner, summary) in touched {
            self.feed.publish_if_changed(&owner, summary);
        }
    }

    fn apply_notification(&self, n: &Notification) {
        let updated = {
            let mut cache = lock(&self.cache);
            cache.get_mut(&n.receiver_id).map(|summary| {
                let entry = summary.entry(n.sender_id.clone()).or_default();
                entry.count += 1;
                if entry.last_seq.is_none() {
                    entry.last_message = n.message_text.clone();
                    entry.last_timestamp = Some(n.timestamp);
                }
                summary.clone()
            })
        };
        if let Some(summary) = updated {
            self.feed.publish_if_changed(&n.receiver_id, summary);
        }
    }

    fn invalidate(&self, users: &[&UserId]) {
        let mut cache = lock(&self.cache);
        for user in users {
            cache.remove(*user);
        }
    }
}

fn is_recipient(message: &Message, recipient: &UserId) -> bool {
    let ok = *recipient != message.sender && message.room_key.contains(recipient);
    if !ok {
        warn!(
            room = %message.room_key,
            recipient = %recipient,
            "recipient is not the peer of this room, skipping"
        );
    }
    ok
}

/// Full scan: latest message per room plus every unread notification.
fn derive(db: &Database, user: &UserId) -> roomchat_store::Result<UnreadSummary> {
    let mut summary = UnreadSummary::new();

    for preview in db.list_room_previews(user)? {
        summary.insert(
            preview.peer,
            UnreadEntry {
                count: 0,
                last_message: preview.last_message,
                last_timestamp: Some(preview.last_timestamp),
                last_seq: Some(preview.last_seq),
            },
        );
    }

    // Newest first, so the first notification seen for a peer is its latest.
    for n in db.unread_notifications(user)? {
        let entry = summary.entry(n.sender_id).or_default();
        entry.count += 1;
        if entry.last_seq.is_none() && entry.last_timestamp.is_none() {
            entry.last_message = n.message_text;
            entry.last_timestamp = Some(n.timestamp);
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomchat_shared::room_key;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    struct Fixture {
        backend: Backend,
        queue: EventQueue,
        log: Arc<MessageLog>,
        presence: Arc<PresenceTracker>,
        reconciler: Reconciler,
    }

    fn setup() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        for name in ["alice", "bob", "carol"] {
            db.upsert_user(&uid(name), None, None).unwrap();
        }
        let backend = Backend::new(db);
        let queue = EventQueue::start();
        let log = Arc::new(MessageLog::new(backend.clone(), queue.clone()));
        let presence = Arc::new(PresenceTracker::new(backend.clone(), queue.clone(), 300));
        let reconciler =
            Reconciler::new(backend.clone(), queue.clone(), log.clone(), presence.clone());
        Fixture {
            backend,
            queue,
            log,
            presence,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_mark_delivered_requires_viewing_non_sender() {
        let f = setup();
        let (alice, bob) = (uid("alice"), uid("bob"));
        let room = room_key(&alice, &bob);
        let msg = f.log.append(&room, &alice, "hi").await.unwrap();

        assert!(!f.reconciler.mark_delivered(&msg, &bob).await.unwrap());

        f.reconciler.enter_room(&room, &alice);
        assert!(!f.reconciler.mark_delivered(&msg, &alice).await.unwrap());

        f.reconciler.enter_room(&room, &bob);
        assert!(f.reconciler.mark_delivered(&msg, &bob).await.unwrap());
        assert!(!f.reconciler.mark_delivered(&msg, &bob).await.unwrap());

        let snap = f.log.snapshot(&room).await.unwrap();
        assert!(snap[0].is_read_by(&bob));
        assert!(!snap[0].is_read_by(&alice));
    }

    #[tokio::test]
    async fn test_viewing_is_counted() {
        let f = setup();
        let (alice, bob) = (uid("alice"), uid("bob"));
        let room = room_key(&alice, &bob);
        f.reconciler.enter_room(&room, &bob);
        f.reconciler.enter_room(&room, &bob);
        f.reconciler.leave_room(&room, &bob);
        assert!(f.reconciler.is_viewing(&room, &bob));
        f.reconciler.leave_room(&room, &bob);
        assert!(!f.reconciler.is_viewing(&room, &bob));
    }

    #[tokio::test]
    async fn test_mark_all_delivered_and_unread_in_room() {
        let f = setup();
        let (alice, bob) = (uid("alice"), uid("bob"));
        let room = room_key(&alice, &bob);
        for text in ["a", "b", "c"] {
            f.log.append(&room, &alice, text).await.unwrap();
        }
        f.log.append(&room, &bob, "reply").await.unwrap();
        let seen = f.log.snapshot(&room).await.unwrap();

        assert_eq!(f.reconciler.unread_in_room(&room, &bob).await.unwrap(), 3);
        assert_eq!(
            f.reconciler.mark_all_delivered(&room, &seen, &bob).await.unwrap(),
            0
        );

        f.reconciler.enter_room(&room, &bob);
        assert_eq!(
            f.reconciler.mark_all_delivered(&room, &seen, &bob).await.unwrap(),
            3
        );
        assert_eq!(f.reconciler.unread_in_room(&room, &bob).await.unwrap(), 0);
        assert_eq!(f.reconciler.unread_in_room(&room, &alice).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_all_delivered_leaves_later_messages_unread() {
        let f = setup();
        let (alice, bob) = (uid("alice"), uid("bob"));
        let room = room_key(&alice, &bob);
        f.reconciler.enter_room(&room, &bob);

        f.log.append(&room, &alice, "m1").await.unwrap();
        f.log.append(&room, &alice, "m2").await.unwrap();
        let seen = f.log.snapshot(&room).await.unwrap();
        let m3 = f.log.append(&room, &alice, "m3").await.unwrap();

        assert_eq!(
            f.reconciler.mark_all_delivered(&room, &seen, &bob).await.unwrap(),
            2
        );
        let log = f.log.snapshot(&room).await.unwrap();
        assert!(log[..2].iter().all(|m| m.is_read_by(&bob)));
        assert_eq!(log[2].id, m3.id);
        assert!(!log[2].is_read_by(&bob));
        assert_eq!(f.reconciler.unread_in_room(&room, &bob).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_on_send_with_presence_uses_given_reading() {
        let f = setup();
        let (alice, bob) = (uid("alice"), uid("bob"));
        let room = room_key(&alice, &bob);

        // Bob was offline when the sender looked, then came online.
        let msg = f.log.append(&room, &alice, "hi").await.unwrap();
        f.presence.set_online(&bob, true).await.unwrap();
        let n = f
            .reconciler
            .on_send_with_presence(&msg, &bob, false)
            .await
            .unwrap();
        assert_eq!(n.message_id, Some(msg.id));

        let msg = f.log.append(&room, &alice, "again").await.unwrap();
        assert!(f
            .reconciler
            .on_send_with_presence(&msg, &bob, true)
            .await
            .is_none());
        assert_eq!(f.reconciler.unread_notifications(&bob).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_on_send_notifies_only_offline_recipient() {
        let f = setup();
        let (alice, bob) = (uid("alice"), uid("bob"));
        let room = room_key(&alice, &bob);

        let msg = f.log.append(&room, &alice, "are you there").await.unwrap();
        let n = f.reconciler.on_send(&msg, &bob).await.unwrap();
        assert_eq!(n.message_id, Some(msg.id));
        assert!(!n.is_read && n.was_offline);

        f.presence.set_online(&bob, true).await.unwrap();
        let msg = f.log.append(&room, &alice, "hello").await.unwrap();
        assert!(f.reconciler.on_send(&msg, &bob).await.is_none());

        let unread = f.reconciler.unread_notifications(&bob).await.unwrap();
        assert_eq!(unread.len(), 1);
    }

    #[tokio::test]
    async fn test_on_send_rejects_wrong_recipient() {
        let f = setup();
        let (alice, bob) = (uid("alice"), uid("bob"));
        let msg = f
            .log
            .append(&room_key(&alice, &bob), &alice, "hi")
            .await
            .unwrap();
        assert!(f.reconciler.on_send(&msg, &uid("carol")).await.is_none());
        assert!(f.reconciler.on_send(&msg, &alice).await.is_none());
        assert!(f
            .reconciler
            .unread_notifications(&uid("carol"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_summary_counts_and_clears() {
        let f = setup();
        let (alice, bob, carol) = (uid("alice"), uid("bob"), uid("carol"));

        for (from, text) in [(&bob, "one"), (&bob, "two"), (&carol, "three")] {
            let msg = f
                .log
                .append(&room_key(from, &alice), from, text)
                .await
                .unwrap();
            f.reconciler.on_send(&msg, &alice).await;
        }

        let summary = f.reconciler.unread_summary(&alice).await.unwrap();
        assert_eq!(summary[&bob].count, 2);
        assert_eq!(summary[&bob].last_message, "two");
        assert_eq!(summary[&carol].count, 1);

        f.reconciler.mark_notifications_read(&bob, &alice).await.unwrap();
        let summary = f.reconciler.unread_summary(&alice).await.unwrap();
        assert_eq!(summary[&bob].count, 0);
        assert_eq!(summary[&bob].last_message, "two");
        assert_eq!(summary[&carol].count, 1);
    }

    #[tokio::test]
    async fn test_subscription_replaces_drifted_cache() {
        let f = setup();
        let (alice, bob) = (uid("alice"), uid("bob"));
        let room = room_key(&alice, &bob);
        assert!(f.reconciler.unread_summary(&alice).await.unwrap().is_empty());

        // Written behind the reconciler's back.
        f.backend
            .call(|db| {
                let m = db.append_message(&room, &bob, "sneaky")?;
                db.create_notification(&bob, &alice, Some(m.id), "sneaky")
            })
            .await
            .unwrap();
        assert!(f.reconciler.unread_summary(&alice).await.unwrap().is_empty());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _handle = f
            .reconciler
            .subscribe(&alice, move |s: UnreadSummary| sink.lock().unwrap().push(s))
            .await
            .unwrap();
        f.queue.flush().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][&bob].count, 1);
        assert_eq!(
            f.reconciler.unread_summary(&alice).await.unwrap(),
            seen[0].clone()
        );
    }

    #[tokio::test]
    async fn test_notification_only_entry_disappears_when_read() {
        let f = setup();
        let (alice, bob) = (uid("alice"), uid("bob"));
        f.backend
            .call(|db| db.create_notification(&bob, &alice, None, "ping"))
            .await
            .unwrap();

        let summary = f.reconciler.unread_summary(&alice).await.unwrap();
        assert_eq!(summary[&bob].count, 1);
        assert_eq!(summary[&bob].last_seq, None);

        f.reconciler.mark_notifications_read(&bob, &alice).await.unwrap();
        assert_eq!(
            f.reconciler.unread_summary(&alice).await.unwrap(),
            f.reconciler.derive_summary(&alice).await.unwrap()
        );
        assert!(!f
            .reconciler
            .unread_summary(&alice)
            .await
            .unwrap()
            .contains_key(&bob));
    }
}
