//! Subscription Manager.
//!
//! Central bookkeeping for every live feed. There is at most one underlying
//! subscription per [`SubscriptionKey`]; additional consumers of the same key
//! share it and are counted. The underlying subscription is closed when the
//! last consumer releases.
//!
//! Consumers hold a [`SubscriptionGuard`] that releases on drop, so every exit
//! path (including `?` and panics) gives the subscription back. Guards can be
//! grouped in a [`SubscriptionScope`]; ending the scope force-releases any
//! guard that is still live and reports it as a leak.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use roomchat_shared::{RoomKey, UserId};
use roomchat_store::PresenceRecord;

use crate::error::Result;
use crate::feed::{lock, Callback, SubscriptionHandle};
use crate::message_log::{MessageLog, Snapshot};
use crate::presence::PresenceTracker;
use crate::queue::EventQueue;
use crate::reconciler::{Reconciler, UnreadSummary};

static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// What a subscription watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    Room(RoomKey),
    Presence(UserId),
    Unread(UserId),
}

impl SubscriptionKey {
    pub fn kind(&self) -> &'static str {
        match self {
            SubscriptionKey::Room(_) => "messages",
            SubscriptionKey::Presence(_) => "presence",
            SubscriptionKey::Unread(_) => "unread",
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionKey::Room(room) => write!(f, "messages:{room}"),
            SubscriptionKey::Presence(user) => write!(f, "presence:{user}"),
            SubscriptionKey::Unread(user) => write!(f, "unread:{user}"),
        }
    }
}

/// A value delivered to consumers.
#[derive(Debug, Clone)]
pub enum Update {
    Messages(Snapshot),
    Presence(PresenceRecord),
    Unread(UnreadSummary),
}

struct Consumer {
    id: u64,
    scope: Option<u64>,
    active: Arc<AtomicBool>,
    /// Set once any value has reached this consumer.
    delivered: Arc<AtomicBool>,
    callback: Callback<Update>,
}

struct Entry {
    /// `None` only while the underlying subscription is being opened.
    handle: Option<SubscriptionHandle>,
    consumers: Vec<Consumer>,
    last: Option<Update>,
}

struct ScopeRecord {
    label: String,
    members: Vec<(SubscriptionKey, u64)>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<SubscriptionKey, Entry>,
    scopes: HashMap<u64, ScopeRecord>,
}

/// Group of consumers that share a lifetime, such as one open conversation.
#[derive(Debug)]
pub struct SubscriptionScope {
    id: u64,
    label: String,
}

impl SubscriptionScope {
    pub fn label(&self) -> &str {
        &self.label
    }
}

pub struct SubscriptionManager {
    queue: EventQueue,
    log: Arc<MessageLog>,
    presence: Arc<PresenceTracker>,
    reconciler: Arc<Reconciler>,
    registry: Arc<Mutex<Registry>>,
    /// Serializes opening so two consumers of a new key share one subscription.
    opening: tokio::sync::Mutex<()>,
}

impl SubscriptionManager {
    pub fn new(
        queue: EventQueue,
        log: Arc<MessageLog>,
        presence: Arc<PresenceTracker>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            queue,
            log,
            presence,
            reconciler,
            registry: Arc::new(Mutex::new(Registry::default())),
            opening: tokio::sync::Mutex::new(()),
        }
    }

    pub fn open_scope(&self, label: impl Into<String>) -> SubscriptionScope {
        let id = NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        lock(&self.registry).scopes.insert(
            id,
            ScopeRecord {
                label: label.clone(),
                members: Vec::new(),
            },
        );
        debug!(scope = %label, id, "subscription scope opened");
        SubscriptionScope { id, label }
    }

    /// End `scope`, releasing anything it still holds. Returns how many
    /// consumers had leaked.
    pub fn end_scope(&self, scope: SubscriptionScope) -> usize {
        let record = lock(&self.registry).scopes.remove(&scope.id);
        let Some(record) = record else {
            return 0;
        };
        let leaked = record.members.len();
        if leaked > 0 {
            warn!(
                scope = %record.label,
                leaked,
                "scope ended with live subscriptions, releasing them"
            );
        }
        for (key, consumer) in record.members {
            release(&self.registry, &key, consumer);
        }
        debug!(scope = %scope.label, "subscription scope ended");
        leaked
    }

    /// Start consuming `key`. Reuses the live subscription if there is one,
    /// in which case the last delivered value is replayed to the new consumer.
    pub async fn acquire(
        &self,
        key: SubscriptionKey,
        scope: Option<&SubscriptionScope>,
        on_update: impl Fn(Update) + Send + Sync + 'static,
    ) -> Result<SubscriptionGuard> {
        let _opening = self.opening.lock().await;

        let consumer_id = NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let consumer = Consumer {
            id: consumer_id,
            scope: scope.map(|s| s.id),
            active: active.clone(),
            delivered: Arc::new(AtomicBool::new(false)),
            callback: Arc::new(on_update),
        };

        let needs_open = {
            let mut registry = lock(&self.registry);
            let needs_open = match registry.entries.get_mut(&key) {
                Some(entry) => {
                    // `last` is read when the job runs; a newer value may
                    // already be queued ahead of it.
                    let registry = Arc::downgrade(&self.registry);
                    let replay_key = key.clone();
                    self.queue
                        .dispatch(move || replay(&registry, &replay_key, consumer_id));
                    entry.consumers.push(consumer);
                    false
                }
                None => {
                    registry.entries.insert(
                        key.clone(),
                        Entry {
                            handle: None,
                            consumers: vec![consumer],
                            last: None,
                        },
                    );
                    true
                }
            };
            if let Some(scope) = scope {
                if let Some(record) = registry.scopes.get_mut(&scope.id) {
                    record.members.push((key.clone(), consumer_id));
                }
            }
            needs_open
        };

        if needs_open {
            match self.open_underlying(&key).await {
                Ok(handle) => {
                    if let Some(entry) = lock(&self.registry).entries.get_mut(&key) {
                        entry.handle = Some(handle);
                    }
                    debug!(key = %key, "subscription opened");
                }
                Err(e) => {
                    release(&self.registry, &key, consumer_id);
                    return Err(e);
                }
            }
        } else {
            debug!(key = %key, consumer = consumer_id, "subscription shared");
        }

        Ok(SubscriptionGuard {
            key,
            consumer_id,
            active,
            registry: Arc::downgrade(&self.registry),
            released: false,
        })
    }

    /// Live keys and how many consumers each has.
    pub fn live_subscriptions(&self) -> Vec<(SubscriptionKey, usize)> {
        lock(&self.registry)
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.consumers.len()))
            .collect()
    }

    pub fn consumer_count(&self, key: &SubscriptionKey) -> usize {
        lock(&self.registry)
            .entries
            .get(key)
            .map_or(0, |e| e.consumers.len())
    }

    async fn open_underlying(&self, key: &SubscriptionKey) -> Result<SubscriptionHandle> {
        let fan_out = fan_out(Arc::downgrade(&self.registry), key.clone());
        match key {
            SubscriptionKey::Room(room) => {
                self.log
                    .subscribe(room, move |snap| fan_out(Update::Messages(snap)))
                    .await
            }
            SubscriptionKey::Presence(user) => {
                self.presence
                    .subscribe(user, move |record| fan_out(Update::Presence(record)))
                    .await
            }
            SubscriptionKey::Unread(user) => {
                self.reconciler
                    .subscribe(user, move |summary| fan_out(Update::Unread(summary)))
                    .await
            }
        }
    }
}

/// Callback for the underlying feed: remember the value and hand it to every
/// active consumer. Runs on the event queue.
fn fan_out(registry: Weak<Mutex<Registry>>, key: SubscriptionKey) -> impl Fn(Update) + Send + Sync {
    move |update: Update| {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        let targets: Vec<(Arc<AtomicBool>, Callback<Update>)> = {
            let mut registry = lock(&registry);
            let Some(entry) = registry.entries.get_mut(&key) else {
                return;
            };
            entry.last = Some(update.clone());
            entry
                .consumers
                .iter()
                .map(|c| {
                    c.delivered.store(true, Ordering::Release);
                    (c.active.clone(), c.callback.clone())
                })
                .collect()
        };
        // Called without the registry lock so a callback may release its guard.
        for (active, callback) in targets {
            if active.load(Ordering::Acquire) {
                callback(update.clone());
            }
        }
    }
}

/// First delivery to a consumer that joined a live subscription: the latest
/// value at the time the job runs. Skipped if a regular delivery got there
/// first, or if nothing has been delivered on this key yet.
fn replay(registry: &Weak<Mutex<Registry>>, key: &SubscriptionKey, consumer_id: u64) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let target = {
        let registry = lock(&registry);
        registry.entries.get(key).and_then(|entry| {
            let consumer = entry.consumers.iter().find(|c| c.id == consumer_id)?;
            let last = entry.last.clone()?;
            if consumer.delivered.swap(true, Ordering::AcqRel) {
                return None;
            }
            Some((consumer.active.clone(), consumer.callback.clone(), last))
        })
    };
    if let Some((active, callback, last)) = target {
        if active.load(Ordering::Acquire) {
            callback(last);
        }
    }
}

fn release(registry: &Mutex<Registry>, key: &SubscriptionKey, consumer_id: u64) {
    let closing = {
        let mut registry = lock(registry);
        let Some(entry) = registry.entries.get_mut(key) else {
            return;
        };
        let Some(pos) = entry.consumers.iter().position(|c| c.id == consumer_id) else {
            return;
        };
        let consumer = entry.consumers.remove(pos);
        consumer.active.store(false, Ordering::Release);

        if let Some(scope) = consumer.scope {
            if let Some(record) = registry.scopes.get_mut(&scope) {
                record
                    .members
                    .retain(|(k, id)| !(k == key && *id == consumer_id));
            }
        }

        let now_empty = registry
            .entries
            .get(key)
            .is_some_and(|e| e.consumers.is_empty());
        if now_empty {
            registry.entries.remove(key).and_then(|e| e.handle)
        } else {
            None
        }
    };

    // Closed outside the registry lock; the feed takes its own lock.
    if let Some(mut handle) = closing {
        handle.close();
        debug!(key = %key, "subscription closed");
    }
}

/// One consumer's claim on a shared subscription.
pub struct SubscriptionGuard {
    key: SubscriptionKey,
    consumer_id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<Mutex<Registry>>,
    released: bool,
}

impl SubscriptionGuard {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// False once released, either explicitly or by the end of its scope.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivery to this consumer. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.active.store(false, Ordering::Release);
        if let Some(registry) = self.registry.upgrade() {
            release(&registry, &self.key, self.consumer_id);
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("key", &self.key)
            .field("consumer", &self.consumer_id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use roomchat_shared::{room_key, SyncError};
    use roomchat_store::Database;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    struct Fixture {
        queue: EventQueue,
        log: Arc<MessageLog>,
        presence: Arc<PresenceTracker>,
        reconciler: Arc<Reconciler>,
        manager: SubscriptionManager,
    }

    fn setup() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user(&uid("alice"), None, None).unwrap();
        db.upsert_user(&uid("bob"), None, None).unwrap();
        let backend = Backend::new(db);
        let queue = EventQueue::start();
        let log = Arc::new(MessageLog::new(backend.clone(), queue.clone()));
        let presence = Arc::new(PresenceTracker::new(backend.clone(), queue.clone(), 300));
        let reconciler = Arc::new(Reconciler::new(
            backend,
            queue.clone(),
            log.clone(),
            presence.clone(),
        ));
        let manager = SubscriptionManager::new(
            queue.clone(),
            log.clone(),
            presence.clone(),
            reconciler.clone(),
        );
        Fixture {
            queue,
            log,
            presence,
            reconciler,
            manager,
        }
    }

    fn counter() -> (Arc<Mutex<usize>>, impl Fn(Update) + Send + Sync + 'static) {
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        (count, move |_u: Update| *sink.lock().unwrap() += 1)
    }

    #[tokio::test]
    async fn test_same_key_shares_one_subscription() {
        let f = setup();
        let room = room_key(&uid("alice"), &uid("bob"));
        let key = SubscriptionKey::Room(room.clone());

        let (first_count, first_cb) = counter();
        let (second_count, second_cb) = counter();
        let mut first = f.manager.acquire(key.clone(), None, first_cb).await.unwrap();
        f.queue.flush().await;
        let second = f.manager.acquire(key.clone(), None, second_cb).await.unwrap();
        f.queue.flush().await;

        assert_eq!(f.log.subscriber_count(&room), 1);
        assert_eq!(f.manager.consumer_count(&key), 2);
        // The second consumer got the replayed snapshot.
        assert_eq!(*second_count.lock().unwrap(), 1);

        f.log.append(&room, &uid("alice"), "hi").await.unwrap();
        f.queue.flush().await;
        assert_eq!(*first_count.lock().unwrap(), 2);
        assert_eq!(*second_count.lock().unwrap(), 2);

        first.release();
        first.release();
        assert_eq!(f.log.subscriber_count(&room), 1);
        drop(second);
        assert_eq!(f.log.subscriber_count(&room), 0);
        assert!(f.manager.live_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_joining_consumer_never_gets_older_snapshot() {
        let f = setup();
        let room = room_key(&uid("alice"), &uid("bob"));
        let key = SubscriptionKey::Room(room.clone());

        let _first = f.manager.acquire(key.clone(), None, |_| {}).await.unwrap();
        f.queue.flush().await;

        // The one-message snapshot is queued before the second consumer joins.
        f.log.append(&room, &uid("alice"), "hi").await.unwrap();
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let sink = lengths.clone();
        let _second = f
            .manager
            .acquire(key, None, move |update| {
                if let Update::Messages(snapshot) = update {
                    sink.lock().unwrap().push(snapshot.len());
                }
            })
            .await
            .unwrap();
        f.queue.flush().await;

        assert_eq!(*lengths.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_unread_key_is_shared_and_replayed() {
        let f = setup();
        let (alice, bob) = (uid("alice"), uid("bob"));
        let key = SubscriptionKey::Unread(bob.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _first = f
            .manager
            .acquire(key.clone(), None, move |update| {
                if let Update::Unread(summary) = update {
                    sink.lock().unwrap().push(summary);
                }
            })
            .await
            .unwrap();
        f.queue.flush().await;

        let room = room_key(&alice, &bob);
        let msg = f.log.append(&room, &alice, "ping").await.unwrap();
        f.reconciler.on_send(&msg, &bob).await.unwrap();
        f.queue.flush().await;

        let (late_count, late_cb) = counter();
        let _second = f.manager.acquire(key.clone(), None, late_cb).await.unwrap();
        f.queue.flush().await;

        assert_eq!(f.manager.consumer_count(&key), 2);
        assert_eq!(f.reconciler.watched_users(), vec![bob.clone()]);
        assert_eq!(*late_count.lock().unwrap(), 1);

        let seen = seen.lock().unwrap();
        let latest = seen.last().unwrap();
        assert_eq!(latest[&alice].count, 1);
        assert_eq!(latest[&alice].last_message, "ping");
    }

    #[tokio::test]
    async fn test_released_guard_gets_nothing() {
        let f = setup();
        let alice = uid("alice");
        let key = SubscriptionKey::Presence(alice.clone());
        let (count, cb) = counter();

        let mut guard = f.manager.acquire(key, None, cb).await.unwrap();
        f.queue.flush().await;
        assert_eq!(*count.lock().unwrap(), 1);

        f.presence.set_online(&alice, true).await.unwrap();
        guard.release();
        f.presence.set_online(&alice, false).await.unwrap();
        f.queue.flush().await;

        assert_eq!(*count.lock().unwrap(), 1);
        assert!(!guard.is_active());
    }

    #[tokio::test]
    async fn test_end_scope_releases_leaked_guards() {
        let f = setup();
        let (alice, bob) = (uid("alice"), uid("bob"));
        let scope = f.manager.open_scope("conversation");
        assert_eq!(scope.label(), "conversation");

        let room_guard = f
            .manager
            .acquire(SubscriptionKey::Room(room_key(&alice, &bob)), Some(&scope), |_| {})
            .await
            .unwrap();
        let mut presence_guard = f
            .manager
            .acquire(SubscriptionKey::Presence(bob.clone()), Some(&scope), |_| {})
            .await
            .unwrap();
        presence_guard.release();

        assert_eq!(f.manager.end_scope(scope), 1);
        assert!(!room_guard.is_active());
        assert!(f.manager.live_subscriptions().is_empty());
        drop(room_guard);
    }

    #[tokio::test]
    async fn test_failed_open_leaves_nothing_behind() {
        let f = setup();
        let err = f
            .manager
            .acquire(SubscriptionKey::Presence(uid("ghost")), None, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        assert!(f.manager.live_subscriptions().is_empty());
    }
}
