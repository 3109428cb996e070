//! Keyed change feeds with snapshot delivery.
//!
//! A [`Feed`] keeps the listeners registered per key and pushes every
//! published value to each of them through the [`EventQueue`]. Values are
//! full snapshots, never diffs. Each listener carries an `active` flag that
//! is checked again when the queued delivery runs, so a delivery that was
//! already in flight when its handle closed is discarded.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use crate::queue::EventQueue;

/// Callback invoked with each delivered value.
pub type Callback<T> = Arc<dyn Fn(T) + Send + Sync + 'static>;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lock a std mutex, recovering the data if a callback panicked while holding it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Listener<T> {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback<T>,
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            active: self.active.clone(),
            callback: self.callback.clone(),
        }
    }
}

struct FeedInner<K, T> {
    listeners: HashMap<K, Vec<Listener<T>>>,
    /// Last value published per key that still has listeners.
    last: HashMap<K, T>,
}

pub struct Feed<K, T> {
    kind: &'static str,
    queue: EventQueue,
    inner: Arc<Mutex<FeedInner<K, T>>>,
}

impl<K, T> Feed<K, T>
where
    K: Eq + Hash + Clone + fmt::Display + Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new(kind: &'static str, queue: EventQueue) -> Self {
        Self {
            kind,
            queue,
            inner: Arc::new(Mutex::new(FeedInner {
                listeners: HashMap::new(),
                last: HashMap::new(),
            })),
        }
    }

    /// Register a listener and queue `initial` to it before any later publish.
    pub fn subscribe(&self, key: K, initial: T, callback: Callback<T>) -> SubscriptionHandle {
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let listener = Listener {
            id,
            active: active.clone(),
            callback,
        };

        {
            let mut inner = lock(&self.inner);
            inner
                .listeners
                .entry(key.clone())
                .or_default()
                .push(listener.clone());
            inner.last.insert(key.clone(), initial.clone());
            // Enqueued under the registry lock so it cannot overtake a publish.
            self.deliver(&listener, initial);
        }

        debug!(kind = self.kind, key = %key, id, "subscription opened");

        let weak: Weak<Mutex<FeedInner<K, T>>> = Arc::downgrade(&self.inner);
        let detach_key = key.clone();
        let kind = self.kind;
        SubscriptionHandle {
            id,
            kind,
            key: key.to_string(),
            active,
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut inner = lock(&inner);
                    let now_empty = match inner.listeners.get_mut(&detach_key) {
                        Some(list) => {
                            list.retain(|l| l.id != id);
                            list.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        inner.listeners.remove(&detach_key);
                        inner.last.remove(&detach_key);
                    }
                }
                debug!(kind, key = %detach_key, id, "subscription closed");
            })),
        }
    }

    /// Deliver `value` to every listener of `key`.
    pub fn publish(&self, key: &K, value: T) -> usize {
        let mut inner = lock(&self.inner);
        self.publish_locked(&mut inner, key, value)
    }

    /// Publish only if `value` differs from the last value delivered for `key`.
    ///
    /// The comparison and the publish happen under one lock, so concurrent
    /// callers with the same value deliver it once.
    pub fn publish_if_changed(&self, key: &K, value: T) -> bool
    where
        T: PartialEq,
    {
        let mut inner = lock(&self.inner);
        let unchanged = match inner.last.get(key) {
            Some(last) => *last == value,
            None => !inner.listeners.contains_key(key),
        };
        if unchanged {
            return false;
        }
        self.publish_locked(&mut inner, key, value) > 0
    }

    pub fn listener_count(&self, key: &K) -> usize {
        lock(&self.inner).listeners.get(key).map_or(0, Vec::len)
    }

    /// Keys that currently have at least one listener.
    pub fn keys(&self) -> Vec<K> {
        lock(&self.inner).listeners.keys().cloned().collect()
    }

    fn publish_locked(&self, inner: &mut FeedInner<K, T>, key: &K, value: T) -> usize {
        let listeners = match inner.listeners.get(key) {
            Some(list) => list.clone(),
            None => return 0,
        };
        inner.last.insert(key.clone(), value.clone());
        for listener in &listeners {
            self.deliver(listener, value.clone());
        }
        listeners.len()
    }

    fn deliver(&self, listener: &Listener<T>, value: T) {
        let active = listener.active.clone();
        let callback = listener.callback.clone();
        self.queue.dispatch(move || {
            if active.load(Ordering::Acquire) {
                callback(value);
            }
        });
    }
}

/// Live subscription. Closing is idempotent; dropping the handle closes it.
pub struct SubscriptionHandle {
    id: u64,
    kind: &'static str,
    key: String,
    active: Arc<AtomicBool>,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivery. Deliveries already queued for this handle are discarded.
    pub fn close(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}
