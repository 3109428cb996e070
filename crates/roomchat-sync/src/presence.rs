//! Presence Tracker.
//!
//! `Offline -> Online` on conversation enter, `Online -> Offline` on exit or
//! connection loss. Connection loss is detected by the transport, which
//! calls [`PresenceTracker::set_online`] with `false`.
//!
//! `is_online` and `is_recently_active` never fail: if the store cannot be
//! read the last known value is used, and an unknown user reads as offline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use tracing::{debug, warn};

use roomchat_shared::UserId;
use roomchat_store::PresenceRecord;

use crate::backend::Backend;
use crate::error::Result;
use crate::feed::{lock, Feed, SubscriptionHandle};
use crate::queue::EventQueue;

pub struct PresenceTracker {
    backend: Backend,
    feed: Feed<UserId, PresenceRecord>,
    active_window: Duration,
    last_known: Mutex<HashMap<UserId, PresenceRecord>>,
}

impl PresenceTracker {
    pub fn new(backend: Backend, queue: EventQueue, active_window_secs: u64) -> Self {
        let secs = i64::try_from(active_window_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1_000);
        Self {
            backend,
            feed: Feed::new("presence", queue),
            active_window: Duration::seconds(secs),
            last_known: Mutex::new(HashMap::new()),
        }
    }

    /// Write `online` and refresh `lastSeen` for `user`.
    pub async fn set_online(&self, user: &UserId, online: bool) -> Result<PresenceRecord> {
        let db = self.backend.lock().await?;
        let record = db.set_presence(user, online)?;
        debug!(user = %user, online, "presence updated");
        self.remember(&record);
        self.feed.publish(user, record.clone());
        Ok(record)
    }

    /// Live presence of a single user. Fails with `NotFound` for unknown users.
    pub async fn subscribe(
        &self,
        user: &UserId,
        on_change: impl Fn(PresenceRecord) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle> {
        let db = self.backend.lock().await?;
        let record = db.get_presence(user)?;
        self.remember(&record);
        Ok(self.feed.subscribe(user.clone(), record, Arc::new(on_change)))
    }

    /// Strict point read.
    pub async fn presence(&self, user: &UserId) -> Result<PresenceRecord> {
        let record = self.backend.call(|db| db.get_presence(user)).await?;
        self.remember(&record);
        Ok(record)
    }

    /// Whether `user` is online right now, degrading to the last known value.
    ///
    /// The answer may be stale by the time the caller acts on it.
    pub async fn is_online(&self, user: &UserId) -> bool {
        self.read_degraded(user).await.is_some_and(|r| r.online)
    }

    /// Online, or last seen within the active window.
    pub async fn is_recently_active(&self, user: &UserId) -> bool {
        let Some(record) = self.read_degraded(user).await else {
            return false;
        };
        record.online
            || record
                .last_seen
                .is_some_and(|seen| Utc::now().signed_duration_since(seen) <= self.active_window)
    }

    /// Re-read `user` and deliver it if it changed since the last delivery.
    pub async fn refresh(&self, user: &UserId) -> Result<bool> {
        if self.feed.listener_count(user) == 0 {
            return Ok(false);
        }
        let db = self.backend.lock().await?;
        let record = db.get_presence(user)?;
        self.remember(&record);
        Ok(self.feed.publish_if_changed(user, record))
    }

    /// Users whose presence currently has subscribers.
    pub fn watched_users(&self) -> Vec<UserId> {
        self.feed.keys()
    }

    async fn read_degraded(&self, user: &UserId) -> Option<PresenceRecord> {
        match self.presence(user).await {
            Ok(record) => Some(record),
            Err(e) => {
                let cached = lock(&self.last_known).get(user).cloned();
                warn!(
                    user = %user,
                    error = %e,
                    cached = cached.is_some(),
                    "presence read failed, using last known value"
                );
                cached
            }
        }
    }

    fn remember(&self, record: &PresenceRecord) {
        lock(&self.last_known).insert(record.user_id.clone(), record.clone());
    }
}
