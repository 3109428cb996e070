//! Wiring of the engine components around one backing store.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use roomchat_shared::UserId;
use roomchat_store::{Database, RoomPreview, User};

use crate::backend::Backend;
use crate::channels::Channels;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::message_log::MessageLog;
use crate::presence::PresenceTracker;
use crate::queue::EventQueue;
use crate::reconciler::Reconciler;
use crate::subscriptions::SubscriptionManager;

/// Another user as shown in a conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerListing {
    pub user: User,
    /// Latest message exchanged with this user, if any.
    pub preview: Option<RoomPreview>,
}

pub struct Engine {
    config: SyncConfig,
    queue: EventQueue,
    backend: Backend,
    log: Arc<MessageLog>,
    presence: Arc<PresenceTracker>,
    reconciler: Arc<Reconciler>,
    subscriptions: Arc<SubscriptionManager>,
    channels: Arc<Channels>,
}

impl Engine {
    /// Open the database named by `config` and start the engine.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(config: SyncConfig) -> Result<Arc<Self>> {
        let db = Database::open_at(&config.database_path)?;
        Ok(Self::with_database(db, config))
    }

    /// Start the engine over an already opened database.
    pub fn with_database(db: Database, config: SyncConfig) -> Arc<Self> {
        match db.path() {
            Some(path) => info!(path = %path.display(), "engine starting"),
            None => info!("engine starting on an in-memory store"),
        }
        let queue = EventQueue::start();
        let backend = Backend::new(db);
        let log = Arc::new(MessageLog::new(backend.clone(), queue.clone()));
        let presence = Arc::new(PresenceTracker::new(
            backend.clone(),
            queue.clone(),
            config.active_window_secs,
        ));
        let reconciler = Arc::new(Reconciler::new(
            backend.clone(),
            queue.clone(),
            log.clone(),
            presence.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(
            queue.clone(),
            log.clone(),
            presence.clone(),
            reconciler.clone(),
        ));
        let channels = Arc::new(Channels::new(backend.clone()));

        Arc::new(Self {
            config,
            queue,
            backend,
            log,
            presence,
            reconciler,
            subscriptions,
            channels,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn messages(&self) -> &Arc<MessageLog> {
        &self.log
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn channels(&self) -> &Arc<Channels> {
        &self.channels
    }

    /// Wait until every callback queued so far has run.
    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    // ------------------------------------------------------------------
    // User directory
    // ------------------------------------------------------------------

    /// Create or update a user profile. Presence is not touched.
    pub async fn register_user(
        &self,
        id: &UserId,
        display_name: Option<&str>,
        avatar_ref: Option<&str>,
    ) -> Result<User> {
        let user = self
            .backend
            .call(|db| db.upsert_user(id, display_name, avatar_ref))
            .await?;
        info!(user = %id, "user registered");
        Ok(user)
    }

    pub async fn user(&self, id: &UserId) -> Result<User> {
        self.backend.call(|db| db.get_user(id)).await
    }

    pub async fn users(&self) -> Result<Vec<User>> {
        self.backend.call(|db| db.list_users()).await
    }

    /// Every other user, with the latest message exchanged with each.
    pub async fn list_peers(&self, me: &UserId) -> Result<Vec<PeerListing>> {
        let (users, previews) = self
            .backend
            .call(|db| Ok((db.list_users()?, db.list_room_previews(me)?)))
            .await?;

        let mut peers: Vec<PeerListing> = users
            .into_iter()
            .filter(|u| u.id != *me)
            .map(|user| {
                let preview = previews.iter().find(|p| p.peer == user.id).cloned();
                PeerListing { user, preview }
            })
            .collect();
        // Most recent conversations first, then users never talked to.
        peers.sort_by(|a, b| {
            let a_ts = a.preview.as_ref().map(|p| p.last_timestamp);
            let b_ts = b.preview.as_ref().map(|p| p.last_timestamp);
            b_ts.cmp(&a_ts).then_with(|| a.user.id.cmp(&b.user.id))
        });
        Ok(peers)
    }

    /// Re-read every watched room and user and deliver what changed.
    ///
    /// Picks up writes made by other processes sharing the store. Returns the
    /// number of feeds that delivered.
    pub async fn refresh(&self) -> Result<usize> {
        let mut changed = 0;
        for room in self.log.watched_rooms() {
            changed += usize::from(self.log.refresh(&room).await?);
        }
        for user in self.presence.watched_users() {
            changed += usize::from(self.presence.refresh(&user).await?);
        }
        for user in self.reconciler.watched_users() {
            changed += usize::from(self.reconciler.refresh(&user).await?);
        }
        if changed > 0 {
            debug!(changed, "refresh delivered updates");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomchat_shared::room_key;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn engine() -> Arc<Engine> {
        Engine::with_database(Database::open_in_memory().unwrap(), SyncConfig::default())
    }

    #[tokio::test]
    async fn test_register_merges_profile() {
        let engine = engine();
        let alice = uid("alice");
        engine
            .register_user(&alice, Some("Alice"), None)
            .await
            .unwrap();
        let user = engine
            .register_user(&alice, None, Some("avatars/alice.png"))
            .await
            .unwrap();
        assert_eq!(user.display_name.as_deref(), Some("Alice"));
        assert_eq!(user.avatar_ref.as_deref(), Some("avatars/alice.png"));
        assert_eq!(engine.users().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_peers_orders_by_latest_message() {
        let engine = engine();
        let (alice, bob, carol, dave) = (uid("alice"), uid("bob"), uid("carol"), uid("dave"));
        for u in [&alice, &bob, &carol, &dave] {
            engine.register_user(u, None, None).await.unwrap();
        }
        engine
            .messages()
            .append(&room_key(&alice, &bob), &bob, "older")
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        engine
            .messages()
            .append(&room_key(&alice, &carol), &alice, "newer")
            .await
            .unwrap();

        let peers = engine.list_peers(&alice).await.unwrap();
        let ids: Vec<_> = peers.iter().map(|p| p.user.id.as_str()).collect();
        assert_eq!(ids, vec!["carol", "bob", "dave"]);
        assert_eq!(peers[0].preview.as_ref().unwrap().last_message, "newer");
        assert!(peers[2].preview.is_none());
    }

    #[tokio::test]
    async fn test_user_not_found() {
        let engine = engine();
        let err = engine.user(&uid("ghost")).await.unwrap_err();
        assert!(matches!(err, roomchat_shared::SyncError::NotFound(_)));
    }
}
