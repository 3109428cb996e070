//! Per-device session: who is signed in, and which conversation is open.
//!
//! The bookkeeping lives in a local key-value database separate from the
//! backing store, so a restarted process can pick up where it left off.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use roomchat_shared::constants::{
    SESSION_KEY_ACTIVE_CHANNEL, SESSION_KEY_ACTIVE_ROOM, SESSION_KEY_CURRENT_USER,
};
use roomchat_shared::{ChannelCode, ChannelId, RoomKey, SyncError, UserId};
use roomchat_store::{Channel, Database};

use crate::conversation::Conversation;
use crate::engine::Engine;
use crate::error::Result;

/// Local session key-value store.
#[derive(Clone)]
pub struct SessionStore {
    db: Arc<Mutex<Database>>,
}

impl SessionStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_database(Database::open_at(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub async fn current_user(&self) -> Result<Option<UserId>> {
        Ok(self.db.lock().await.session_get(SESSION_KEY_CURRENT_USER)?)
    }

    pub async fn set_current_user(&self, user: Option<&UserId>) -> Result<()> {
        self.put(SESSION_KEY_CURRENT_USER, user).await
    }

    pub async fn active_room(&self) -> Result<Option<RoomKey>> {
        Ok(self.db.lock().await.session_get(SESSION_KEY_ACTIVE_ROOM)?)
    }

    pub async fn set_active_room(&self, room: Option<&RoomKey>) -> Result<()> {
        self.put(SESSION_KEY_ACTIVE_ROOM, room).await
    }

    pub async fn active_channel(&self) -> Result<Option<ChannelId>> {
        Ok(self.db.lock().await.session_get(SESSION_KEY_ACTIVE_CHANNEL)?)
    }

    pub async fn set_active_channel(&self, channel: Option<&ChannelId>) -> Result<()> {
        self.put(SESSION_KEY_ACTIVE_CHANNEL, channel).await
    }

    /// Forget everything tied to the signed-in user.
    async fn clear(&self) -> Result<()> {
        self.set_current_user(None).await?;
        self.set_active_room(None).await?;
        self.set_active_channel(None).await
    }

    async fn put<T: serde::Serialize>(&self, key: &str, value: Option<&T>) -> Result<()> {
        let db = self.db.lock().await;
        match value {
            Some(value) => db.session_set(key, value)?,
            None => {
                db.session_remove(key)?;
            }
        }
        Ok(())
    }
}

/// A signed-in user on this device.
pub struct Session {
    engine: Arc<Engine>,
    store: SessionStore,
    user: UserId,
}

impl Session {
    /// Sign in as `user`, who must already exist in the directory.
    pub async fn login(engine: Arc<Engine>, store: SessionStore, user: UserId) -> Result<Self> {
        engine.user(&user).await?;
        store.set_current_user(Some(&user)).await?;
        info!(user = %user, "session started");
        Ok(Self { engine, store, user })
    }

    /// Restore the session persisted by an earlier process, if any.
    ///
    /// A persisted user that no longer exists clears the session.
    pub async fn resume(engine: Arc<Engine>, store: SessionStore) -> Result<Option<Self>> {
        let Some(user) = store.current_user().await? else {
            return Ok(None);
        };
        match engine.user(&user).await {
            Ok(_) => {
                info!(user = %user, "session resumed");
                Ok(Some(Self { engine, store, user }))
            }
            Err(SyncError::NotFound(_)) => {
                store.clear().await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Room that was open when the session was last persisted.
    pub async fn active_room(&self) -> Result<Option<RoomKey>> {
        self.store.active_room().await
    }

    /// Open the conversation with `peer`.
    pub async fn open_conversation(&self, peer: &UserId) -> Result<Conversation> {
        Conversation::open(
            self.engine.clone(),
            self.store.clone(),
            self.user.clone(),
            peer.clone(),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    /// Channel this device is in, if any.
    pub async fn active_channel(&self) -> Result<Option<ChannelId>> {
        self.store.active_channel().await
    }

    /// Create a channel and enter it.
    pub async fn create_channel(&self, name: &str, max_members: u32) -> Result<Channel> {
        let channel = self
            .engine
            .channels()
            .create(&self.user, name, max_members)
            .await?;
        self.store.set_active_channel(Some(&channel.id)).await?;
        Ok(channel)
    }

    /// Join the channel with `code` and enter it.
    pub async fn join_channel(&self, code: &ChannelCode) -> Result<Channel> {
        let channel = self.engine.channels().join(&self.user, code).await?;
        self.store.set_active_channel(Some(&channel.id)).await?;
        Ok(channel)
    }

    /// Leave the channel this device is in. Returns the channel left, if any.
    pub async fn leave_channel(&self) -> Result<Option<ChannelId>> {
        let Some(channel) = self.store.active_channel().await? else {
            return Ok(None);
        };
        match self.engine.channels().leave(&channel, &self.user).await {
            Ok(_) | Err(SyncError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.store.set_active_channel(None).await?;
        Ok(Some(channel))
    }

    /// Forget the signed-in user on this device.
    pub async fn logout(self) -> Result<()> {
        self.store.clear().await?;
        info!(user = %self.user, "session ended");
        Ok(())
    }
}
