//! One open two-party conversation.
//!
//! Opening follows the usual flow: compute the room key, mark ourselves
//! online, take the room and peer-presence feeds from the subscription
//! manager, register as a viewer, and clear the peer's notifications.
//! Everything acquired here belongs to one subscription scope, so leaving
//! (or dropping the conversation) releases all of it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use roomchat_shared::constants::MAX_MESSAGE_TEXT_LEN;
use roomchat_shared::{room_key, RoomKey, SyncError, UserId};
use roomchat_store::{Message, PresenceRecord};

use crate::engine::Engine;
use crate::error::{Result, SendError};
use crate::message_log::Snapshot;
use crate::session::SessionStore;
use crate::subscriptions::{SubscriptionGuard, SubscriptionKey, SubscriptionScope, Update};

/// Something the conversation view should render.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    /// Full ordered log of the room.
    Messages(Snapshot),
    /// The peer's presence changed.
    PeerPresence(PresenceRecord),
}

pub struct Conversation {
    engine: Arc<Engine>,
    store: SessionStore,
    me: UserId,
    peer: UserId,
    room: RoomKey,
    scope: Option<SubscriptionScope>,
    guards: Vec<SubscriptionGuard>,
    events: mpsc::UnboundedReceiver<ConversationEvent>,
    viewing: bool,
    left: bool,
}

impl Conversation {
    pub(crate) async fn open(
        engine: Arc<Engine>,
        store: SessionStore,
        me: UserId,
        peer: UserId,
    ) -> Result<Self> {
        if me == peer {
            return Err(SyncError::InvalidInput(
                "cannot open a conversation with yourself".into(),
            ));
        }
        engine.user(&peer).await?;

        let room = room_key(&me, &peer);
        engine.presence().set_online(&me, true).await?;

        let (tx, events) = mpsc::unbounded_channel();
        let scope = engine
            .subscriptions()
            .open_scope(format!("conversation {room}"));
        let mut conversation = Self {
            engine: engine.clone(),
            store,
            me,
            peer,
            room,
            scope: Some(scope),
            guards: Vec::new(),
            events,
            viewing: false,
            left: false,
        };

        if let Err(e) = conversation.attach(tx).await {
            conversation.detach();
            conversation.left = true;
            if let Err(offline) = engine.presence().set_online(&conversation.me, false).await {
                warn!(error = %offline, "could not mark offline after failed open");
            }
            return Err(e);
        }

        info!(
            me = %conversation.me,
            peer = %conversation.peer,
            room = %conversation.room,
            "conversation opened"
        );
        Ok(conversation)
    }

    pub fn room(&self) -> &RoomKey {
        &self.room
    }

    pub fn me(&self) -> &UserId {
        &self.me
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    /// Next update for the view, or `None` once the conversation is closed.
    ///
    /// Message snapshots also mark the peer's unread messages as read by us.
    pub async fn next_event(&mut self) -> Option<ConversationEvent> {
        let event = self.events.recv().await?;
        if let ConversationEvent::Messages(snapshot) = &event {
            self.mark_seen(snapshot).await;
        }
        Some(event)
    }

    /// Take an already delivered event without waiting.
    pub fn try_next_event(&mut self) -> Option<ConversationEvent> {
        self.events.try_recv().ok()
    }

    /// Send `text` to the peer.
    ///
    /// The peer's presence is read before the append and decides whether a
    /// deferred notification follows it. The text is trimmed; empty text is
    /// rejected before touching the store.
    /// On failure the original text comes back in the error for resubmission.
    pub async fn send(&self, text: &str) -> std::result::Result<Message, SendError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(SendError::new(
                text,
                SyncError::InvalidInput("message text is empty".into()),
            ));
        }
        if trimmed.len() > MAX_MESSAGE_TEXT_LEN {
            return Err(SendError::new(
                text,
                SyncError::InvalidInput(format!(
                    "message text is {} bytes, limit is {MAX_MESSAGE_TEXT_LEN}",
                    trimmed.len()
                )),
            ));
        }

        let peer_online = self.engine.presence().is_online(&self.peer).await;

        let message = match self.engine.messages().append(&self.room, &self.me, trimmed).await {
            Ok(message) => message,
            Err(cause) => {
                error!(room = %self.room, error = %cause, "message send failed");
                return Err(SendError::new(text, cause));
            }
        };

        self.engine
            .reconciler()
            .on_send_with_presence(&message, &self.peer, peer_online)
            .await;

        // Refreshes our lastSeen; failure here does not undo the send.
        if let Err(e) = self.engine.presence().set_online(&self.me, true).await {
            warn!(user = %self.me, error = %e, "could not refresh own presence after send");
        }

        debug!(room = %self.room, id = %message.id, "message sent");
        Ok(message)
    }

    /// Close the conversation: release feeds, stop viewing, go offline.
    pub async fn leave(mut self) -> Result<()> {
        self.detach();
        self.left = true;

        let offline = self.engine.presence().set_online(&self.me, false).await;
        if let Err(e) = self.store.set_active_room(None).await {
            warn!(error = %e, "could not clear active room");
        }
        info!(me = %self.me, room = %self.room, "conversation closed");
        offline.map(|_| ())
    }

    async fn attach(&mut self, tx: mpsc::UnboundedSender<ConversationEvent>) -> Result<()> {
        let subscriptions = self.engine.subscriptions().clone();
        let scope = self.scope.as_ref();

        let room_tx = tx.clone();
        let messages = subscriptions
            .acquire(SubscriptionKey::Room(self.room.clone()), scope, move |update| {
                if let Update::Messages(snapshot) = update {
                    let _ = room_tx.send(ConversationEvent::Messages(snapshot));
                }
            })
            .await?;
        self.guards.push(messages);

        let presence = subscriptions
            .acquire(SubscriptionKey::Presence(self.peer.clone()), scope, move |update| {
                if let Update::Presence(record) = update {
                    let _ = tx.send(ConversationEvent::PeerPresence(record));
                }
            })
            .await?;
        self.guards.push(presence);

        self.engine.reconciler().enter_room(&self.room, &self.me);
        self.viewing = true;

        // Read-state failures are not surfaced; the badge catches up later.
        if let Err(e) = self
            .engine
            .reconciler()
            .mark_notifications_read(&self.peer, &self.me)
            .await
        {
            warn!(peer = %self.peer, error = %e, "could not mark notifications read");
        }
        if let Err(e) = self.store.set_active_room(Some(&self.room)).await {
            warn!(error = %e, "could not persist active room");
        }
        Ok(())
    }

    async fn mark_seen(&self, snapshot: &Snapshot) {
        let unseen: Vec<&Message> = snapshot
            .iter()
            .filter(|m| m.sender == self.peer && !m.is_read_by(&self.me))
            .collect();

        let result = match unseen.as_slice() {
            [] => return,
            [one] => self
                .engine
                .reconciler()
                .mark_delivered(one, &self.me)
                .await
                .map(usize::from),
            // Bounded to this snapshot: later appends are not marked.
            _ => {
                self.engine
                    .reconciler()
                    .mark_all_delivered(&self.room, snapshot, &self.me)
                    .await
            }
        };
        if let Err(e) = result {
            warn!(room = %self.room, error = %e, "could not mark messages read");
        }
    }

    fn detach(&mut self) {
        for guard in &mut self.guards {
            guard.release();
        }
        self.guards.clear();
        if std::mem::take(&mut self.viewing) {
            self.engine.reconciler().leave_room(&self.room, &self.me);
        }
        if let Some(scope) = self.scope.take() {
            self.engine.subscriptions().end_scope(scope);
        }
        self.events.close();
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        if self.left {
            return;
        }
        self.detach();
        warn!(me = %self.me, room = %self.room, "conversation dropped without leave");

        // Best effort: the transport would eventually report us offline anyway.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let presence = self.engine.presence().clone();
            let me = self.me.clone();
            handle.spawn(async move {
                if let Err(e) = presence.set_online(&me, false).await {
                    warn!(user = %me, error = %e, "could not mark offline after drop");
                }
            });
        }
    }
}
