//! Typed records persisted in the backing store.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use roomchat_shared::{ChannelCode, ChannelId, MessageId, NotificationId, RoomKey, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A known user. Presence fields are written only by the presence tracker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub display_name: Option<String>,
    /// Reference to the avatar in the media service.
    pub avatar_ref: Option<String>,
    pub online: bool,
    /// Server time of the last presence write.
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Derived presence view of a [`User`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<&User> for PresenceRecord {
    fn from(u: &User) -> Self {
        Self {
            user_id: u.id.clone(),
            online: u.online,
            last_seen: u.last_seen,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message. Immutable after append except for `read_by` growth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub room_key: RoomKey,
    pub sender: UserId,
    pub text: String,
    /// Store-assigned, authoritative ordering key.
    pub timestamp: DateTime<Utc>,
    /// Insertion sequence; breaks timestamp ties.
    pub seq: i64,
    pub read_by: BTreeSet<UserId>,
}

impl Message {
    pub fn is_read_by(&self, user: &UserId) -> bool {
        self.read_by.contains(user)
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// Deferred notification created when a message reaches an offline receiver.
/// Never deleted; `is_read` only moves from `false` to `true`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    /// The message that triggered this notification.
    pub message_id: Option<MessageId>,
    pub message_text: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub was_offline: bool,
    pub read_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Conversation list entry
// ---------------------------------------------------------------------------

/// Latest message exchanged between a user and one peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomPreview {
    pub room_key: RoomKey,
    pub peer: UserId,
    pub last_message: String,
    pub last_sender: UserId,
    pub last_timestamp: DateTime<Utc>,
    /// Store sequence of the latest message.
    pub last_seq: i64,
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A group channel. Anyone holding the code may join until it is full.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub code: ChannelCode,
    pub max_members: u32,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub member_count: u32,
}

impl Channel {
    pub fn is_full(&self) -> bool {
        self.member_count >= self.max_members
    }
}
