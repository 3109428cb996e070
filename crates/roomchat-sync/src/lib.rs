//! # roomchat-sync
//!
//! Presence-aware message synchronization for two-party conversations.
//!
//! - [`MessageLog`]: ordered per-room log with snapshot subscriptions
//! - [`PresenceTracker`]: online/offline state with last-seen timestamps
//! - [`Reconciler`]: read receipts, deferred notifications, unread summaries
//! - [`SubscriptionManager`]: shared, reference-counted feeds with scoped cleanup
//! - [`Channels`]: group channels joined by a four-digit code
//! - [`Session`] and [`Conversation`]: the per-device flow tying them together
//!
//! All callbacks run on one event queue in enqueue order. Callbacks for
//! different feeds are not ordered relative to each other.

pub mod backend;
pub mod channels;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod feed;
pub mod message_log;
pub mod presence;
pub mod queue;
pub mod reconciler;
pub mod session;
pub mod subscriptions;

pub use backend::Backend;
pub use channels::Channels;
pub use config::SyncConfig;
pub use conversation::{Conversation, ConversationEvent};
pub use engine::{Engine, PeerListing};
pub use error::{Result, SendError, SyncError};
pub use feed::SubscriptionHandle;
pub use message_log::{MessageLog, Snapshot};
pub use presence::PresenceTracker;
pub use queue::EventQueue;
pub use reconciler::{Reconciler, UnreadEntry, UnreadSummary};
pub use session::{Session, SessionStore};
pub use subscriptions::{
    SubscriptionGuard, SubscriptionKey, SubscriptionManager, SubscriptionScope, Update,
};
