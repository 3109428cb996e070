// Identifier types, room key derivation, and error kinds shared by the store and sync crates.

pub mod constants;
pub mod error;
pub mod identity;
pub mod types;

pub use error::{IdError, SyncError};
pub use identity::room_key;
pub use types::{ChannelCode, ChannelId, MessageId, NotificationId, RoomKey, UserId};
