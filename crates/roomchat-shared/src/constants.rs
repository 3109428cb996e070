/// Separator placed between the two sorted user ids of a room key
pub const ROOM_KEY_SEPARATOR: char = '_';

/// Maximum length of a user id in bytes
pub const MAX_USER_ID_LEN: usize = 128;

/// Maximum message text size in bytes (16 KiB)
pub const MAX_MESSAGE_TEXT_LEN: usize = 16 * 1024;

/// Window after `lastSeen` during which an offline user still counts as recently active
pub const DEFAULT_ACTIVE_WINDOW_SECS: u64 = 5 * 60;

/// Number of messages fetched when prefetching a conversation
pub const DEFAULT_RECENT_LIMIT: u32 = 20;

/// Session store keys
pub const SESSION_KEY_CURRENT_USER: &str = "current_user_id";
pub const SESSION_KEY_ACTIVE_ROOM: &str = "active_room";
pub const SESSION_KEY_ACTIVE_CHANNEL: &str = "channel_id";

/// Digits in a channel join code
pub const CHANNEL_CODE_LEN: usize = 4;

/// Bounds on a channel's member limit
pub const MIN_CHANNEL_MEMBERS: u32 = 1;
pub const MAX_CHANNEL_MEMBERS: u32 = 10;

/// Maximum channel name length in bytes
pub const MAX_CHANNEL_NAME_LEN: usize = 64;

/// Attempts at drawing an unused join code before giving up
pub const CHANNEL_CODE_ATTEMPTS: usize = 16;

/// Interval at which a long-running client re-reads the store for changes made elsewhere
pub const DEFAULT_FEED_POLL_MS: u64 = 1000;
