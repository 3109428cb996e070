use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{CHANNEL_CODE_LEN, MAX_USER_ID_LEN, ROOM_KEY_SEPARATOR};
use crate::error::IdError;

/// Stable, opaque user identifier handed out by the identity provider.
///
/// Ids are non-empty, at most [`MAX_USER_ID_LEN`] bytes, and never contain
/// [`ROOM_KEY_SEPARATOR`] or whitespace, which keeps joined room keys
/// unambiguous.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn parse(s: impl Into<String>) -> Result<Self, IdError> {
        let s = s.into();
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > MAX_USER_ID_LEN {
            return Err(IdError::TooLong(s.len()));
        }
        if s.contains(ROOM_KEY_SEPARATOR) {
            return Err(IdError::ContainsSeparator(s));
        }
        if s.chars().any(char::is_whitespace) {
            return Err(IdError::Whitespace(s));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for UserId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

/// Order-independent identifier of a two-party conversation.
///
/// Built only through [`crate::identity::room_key`] or [`RoomKey::parse`], so
/// `low <= high` always holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct RoomKey {
    low: UserId,
    high: UserId,
}

impl RoomKey {
    pub(crate) fn from_sorted(low: UserId, high: UserId) -> Self {
        debug_assert!(low <= high);
        Self { low, high }
    }

    /// Parse the joined `low_high` form produced by [`RoomKey::to_string`].
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let (a, b) = s
            .split_once(ROOM_KEY_SEPARATOR)
            .ok_or_else(|| IdError::MalformedRoomKey(s.to_string()))?;
        let a = UserId::parse(a)?;
        let b = UserId::parse(b)?;
        Ok(crate::identity::room_key(&a, &b))
    }

    /// The participants, lexicographically ordered.
    pub fn members(&self) -> (&UserId, &UserId) {
        (&self.low, &self.high)
    }

    pub fn contains(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }

    /// The other participant, or `None` if `user` is not in this room.
    ///
    /// For a self-conversation both sides are `user`.
    pub fn peer_of(&self, user: &UserId) -> Option<&UserId> {
        if &self.low == user {
            Some(&self.high)
        } else if &self.high == user {
            Some(&self.low)
        } else {
            None
        }
    }
}

impl std::fmt::Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.low, ROOM_KEY_SEPARATOR, self.high)
    }
}

impl TryFrom<String> for RoomKey {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<RoomKey> for String {
    fn from(key: RoomKey) -> Self {
        key.to_string()
    }
}

/// Numeric join code of a group channel, shared out of band.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelCode(String);

impl ChannelCode {
    pub fn parse(s: impl Into<String>) -> Result<Self, IdError> {
        let s = s.into();
        if s.len() != CHANNEL_CODE_LEN || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IdError::MalformedChannelCode(s));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ChannelCode {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<ChannelCode> for String {
    fn from(code: ChannelCode) -> Self {
        code.0
    }
}

/// Group channel identifier: the channel name joined to its code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(name: &str, code: &ChannelCode) -> Self {
        Self(format!("{name}{ROOM_KEY_SEPARATOR}{code}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned message identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NotificationId(pub Uuid);

impl NotificationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
