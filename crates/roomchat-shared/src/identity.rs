//! Identity Resolver: deterministic conversation keys for a pair of users.

use crate::types::{RoomKey, UserId};

/// Derive the room key for the conversation between `a` and `b`.
///
/// Commutative (`room_key(a, b) == room_key(b, a)`) and injective over
/// unordered pairs: the key holds both ids sorted, and ids can never contain
/// the separator used in the joined string form.
pub fn room_key(a: &UserId, b: &UserId) -> RoomKey {
    if a <= b {
        RoomKey::from_sorted(a.clone(), b.clone())
    } else {
        RoomKey::from_sorted(b.clone(), a.clone())
    }
}
