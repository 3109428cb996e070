//! Group channels.
//!
//! A channel has a name, a random four-digit join code and a member limit.
//! Its creator is the first member; anyone holding the code may join until
//! the limit is reached, and members may leave at any time. Joining twice
//! and leaving twice are both no-ops.

use rand::Rng;
use tracing::{debug, info};

use roomchat_shared::constants::{
    CHANNEL_CODE_ATTEMPTS, MAX_CHANNEL_MEMBERS, MAX_CHANNEL_NAME_LEN, MIN_CHANNEL_MEMBERS,
};
use roomchat_shared::{ChannelCode, ChannelId, SyncError, UserId};
use roomchat_store::{Channel, StoreError, User};

use crate::backend::Backend;
use crate::error::Result;

pub struct Channels {
    backend: Backend,
}

impl Channels {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    /// Create a channel owned by `creator` under a fresh join code.
    ///
    /// The name is trimmed and must be non-empty; `max_members` must lie in
    /// `1..=10`.
    pub async fn create(&self, creator: &UserId, name: &str, max_members: u32) -> Result<Channel> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::InvalidInput("channel name is required".into()));
        }
        if name.len() > MAX_CHANNEL_NAME_LEN {
            return Err(SyncError::InvalidInput(format!(
                "channel name is {} bytes, limit is {MAX_CHANNEL_NAME_LEN}",
                name.len()
            )));
        }
        if !(MIN_CHANNEL_MEMBERS..=MAX_CHANNEL_MEMBERS).contains(&max_members) {
            return Err(SyncError::InvalidInput(format!(
                "member limit must be between {MIN_CHANNEL_MEMBERS} and {MAX_CHANNEL_MEMBERS}"
            )));
        }

        let db = self.backend.lock().await?;
        for _ in 0..CHANNEL_CODE_ATTEMPTS {
            let code = random_code()?;
            match db.create_channel(name, &code, max_members, creator) {
                Ok(channel) => {
                    info!(channel = %channel.id, creator = %creator, max_members, "channel created");
                    return Ok(channel);
                }
                Err(StoreError::Conflict(_)) => {
                    debug!(code = %code, "join code taken, drawing another");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SyncError::Write(format!(
            "no free join code after {CHANNEL_CODE_ATTEMPTS} attempts"
        )))
    }

    /// Join the channel whose code is `code`. Joining a channel `user`
    /// already belongs to returns it unchanged.
    pub async fn join(&self, user: &UserId, code: &ChannelCode) -> Result<Channel> {
        let db = self.backend.lock().await?;
        let channel = db.find_channel_by_code(code)?;
        if db.join_channel(&channel.id, user)? {
            info!(channel = %channel.id, user = %user, "joined channel");
        }
        Ok(db.get_channel(&channel.id)?)
    }

    /// Leave `channel`. Returns whether `user` was a member.
    pub async fn leave(&self, channel: &ChannelId, user: &UserId) -> Result<bool> {
        let left = self
            .backend
            .call(|db| db.leave_channel(channel, user))
            .await?;
        if left {
            info!(channel = %channel, user = %user, "left channel");
        }
        Ok(left)
    }

    pub async fn get(&self, channel: &ChannelId) -> Result<Channel> {
        self.backend.call(|db| db.get_channel(channel)).await
    }

    pub async fn list(&self) -> Result<Vec<Channel>> {
        self.backend.call(|db| db.list_channels()).await
    }

    /// Members with their current presence, in join order.
    pub async fn members(&self, channel: &ChannelId) -> Result<Vec<User>> {
        self.backend.call(|db| db.channel_members(channel)).await
    }
}

/// Uniform over `1000..=9999`.
fn random_code() -> Result<ChannelCode> {
    let n: u16 = rand::thread_rng().gen_range(1000..=9999);
    Ok(ChannelCode::parse(n.to_string())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomchat_store::Database;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn setup() -> (Backend, Channels) {
        let db = Database::open_in_memory().unwrap();
        for name in ["alice", "bob", "carol"] {
            db.upsert_user(&uid(name), None, None).unwrap();
        }
        let backend = Backend::new(db);
        (backend.clone(), Channels::new(backend))
    }

    #[test]
    fn test_random_code_is_four_digits() {
        for _ in 0..200 {
            let code = random_code().unwrap();
            let n: u16 = code.as_str().parse().unwrap();
            assert!((1000..=9999).contains(&n));
        }
    }

    #[tokio::test]
    async fn test_create_validates_input() {
        let (_, channels) = setup();
        let alice = uid("alice");
        for (name, max) in [("  ", 3), ("club", 0), ("club", 11)] {
            assert!(matches!(
                channels.create(&alice, name, max).await,
                Err(SyncError::InvalidInput(_))
            ));
        }
        let long = "x".repeat(MAX_CHANNEL_NAME_LEN + 1);
        assert!(channels.create(&alice, &long, 2).await.is_err());
        assert!(matches!(
            channels.create(&uid("ghost"), "club", 2).await,
            Err(SyncError::NotFound(_))
        ));
        assert!(channels.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_join_by_code_then_leave() {
        let (_, channels) = setup();
        let (alice, bob) = (uid("alice"), uid("bob"));
        let created = channels.create(&alice, " book club ", 2).await.unwrap();
        assert_eq!(created.name, "book club");

        let joined = channels.join(&bob, &created.code).await.unwrap();
        assert_eq!(joined.id, created.id);
        assert_eq!(joined.member_count, 2);
        assert_eq!(channels.join(&bob, &created.code).await.unwrap().member_count, 2);

        assert!(matches!(
            channels.join(&uid("carol"), &created.code).await,
            Err(SyncError::InvalidInput(_))
        ));

        assert!(channels.leave(&created.id, &bob).await.unwrap());
        assert!(!channels.leave(&created.id, &bob).await.unwrap());
        let members = channels.members(&created.id).await.unwrap();
        assert_eq!(members.iter().map(|u| &u.id).collect::<Vec<_>>(), vec![&alice]);
    }

    #[tokio::test]
    async fn test_unknown_code_is_not_found() {
        let (_, channels) = setup();
        let code = ChannelCode::parse("0001").unwrap();
        assert!(matches!(
            channels.join(&uid("alice"), &code).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_connectivity() {
        let (backend, channels) = setup();
        backend.set_reachable(false);
        assert!(matches!(
            channels.create(&uid("alice"), "club", 2).await,
            Err(SyncError::Connectivity(_))
        ));
    }
}
