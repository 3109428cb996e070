//! Engine configuration loaded from environment variables.
//!
//! Every setting has a default so a node can start with no configuration.

use std::path::PathBuf;
use std::str::FromStr;

use roomchat_shared::constants::{
    DEFAULT_ACTIVE_WINDOW_SECS, DEFAULT_FEED_POLL_MS, DEFAULT_RECENT_LIMIT,
};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// SQLite file backing users, messages and notifications.
    /// Env: `ROOMCHAT_DB_PATH`
    /// Default: `<platform data dir>/roomchat.db`
    pub database_path: PathBuf,

    /// SQLite file for per-device session bookkeeping.
    /// Env: `ROOMCHAT_SESSION_PATH`
    /// Default: `<platform data dir>/session.db`
    pub session_path: PathBuf,

    /// How long after `lastSeen` a user still counts as recently active.
    /// Env: `ROOMCHAT_ACTIVE_WINDOW_SECS`
    /// Default: `300`
    pub active_window_secs: u64,

    /// Number of messages returned by a recent-history prefetch.
    /// Env: `ROOMCHAT_RECENT_LIMIT`
    /// Default: `20`
    pub recent_limit: u32,

    /// Interval for re-reading the store to pick up writes from other
    /// processes (0 = never).
    /// Env: `ROOMCHAT_FEED_POLL_MS`
    /// Default: `1000`
    pub feed_poll_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let data_dir = roomchat_store::database::default_data_dir()
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            database_path: data_dir.join("roomchat.db"),
            session_path: data_dir.join("session.db"),
            active_window_secs: DEFAULT_ACTIVE_WINDOW_SECS,
            recent_limit: DEFAULT_RECENT_LIMIT,
            feed_poll_ms: DEFAULT_FEED_POLL_MS,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("ROOMCHAT_DB_PATH").filter(|p| !p.is_empty()) {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("ROOMCHAT_SESSION_PATH").filter(|p| !p.is_empty()) {
            config.session_path = PathBuf::from(path);
        }

        if let Some(val) = lookup("ROOMCHAT_ACTIVE_WINDOW_SECS") {
            parse_into(&val, "ROOMCHAT_ACTIVE_WINDOW_SECS", &mut config.active_window_secs);
        }

        if let Some(val) = lookup("ROOMCHAT_RECENT_LIMIT") {
            parse_into(&val, "ROOMCHAT_RECENT_LIMIT", &mut config.recent_limit);
            if config.recent_limit == 0 {
                tracing::warn!("ROOMCHAT_RECENT_LIMIT must be positive, using default");
                config.recent_limit = DEFAULT_RECENT_LIMIT;
            }
        }

        if let Some(val) = lookup("ROOMCHAT_FEED_POLL_MS") {
            parse_into(&val, "ROOMCHAT_FEED_POLL_MS", &mut config.feed_poll_ms);
        }

        config
    }
}

fn parse_into<T: FromStr>(value: &str, name: &str, slot: &mut T) {
    match value.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => {
            tracing::warn!(value = %value, "Invalid {name}, using default");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.active_window_secs, 300);
        assert_eq!(config.recent_limit, 20);
        assert_eq!(config.feed_poll_ms, 1000);
        assert!(config.database_path.ends_with("roomchat.db"));
    }

    #[test]
    fn test_env_overrides() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("ROOMCHAT_DB_PATH", "/tmp/chat.db"),
            ("ROOMCHAT_ACTIVE_WINDOW_SECS", "60"),
            ("ROOMCHAT_FEED_POLL_MS", "0"),
        ]));
        assert_eq!(config.database_path, PathBuf::from("/tmp/chat.db"));
        assert_eq!(config.active_window_secs, 60);
        assert_eq!(config.feed_poll_ms, 0);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("ROOMCHAT_ACTIVE_WINDOW_SECS", "soon"),
            ("ROOMCHAT_RECENT_LIMIT", "0"),
        ]));
        assert_eq!(config.active_window_secs, 300);
        assert_eq!(config.recent_limit, 20);
    }
}
