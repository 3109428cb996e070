use roomchat_shared::{IdError, SyncError};
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A stored record failed validation when read back.
    #[error("Malformed {entity} record: {reason}")]
    Malformed { entity: &'static str, reason: String },

    /// An identifier failed validation.
    #[error("Invalid id: {0}")]
    InvalidId(#[from] IdError),

    /// A unique value (such as a channel code) is already taken.
    #[error("Already exists: {0}")]
    Conflict(String),

    /// The write is well-formed but the record's current state forbids it.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Session value (de)serialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the underlying database was busy or locked by another writer.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => SyncError::NotFound(what),
            StoreError::InvalidId(id) => SyncError::InvalidInput(id.to_string()),
            StoreError::Rejected(why) => SyncError::InvalidInput(why),
            ref busy if busy.is_busy() => SyncError::Connectivity(busy.to_string()),
            StoreError::Io(io) => SyncError::Connectivity(io.to_string()),
            other => SyncError::Write(other.to_string()),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_sync_not_found() {
        let err: SyncError = StoreError::NotFound("user bob".into()).into();
        assert_eq!(err, SyncError::NotFound("user bob".into()));
    }

    #[test]
    fn test_busy_maps_to_connectivity() {
        let busy = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_busy());
        let err: SyncError = busy.into();
        assert!(err.is_transient());
    }

    #[test]
    fn test_other_maps_to_write() {
        let err: SyncError = StoreError::Migration("boom".into()).into();
        assert!(matches!(err, SyncError::Write(_)));
    }
}
