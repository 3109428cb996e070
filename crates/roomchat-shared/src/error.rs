use thiserror::Error;

/// Failures reported by every engine operation.
///
/// Only `Connectivity` and `Write` on explicit user actions are meant to be
/// surfaced to the user; presence and read-state failures degrade to the last
/// known value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The backing store could not be reached. Transient; retry with backoff.
    #[error("Connectivity failure: {0}")]
    Connectivity(String),

    /// A referenced user or conversation does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The store rejected a write or update.
    #[error("Write failure: {0}")]
    Write(String),

    /// Input rejected before reaching the store.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl SyncError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Connectivity(_))
    }
}

impl From<IdError> for SyncError {
    fn from(e: IdError) -> Self {
        SyncError::InvalidInput(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("User id is empty")]
    Empty,

    #[error("User id too long: {0} bytes")]
    TooLong(usize),

    #[error("User id contains the room key separator: {0:?}")]
    ContainsSeparator(String),

    #[error("User id contains whitespace: {0:?}")]
    Whitespace(String),

    #[error("Malformed room key: {0:?}")]
    MalformedRoomKey(String),

    #[error("Channel code must be 4 digits: {0:?}")]
    MalformedChannelCode(String),
}
