use thiserror::Error;

pub use roomchat_shared::SyncError;

/// A send that did not reach the message log.
///
/// Carries the text so the caller can offer it for resubmission instead of
/// losing what the user typed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Message not sent: {cause}")]
pub struct SendError {
    pub text: String,
    #[source]
    pub cause: SyncError,
}

impl SendError {
    pub fn new(text: impl Into<String>, cause: SyncError) -> Self {
        Self {
            text: text.into(),
            cause,
        }
    }

    /// Whether resubmitting the same text may succeed.
    ///
    /// Rejected input will be rejected again; store failures may clear.
    pub fn is_retryable(&self) -> bool {
        matches!(self.cause, SyncError::Connectivity(_) | SyncError::Write(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;
