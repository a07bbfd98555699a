//! History error types
//!
//! The history performs no retries: stage failures propagate unchanged,
//! codec contract violations and corrupt chunks surface as codec errors,
//! and misuse of the API is rejected at the boundary as argument or state
//! errors.

use snaptree_storage::StageError;
use thiserror::Error;

/// Result type alias for history operations.
pub type HistoryResult<T> = std::result::Result<T, HistoryError>;

/// Errors raised by history operations.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// A stage operation failed underneath the history.
    #[error(transparent)]
    Stage(#[from] StageError),

    /// The payload codec broke its contract or a chunk decoded to
    /// impossible values.
    #[error("snapshot codec error: {0}")]
    Codec(String),

    /// The caller passed an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid in the history's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl HistoryError {
    pub(crate) fn codec(msg: impl Into<String>) -> Self {
        HistoryError::Codec(msg.into())
    }

    pub(crate) fn argument(msg: impl Into<String>) -> Self {
        HistoryError::InvalidArgument(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        HistoryError::InvalidState(msg.into())
    }

    /// Check whether this error rejected a caller argument.
    pub fn is_argument(&self) -> bool {
        matches!(self, HistoryError::InvalidArgument(_))
    }

    /// Check whether this error reported an invalid state.
    pub fn is_state(&self) -> bool {
        matches!(self, HistoryError::InvalidState(_))
    }
}
