//! Stage error types
//!
//! Every failure carries the stage file path so callers can report which
//! store misbehaved. The stage recovers exactly one condition internally
//! (a closed file handle, via transparent reopen); everything here
//! propagates to the caller.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for stage operations.
pub type StageResult<T> = std::result::Result<T, StageError>;

/// Errors raised by stage operations.
#[derive(Debug, Error)]
pub enum StageError {
    /// Opening the stage file failed, at construction or on reopen.
    #[error("failed to open stage file {path}")]
    Open {
        /// Stage file path
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: io::Error,
    },

    /// Closing the stage file failed.
    #[error("failed to close stage file {path}")]
    Close {
        /// Stage file path
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: io::Error,
    },

    /// A chunk read was requested at a negative offset.
    #[error("negative chunk offset {offset} in stage file {path}")]
    NegativeOffset {
        /// Stage file path
        path: PathBuf,
        /// Offset passed by the caller
        offset: i64,
    },

    /// A chunk read would extend past the end of the stage file.
    #[error(
        "chunk region [{offset}, {offset} + {len}) out of range in stage file {path} (size {size})"
    )]
    OffsetOutOfRange {
        /// Stage file path
        path: PathBuf,
        /// Requested chunk offset
        offset: i64,
        /// Requested region length in bytes
        len: usize,
        /// Current stage file size
        size: u64,
    },

    /// Reading chunk bytes failed.
    #[error("failed to read chunk at {offset} from stage file {path}")]
    Read {
        /// Stage file path
        path: PathBuf,
        /// Chunk offset being read
        offset: i64,
        /// Underlying I/O failure
        #[source]
        source: io::Error,
    },

    /// Appending a chunk failed.
    #[error("failed to append chunk to stage file {path}")]
    Write {
        /// Stage file path
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: io::Error,
    },

    /// Generic staging failure outside the chunk I/O paths.
    #[error("staging error: {0}")]
    Staging(String),
}

impl StageError {
    /// Check whether this error reports a chunk region outside the file.
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, StageError::OffsetOutOfRange { .. })
    }
}
