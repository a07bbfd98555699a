//! Branching snapshot history for snaptree
//!
//! This crate implements the history layer on top of the staging store:
//!
//! - **History**: a generic branching undo/redo tree over a user state
//!   type, with `advance`/`undo`/`redo` mutation and a bounded-radius
//!   cache of hydrated snapshots around the current one
//! - **Snapshot chunk format**: the fixed big-endian layout each snapshot
//!   serializes to (stratum, parent id, payload, forward link ids)
//! - **Attach/detach/remap**: moving a history between memory-only
//!   operation and one or another backing stage
//!
//! Snapshots are conceptually immutable, and the stage is append-only, so
//! a snapshot whose forward set changes is re-serialized under a fresh
//! chunk id; superseded chunks are orphaned in the file (compaction is a
//! non-goal).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod format;
pub mod history;
mod node;

pub use error::{HistoryError, HistoryResult};
pub use history::{History, DEFAULT_CACHED_STRATA};
pub use node::{ChildLink, SnapshotRef};
