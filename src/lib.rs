//! # snaptree
//!
//! An embedded append-only staging store with a branching undo/redo
//! history built on top of it.
//!
//! Two entities form the core:
//!
//! - [`Stage`]: an append-only chunk log over a single file. Two mutating
//!   operations (append a chunk, read a chunk at a known offset), durable
//!   appends, no recorded boundaries.
//! - [`History`]: a generic branching snapshot tree over a user state
//!   type. Snapshots live in memory, on the stage, or both; a window of
//!   radius `max_cached_strata` around the current snapshot stays
//!   hydrated, and everything outside it is elided down to chunk ids.
//!
//! # Quick start
//!
//! ```no_run
//! use snaptree::{History, I32Codec, Stage};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stage = Arc::new(Stage::open("./counter.stage", false)?);
//!     let mut history = History::attached(0i32, stage, Box::new(I32Codec));
//!
//!     history.advance(10)?;
//!     history.advance(20)?;
//!     history.undo()?;
//!     assert_eq!(*history.state(), 10);
//!
//!     history.advance(25)?; // branches: 20 stays reachable as a sibling
//!     history.save()?;
//!     let entry_point = history.chunk_id(); // reopen from this id later
//!     let _ = entry_point;
//!     Ok(())
//! }
//! ```
//!
//! Higher-level persistent structures consume the stage through the same
//! [`NodeCodec`] seam; see [`ChainCodec`] for the `{ payload, parent id }`
//! whole-node composition.

pub use snaptree_core::{ChunkId, I32Codec, I64Codec, NodeCodec, NIL_CHUNK};
pub use snaptree_history::{
    ChildLink, History, HistoryError, HistoryResult, SnapshotRef, DEFAULT_CACHED_STRATA,
};
pub use snaptree_storage::{ChainCodec, ChainNode, Stage, StageError, StageResult};
