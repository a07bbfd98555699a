//! Core contracts for snaptree
//!
//! This crate defines the vocabulary shared by the storage and history
//! layers:
//!
//! - **Chunk identifiers**: a chunk id is the file offset of the chunk's
//!   first byte inside a stage file; `NIL_CHUNK` marks an absent reference.
//! - **`NodeCodec<T>`**: the user-supplied fixed-size codec through which
//!   persistent structures serialize their payloads into stage chunks.
//! - Reference codecs for fixed-width integer payloads.
//!
//! All multi-byte integers written through these contracts are big-endian.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod codec;

pub use chunk::{ChunkId, NIL_CHUNK};
pub use codec::{I32Codec, I64Codec, NodeCodec};
