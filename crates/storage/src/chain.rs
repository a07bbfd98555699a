//! Whole-node chain codec
//!
//! Higher-level persistent structures (stacks, lists) store nodes of the
//! shape `{ payload, parent chunk id }` and walk them by following parent
//! ids through the stage. [`ChainCodec`] composes any payload
//! [`NodeCodec`] into a codec for such whole nodes, and provides the
//! stage-aware helpers that write header and payload in a single
//! `Stage::append` so a node is always one contiguous chunk.
//!
//! # Chunk layout
//!
//! ```text
//! +------------+--------------------+
//! | payload    | parent id (8 b.)   |
//! | (inner)    | big-endian, -1 nil |
//! +------------+--------------------+
//! ```

use crate::error::{StageError, StageResult};
use crate::stage::Stage;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use snaptree_core::{ChunkId, NodeCodec, NIL_CHUNK};
use std::io::{self, Read, Write};

/// One node of a persistent chain: a payload plus its parent chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainNode<T> {
    /// User payload.
    pub value: T,
    /// Chunk id of the parent node, or [`NIL_CHUNK`] at the chain head.
    pub parent: ChunkId,
}

impl<T> ChainNode<T> {
    /// Create a chain head with no parent.
    pub fn head(value: T) -> Self {
        ChainNode {
            value,
            parent: NIL_CHUNK,
        }
    }

    /// Create a node linked to `parent`.
    pub fn linked(value: T, parent: ChunkId) -> Self {
        ChainNode { value, parent }
    }
}

/// Composes a payload codec into a whole-node codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainCodec<C> {
    inner: C,
}

impl<C> ChainCodec<C> {
    /// Wrap a payload codec.
    pub fn new(inner: C) -> Self {
        ChainCodec { inner }
    }

    /// The payload codec.
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<T, C: NodeCodec<T>> NodeCodec<ChainNode<T>> for ChainCodec<C> {
    fn node_len(&self) -> usize {
        self.inner.node_len() + 8
    }

    fn write_node(&self, value: &ChainNode<T>, out: &mut dyn Write) -> io::Result<()> {
        self.inner.write_node(&value.value, out)?;
        out.write_i64::<BigEndian>(value.parent)
    }

    fn read_node(&self, input: &mut dyn Read) -> io::Result<ChainNode<T>> {
        let value = self.inner.read_node(input)?;
        let parent = input.read_i64::<BigEndian>()?;
        Ok(ChainNode { value, parent })
    }
}

impl<C> ChainCodec<C> {
    /// Write one whole node to the stage in a single append.
    pub fn append_to<T>(&self, stage: &Stage, node: &ChainNode<T>) -> StageResult<ChunkId>
    where
        C: NodeCodec<T>,
    {
        let whole_len = self.inner.node_len() + 8;
        let mut buf = Vec::with_capacity(whole_len);
        let enc = |e: io::Error| StageError::Staging(format!("chain node encode failed: {e}"));
        self.inner.write_node(&node.value, &mut buf).map_err(enc)?;
        if buf.len() != self.inner.node_len() {
            return Err(StageError::Staging(format!(
                "chain payload codec wrote {} bytes, expected {}",
                buf.len(),
                self.inner.node_len()
            )));
        }
        buf.write_i64::<BigEndian>(node.parent).map_err(enc)?;
        stage.append(&buf)
    }

    /// Read one whole node back from the stage.
    pub fn read_at<T>(&self, stage: &Stage, id: ChunkId) -> StageResult<ChainNode<T>>
    where
        C: NodeCodec<T>,
    {
        let whole_len = self.inner.node_len() + 8;
        let mut buf = vec![0u8; whole_len];
        stage.read(&mut buf, id)?;
        let dec = |e: io::Error| StageError::Staging(format!("chain node decode failed: {e}"));
        let mut rd = &buf[..];
        let value = self.inner.read_node(&mut rd).map_err(dec)?;
        let parent = rd.read_i64::<BigEndian>().map_err(dec)?;
        Ok(ChainNode { value, parent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snaptree_core::I32Codec;
    use tempfile::TempDir;

    #[test]
    fn chain_walks_back_through_parents() {
        let dir = TempDir::new().unwrap();
        let stage = Stage::open(dir.path().join("chain.stage"), true).unwrap();
        let codec = ChainCodec::new(I32Codec);

        let a = codec.append_to(&stage, &ChainNode::head(10)).unwrap();
        let b = codec.append_to(&stage, &ChainNode::linked(20, a)).unwrap();
        let c = codec.append_to(&stage, &ChainNode::linked(30, b)).unwrap();

        let mut id = c;
        let mut values = Vec::new();
        while id != NIL_CHUNK {
            let node: ChainNode<i32> = codec.read_at(&stage, id).unwrap();
            values.push(node.value);
            id = node.parent;
        }
        assert_eq!(values, [30, 20, 10]);
    }

    #[test]
    fn node_len_includes_parent_slot() {
        let codec = ChainCodec::new(I32Codec);
        assert_eq!(NodeCodec::<ChainNode<i32>>::node_len(&codec), 12);
    }
}
