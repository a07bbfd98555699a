//! Snapshot nodes and handles
//!
//! The snapshot tree lives in an arena owned by its history: nodes are
//! keyed by process-local, never-reused keys, and parent/child edges hold
//! keys rather than references. Presence in the arena is what the design
//! calls "in memory"; eliding a snapshot removes it from the arena while
//! its chunk id survives in the neighbour's edge.

use smallvec::SmallVec;
use snaptree_core::{ChunkId, NIL_CHUNK};

/// Arena key of a snapshot node. Monotonically assigned, never reused.
pub(crate) type NodeKey = u64;

/// A forward edge from a snapshot to one child.
///
/// Either side may be absent: a chunk id of [`NIL_CHUNK`] with a live node
/// is a fresh in-memory child, a real chunk id with no node is an elided
/// child. Both present means the child is clean on disk and cached.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NextLink {
    pub id: ChunkId,
    pub node: Option<NodeKey>,
}

impl NextLink {
    pub fn fresh(node: NodeKey) -> Self {
        NextLink {
            id: NIL_CHUNK,
            node: Some(node),
        }
    }
}

/// One snapshot in the tree.
#[derive(Debug)]
pub(crate) struct Node<S> {
    /// Depth from the root; the root is stratum 0.
    pub stratum: u64,
    /// User payload captured by this snapshot.
    pub state: S,
    /// Chunk id of the last accurate persist, or [`NIL_CHUNK`] when the
    /// node is unsaved or has diverged from its on-disk form.
    pub id: ChunkId,
    /// Chunk id of the parent as last recorded, [`NIL_CHUNK`] if unknown.
    pub previous_id: ChunkId,
    /// In-memory parent, absent when the backward direction is elided.
    pub previous: Option<NodeKey>,
    /// Whether the last persist wrote a real `previous_id` (a backward
    /// save) rather than severing it.
    pub saved_backward: bool,
    /// Forward edges, in creation order.
    pub links: SmallVec<[NextLink; 2]>,
}

impl<S> Node<S> {
    pub fn root(state: S) -> Self {
        Node {
            stratum: 0,
            state,
            id: NIL_CHUNK,
            previous_id: NIL_CHUNK,
            previous: None,
            saved_backward: false,
            links: SmallVec::new(),
        }
    }

    pub fn child(state: S, stratum: u64, previous: NodeKey, previous_id: ChunkId) -> Self {
        Node {
            stratum,
            state,
            id: NIL_CHUNK,
            previous_id,
            previous: Some(previous),
            saved_backward: false,
            links: SmallVec::new(),
        }
    }

    /// Position of the link pointing at `child`, if any.
    pub fn link_to(&self, child: NodeKey) -> Option<usize> {
        self.links.iter().position(|l| l.node == Some(child))
    }
}

/// Opaque handle to a snapshot in a specific history.
///
/// Handles stay valid while the snapshot is memory-resident; once the
/// cache radius elides the snapshot, resolving the handle yields an
/// argument error. Handles from one history are rejected by another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotRef {
    pub(crate) history: u64,
    pub(crate) key: NodeKey,
}

/// A forward edge as exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildLink {
    /// Chunk id of the child, [`NIL_CHUNK`] while the child only exists in
    /// memory.
    pub id: ChunkId,
    /// Handle to the child when it is memory-resident.
    pub snapshot: Option<SnapshotRef>,
}
