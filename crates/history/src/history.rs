//! Branching snapshot history
//!
//! `History<S>` is a branching undo/redo tree over an arbitrary state type.
//! Snapshots live in memory, on a stage, or both: around the current
//! snapshot a window of radius `max_cached_strata` stays hydrated, and
//! everything outside it is elided down to chunk ids in its neighbours'
//! edges.
//!
//! # Persistence model
//!
//! The stage is append-only, so a snapshot whose forward set changed since
//! its last write cannot be patched in place: the next save mints a fresh
//! chunk id for it and the stale chunk is orphaned. Saving the backward
//! spine writes parents before children so each child records its parent's
//! final chunk id; the one forward slot on the path to the current
//! snapshot is written as `-1` (severed) so it can be reconnected in
//! memory without a load. Saving forward branches writes children before
//! their parent and severs the backward direction instead.
//!
//! # Cache radius
//!
//! `max_cached_strata` is a distance invariant, not an LRU bound. Two tail
//! counters track how many cached levels remain in each direction;
//! ordinary moves only increment and decrement them, and a full window
//! re-slide runs only when the counter for the direction being consumed
//! hits zero.
//!
//! # Concurrency
//!
//! Mutation takes `&mut self`: a history is not a concurrent structure and
//! callers serialize access. The stage underneath is internally
//! synchronized and may be shared across histories.

use crate::error::{HistoryError, HistoryResult};
use crate::format;
use crate::node::{ChildLink, NextLink, Node, NodeKey, SnapshotRef};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use snaptree_core::{ChunkId, NodeCodec, NIL_CHUNK};
use snaptree_storage::Stage;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Default cache radius around the current snapshot.
pub const DEFAULT_CACHED_STRATA: u64 = 1;

/// Tail counter value while the history is detached (no radius bound).
const UNBOUNDED: i64 = -1;

static NEXT_HISTORY_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Branching snapshot tree with bounded memory cache and optional stage
/// backing.
///
/// A history is *attached* when both a stage and a codec are set; only
/// attached histories persist snapshots. Detached histories keep the whole
/// reachable tree in memory and the radius logic is disabled.
pub struct History<S> {
    nodes: FxHashMap<NodeKey, Node<S>>,
    next_key: NodeKey,
    current: NodeKey,
    stage: Option<Arc<Stage>>,
    codec: Option<Box<dyn NodeCodec<S>>>,
    max_cached_strata: u64,
    /// Cached levels remaining ahead of the current snapshot before a
    /// re-slide; `UNBOUNDED` while detached.
    forward_tail: i64,
    /// Cached levels remaining behind the current snapshot.
    backward_tail: i64,
    scratch: Vec<u8>,
    token: u64,
}

impl<S> History<S> {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Create a memory-only history rooted at `initial`.
    pub fn new(initial: S) -> Self {
        let token = NEXT_HISTORY_TOKEN.fetch_add(1, Ordering::Relaxed);
        let mut nodes = FxHashMap::default();
        nodes.insert(1, Node::root(initial));
        History {
            nodes,
            next_key: 2,
            current: 1,
            stage: None,
            codec: None,
            max_cached_strata: DEFAULT_CACHED_STRATA,
            forward_tail: UNBOUNDED,
            backward_tail: UNBOUNDED,
            scratch: Vec::new(),
            token,
        }
    }

    /// Create an attached history rooted at `initial`.
    ///
    /// Nothing is persisted until the first [`save`](History::save) or
    /// radius eviction.
    pub fn attached(initial: S, stage: Arc<Stage>, codec: Box<dyn NodeCodec<S>>) -> Self {
        let mut history = History::new(initial);
        history.stage = Some(stage);
        history.codec = Some(codec);
        history.forward_tail = 0;
        history.backward_tail = 0;
        history
    }

    /// Reopen a history from a previously saved snapshot chunk.
    ///
    /// The chunk at `root_id` becomes the current snapshot; its neighbours
    /// hydrate on demand. With `attach = false` the whole reachable tree
    /// is lifted into memory and the stage is dropped again.
    pub fn open(
        stage: Arc<Stage>,
        codec: Box<dyn NodeCodec<S>>,
        root_id: ChunkId,
        max_cached_strata: i64,
        attach: bool,
    ) -> HistoryResult<Self> {
        if root_id < 0 {
            return Err(HistoryError::argument(format!(
                "chunk id must be non-negative, got {root_id}"
            )));
        }
        let token = NEXT_HISTORY_TOKEN.fetch_add(1, Ordering::Relaxed);
        let mut history = History {
            nodes: FxHashMap::default(),
            next_key: 1,
            current: 0,
            stage: Some(stage),
            codec: Some(codec),
            max_cached_strata: if max_cached_strata < 0 {
                DEFAULT_CACHED_STRATA
            } else {
                max_cached_strata as u64
            },
            forward_tail: 0,
            backward_tail: 0,
            scratch: Vec::new(),
            token,
        };
        let key = history.load_snapshot(root_id, NIL_CHUNK, None)?;
        history.current = key;
        if !attach {
            history.lift_all()?;
            history.stage = None;
        }
        Ok(history)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Handle to the current snapshot.
    pub fn current(&self) -> SnapshotRef {
        self.make_ref(self.current)
    }

    /// State captured by the current snapshot.
    pub fn state(&self) -> &S {
        &self.node(self.current).state
    }

    /// Stratum of the current snapshot.
    pub fn stratum(&self) -> u64 {
        self.node(self.current).stratum
    }

    /// Chunk id of the current snapshot, [`NIL_CHUNK`] while unsaved.
    pub fn chunk_id(&self) -> ChunkId {
        self.node(self.current).id
    }

    /// Whether both a stage and a codec are set.
    pub fn is_attached(&self) -> bool {
        self.stage.is_some() && self.codec.is_some()
    }

    /// Cache radius around the current snapshot.
    pub fn max_cached_strata(&self) -> u64 {
        self.max_cached_strata
    }

    /// Number of memory-resident snapshots.
    pub fn resident_snapshots(&self) -> usize {
        self.nodes.len()
    }

    /// Whether `r` refers to a memory-resident snapshot of this history.
    pub fn is_resident(&self, r: SnapshotRef) -> bool {
        r.history == self.token && self.nodes.contains_key(&r.key)
    }

    /// State captured by the referenced snapshot.
    pub fn state_of(&self, r: SnapshotRef) -> HistoryResult<&S> {
        Ok(&self.node(self.resolve(r)?).state)
    }

    /// Stratum of the referenced snapshot.
    pub fn stratum_of(&self, r: SnapshotRef) -> HistoryResult<u64> {
        Ok(self.node(self.resolve(r)?).stratum)
    }

    /// Chunk id of the referenced snapshot, [`NIL_CHUNK`] while unsaved.
    pub fn chunk_id_of(&self, r: SnapshotRef) -> HistoryResult<ChunkId> {
        Ok(self.node(self.resolve(r)?).id)
    }

    /// In-memory parent of the referenced snapshot, if hydrated.
    pub fn parent_of(&self, r: SnapshotRef) -> HistoryResult<Option<SnapshotRef>> {
        Ok(self
            .node(self.resolve(r)?)
            .previous
            .map(|p| self.make_ref(p)))
    }

    /// Recorded parent chunk id of the referenced snapshot.
    pub fn parent_chunk_of(&self, r: SnapshotRef) -> HistoryResult<ChunkId> {
        Ok(self.node(self.resolve(r)?).previous_id)
    }

    /// Forward edges of the referenced snapshot, in creation order.
    pub fn children_of(&self, r: SnapshotRef) -> HistoryResult<Vec<ChildLink>> {
        let key = self.resolve(r)?;
        Ok(self
            .node(key)
            .links
            .iter()
            .map(|l| ChildLink {
                id: l.id,
                snapshot: l.node.map(|n| self.make_ref(n)),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Mutation: advance / undo / redo
    // ------------------------------------------------------------------

    /// Record `state` as a new snapshot succeeding the current one.
    ///
    /// When attached, any other in-memory branch under the departing
    /// current snapshot is flushed forward first: the departing snapshot
    /// leaves the cache window in the forward direction, and still-hydrated
    /// children would break the radius invariant.
    pub fn advance(&mut self, state: S) -> HistoryResult<()> {
        let cur = self.current;
        let attached = self.is_attached();
        if attached {
            self.flush_sibling_branches(cur, None)?;
        }
        let (stratum, cur_id) = {
            let n = self.node(cur);
            (n.stratum, n.id)
        };
        let child = self.alloc(Node::child(state, stratum + 1, cur, cur_id));
        {
            let n = self.node_mut(cur);
            n.links.push(NextLink::fresh(child));
            // the on-disk form no longer matches; re-written on next save
            if n.id >= 0 {
                n.id = NIL_CHUNK;
            }
        }
        self.current = child;
        trace!(stratum = stratum + 1, "advanced history");
        if attached {
            self.backward_tail += 1;
            if self.forward_tail == 0 {
                self.update_cache_level()?;
            } else {
                self.forward_tail -= 1;
            }
        }
        Ok(())
    }

    /// Step back to the parent of the current snapshot.
    ///
    /// Fails at stratum 0. An elided parent is faulted in from the stage;
    /// its severed forward slot is reconnected to the current snapshot.
    pub fn undo(&mut self) -> HistoryResult<()> {
        let cur = self.current;
        let (stratum, prev, prev_id, cur_id) = {
            let n = self.node(cur);
            (n.stratum, n.previous, n.previous_id, n.id)
        };
        if stratum == 0 {
            return Err(HistoryError::state("cannot undo past the root snapshot"));
        }
        let parent = match prev {
            Some(p) => p,
            None => {
                if prev_id < 0 {
                    return Err(HistoryError::state(
                        "parent snapshot is neither in memory nor on the stage",
                    ));
                }
                let p = self.load_snapshot(prev_id, cur_id, Some(cur))?;
                if self.node(p).link_to(cur).is_none() {
                    return Err(HistoryError::state(
                        "stored parent snapshot does not reference this snapshot",
                    ));
                }
                self.node_mut(cur).previous = Some(p);
                p
            }
        };
        self.current = parent;
        trace!(stratum = stratum - 1, "undid history");
        if self.is_attached() {
            self.forward_tail += 1;
            if self.backward_tail == 0 {
                self.update_cache_level()?;
            } else {
                self.backward_tail -= 1;
            }
        }
        Ok(())
    }

    /// Undo until the current snapshot sits at `stratum`.
    pub fn undo_to(&mut self, stratum: u64) -> HistoryResult<()> {
        if stratum > self.stratum() {
            return Err(HistoryError::argument(format!(
                "stratum {stratum} is in the redo direction (current is {})",
                self.stratum()
            )));
        }
        while self.stratum() > stratum {
            self.undo()?;
        }
        Ok(())
    }

    /// Undo until the referenced snapshot is current.
    pub fn undo_to_snapshot(&mut self, target: SnapshotRef) -> HistoryResult<()> {
        let key = self.resolve(target)?;
        let target_stratum = self.node(key).stratum;
        if target_stratum > self.stratum() {
            return Err(HistoryError::argument(format!(
                "stratum {target_stratum} is in the redo direction (current is {})",
                self.stratum()
            )));
        }
        // Resident ancestors form a contiguous in-memory spine prefix, so
        // ancestorship is decidable by walking parent keys up front. The
        // step count stays correct even if a mid-loop re-slide reloads a
        // spine node under a fresh key.
        let mut steps = 0u32;
        let mut k = self.current;
        while k != key {
            match self.node(k).previous {
                Some(p) => {
                    steps += 1;
                    k = p;
                }
                None => {
                    return Err(HistoryError::argument(
                        "snapshot is not on the undo path from the current snapshot",
                    ))
                }
            }
        }
        for _ in 0..steps {
            self.undo()?;
        }
        Ok(())
    }

    /// Step forward to the child of the current snapshot stored at chunk
    /// `id`, loading it from the stage if it was elided.
    pub fn redo_by_id(&mut self, id: ChunkId) -> HistoryResult<()> {
        if id < 0 {
            return Err(HistoryError::argument(format!(
                "chunk id must be non-negative, got {id}"
            )));
        }
        let cur = self.current;
        let idx = self
            .node(cur)
            .links
            .iter()
            .position(|l| l.id == id || l.node.is_some_and(|n| self.node(n).id == id))
            .ok_or_else(|| {
                HistoryError::argument(format!(
                    "current snapshot has no child with chunk id {id}"
                ))
            })?;
        self.redo_step(idx)
    }

    /// Redo along the parent chain of `target` until it is current.
    ///
    /// `target` must be a memory-resident descendant of the current
    /// snapshot; a level with no matching forward link is a state error.
    pub fn redo_to(&mut self, target: SnapshotRef) -> HistoryResult<()> {
        let key = self.resolve(target)?;
        if key == self.current {
            return Ok(());
        }
        let target_stratum = self.node(key).stratum;
        if target_stratum <= self.stratum() {
            return Err(HistoryError::argument(format!(
                "stratum {target_stratum} is in the undo direction (current is {})",
                self.stratum()
            )));
        }
        // Collect the link index at each level, target upward. Indices
        // stay valid across the moves below even if a re-slide elides an
        // intermediate node: links are never removed, only their in-memory
        // side is cleared, and redo_step reloads through the chunk id.
        let mut steps: Vec<usize> = Vec::with_capacity((target_stratum - self.stratum()) as usize);
        let mut k = key;
        loop {
            let prev = self.node(k).previous.ok_or_else(|| {
                HistoryError::state("snapshot tree inconsistent: broken parent chain during redo")
            })?;
            let idx = self.node(prev).link_to(k).ok_or_else(|| {
                HistoryError::state("snapshot tree inconsistent: missing forward link during redo")
            })?;
            steps.push(idx);
            if prev == self.current {
                break;
            }
            if steps.len() as u64 > target_stratum {
                return Err(HistoryError::state(
                    "snapshot tree inconsistent: cycle during redo",
                ));
            }
            k = prev;
        }
        for idx in steps.into_iter().rev() {
            self.redo_step(idx)?;
        }
        Ok(())
    }

    /// Single-step redo through link `idx` of the current snapshot.
    fn redo_step(&mut self, idx: usize) -> HistoryResult<()> {
        let cur = self.current;
        let link = self.node(cur).links[idx];
        let child = match link.node {
            Some(c) => c,
            None => {
                if link.id < 0 {
                    return Err(HistoryError::state(
                        "forward link holds neither a snapshot nor a chunk id",
                    ));
                }
                let c = self.load_snapshot(link.id, NIL_CHUNK, None)?;
                self.node_mut(c).previous = Some(cur);
                self.node_mut(cur).links[idx].node = Some(c);
                c
            }
        };
        if self.is_attached() {
            self.flush_sibling_branches(cur, Some(child))?;
        }
        {
            let n = self.node_mut(cur);
            // the chosen branch is live again; re-written on next save
            n.links[idx].id = NIL_CHUNK;
            if n.id >= 0 {
                n.id = NIL_CHUNK;
            }
        }
        self.current = child;
        trace!(stratum = self.node(child).stratum, "redid history");
        if self.is_attached() {
            self.backward_tail += 1;
            if self.forward_tail == 0 {
                self.update_cache_level()?;
            } else {
                self.forward_tail -= 1;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mutation: persistence
    // ------------------------------------------------------------------

    /// Persist every unsaved reachable snapshot and elide strong
    /// references outside the cache window.
    ///
    /// After a successful save the current snapshot's
    /// [`chunk_id`](History::chunk_id) is the durable entry point: opening
    /// a history at that id reproduces the tree.
    pub fn save(&mut self) -> HistoryResult<()> {
        self.require_attached()?;
        self.save_all()
    }

    /// Change or clear the backing stage.
    ///
    /// Attaching saves the tree; detaching lifts it into memory; swapping
    /// one stage for another re-materializes the tree on the new stage
    /// with fresh chunk ids (offsets are stage-specific).
    pub fn set_stage(&mut self, stage: Option<Arc<Stage>>) -> HistoryResult<()> {
        match (&self.stage, &stage) {
            (None, None) => return Ok(()),
            (Some(a), Some(b)) if Arc::ptr_eq(a, b) => return Ok(()),
            _ => {}
        }
        match stage {
            Some(new) => {
                if self.stage.is_none() {
                    self.stage = Some(new);
                    if self.codec.is_some() {
                        info!("attaching history to stage");
                        self.save_all()?;
                    }
                } else if self.codec.is_some() {
                    self.map_to_stage(new)?;
                } else {
                    self.stage = Some(new);
                }
            }
            None => {
                if self.is_attached() {
                    self.lift_all()?;
                }
                self.stage = None;
            }
        }
        Ok(())
    }

    /// Change or clear the snapshot codec.
    ///
    /// Follows the same skeleton as [`set_stage`](History::set_stage);
    /// replacing the codec while attached re-serializes the reachable tree,
    /// since chunks written by the old codec are unreadable through the new
    /// one.
    pub fn set_codec(&mut self, codec: Option<Box<dyn NodeCodec<S>>>) -> HistoryResult<()> {
        match codec {
            Some(new) => {
                if self.codec.is_none() {
                    self.codec = Some(new);
                    if self.stage.is_some() {
                        info!("attaching history to stage");
                        self.save_all()?;
                    }
                } else if self.stage.is_some() {
                    self.hydrate_all()?;
                    self.reset_ids();
                    self.codec = Some(new);
                    self.save_all()?;
                } else {
                    self.codec = Some(new);
                }
            }
            None => {
                if self.is_attached() {
                    self.lift_all()?;
                }
                self.codec = None;
            }
        }
        Ok(())
    }

    /// Change the cache radius. Negative values clamp to the default.
    pub fn set_max_cached_strata(&mut self, radius: i64) -> HistoryResult<()> {
        let radius = if radius < 0 {
            DEFAULT_CACHED_STRATA
        } else {
            radius as u64
        };
        if radius == self.max_cached_strata {
            return Ok(());
        }
        self.max_cached_strata = radius;
        if self.is_attached() {
            self.update_cache_level()?;
        }
        Ok(())
    }

    /// Persist the whole in-memory tree and elide outside the window.
    fn save_all(&mut self) -> HistoryResult<()> {
        let cur = self.current;
        let radius = self.max_cached_strata;
        let cur_stratum = self.node(cur).stratum;
        let min_stratum = cur_stratum.saturating_sub(radius);
        let max_stratum = cur_stratum + radius;

        // forward branches, children before parents
        let children: SmallVec<[(usize, NodeKey); 2]> = self.in_memory_children(cur, None);
        for (i, c) in children {
            self.save_forward(c, max_stratum)?;
            let cid = self.node(c).id;
            {
                let n = self.node_mut(cur);
                if n.links[i].id != cid {
                    n.links[i].id = cid;
                    if n.id >= 0 {
                        n.id = NIL_CHUNK;
                    }
                }
                if radius == 0 {
                    n.links[i].node = None;
                }
            }
            if radius == 0 {
                self.drop_subtree(c);
            }
        }

        // backward spine, parents before children
        if let Some(p) = self.node(cur).previous {
            self.save_backward(p, min_stratum, Some(cur), max_stratum)?;
        }

        // the current snapshot last, with its backward link intact
        if self.needs_backward_write(cur) {
            self.persist_node(cur, true, None)?;
        }
        if min_stratum == cur_stratum && self.node(cur).previous.is_some() {
            // radius 0: even the parent leaves the window
            let pid = self.node(cur).previous.map(|p| self.node(p).id);
            if let Some(pid) = pid {
                self.node_mut(cur).previous_id = pid;
            }
            self.drop_ancestors(cur);
        }

        self.backward_tail = self.backward_extent(cur).min(radius) as i64;
        self.forward_tail = self.forward_extent(cur).min(radius) as i64;
        debug!(
            chunk = self.node(cur).id,
            resident = self.nodes.len(),
            "saved history"
        );
        Ok(())
    }

    /// Persist the spine from the in-memory top down to `key`, severing
    /// the window boundary at `min_stratum`.
    ///
    /// `skip` is the spine child of `key` on the path to the current
    /// snapshot; its slot is written as `-1` so the loader can reconnect
    /// it from context without a load.
    fn save_backward(
        &mut self,
        key: NodeKey,
        min_stratum: u64,
        skip: Option<NodeKey>,
        max_stratum: u64,
    ) -> HistoryResult<()> {
        if let Some(p) = self.node(key).previous {
            self.save_backward(p, min_stratum, Some(key), max_stratum)?;
        }
        // sibling branches hanging off the spine flush forward first, so
        // this node's written link slots hold real chunk ids
        let children: SmallVec<[(usize, NodeKey); 2]> = self.in_memory_children(key, skip);
        for (i, c) in children {
            self.save_forward(c, max_stratum)?;
            let cid = self.node(c).id;
            let n = self.node_mut(key);
            if n.links[i].id != cid {
                n.links[i].id = cid;
                if n.id >= 0 {
                    n.id = NIL_CHUNK;
                }
            }
        }
        if self.needs_backward_write(key) {
            self.persist_node(key, true, skip)?;
        }
        if self.node(key).stratum == min_stratum && self.node(key).previous.is_some() {
            let pid = self.node(key).previous.map(|p| self.node(p).id);
            if let Some(pid) = pid {
                self.node_mut(key).previous_id = pid;
            }
            self.drop_ancestors(key);
        }
        Ok(())
    }

    /// Persist the subtree under `key`, children before parents, eliding
    /// successors of nodes at or beyond `max_stratum`.
    ///
    /// Forward saves sever the backward direction on disk (`prev_id` is
    /// written as `-1`).
    fn save_forward(&mut self, key: NodeKey, max_stratum: u64) -> HistoryResult<()> {
        let at_boundary = self.node(key).stratum >= max_stratum;
        let children: SmallVec<[(usize, NodeKey); 2]> = self.in_memory_children(key, None);
        for (i, c) in children {
            self.save_forward(c, max_stratum)?;
            let cid = self.node(c).id;
            {
                let n = self.node_mut(key);
                if n.links[i].id != cid {
                    n.links[i].id = cid;
                    if n.id >= 0 {
                        n.id = NIL_CHUNK;
                    }
                }
                if at_boundary {
                    n.links[i].node = None;
                }
            }
            if at_boundary {
                self.drop_subtree(c);
            }
        }
        if self.node(key).id < 0 {
            self.persist_node(key, false, None)?;
        }
        Ok(())
    }

    /// Flush every in-memory branch under `parent` except `keep`:
    /// persist it, reduce the link to a pure chunk id, drop the subtree.
    fn flush_sibling_branches(
        &mut self,
        parent: NodeKey,
        keep: Option<NodeKey>,
    ) -> HistoryResult<()> {
        let bound = self.node(parent).stratum;
        let children: SmallVec<[(usize, NodeKey); 2]> = self.in_memory_children(parent, keep);
        for (i, c) in children {
            self.save_forward(c, bound)?;
            let cid = self.node(c).id;
            {
                let n = self.node_mut(parent);
                if n.links[i].id != cid {
                    n.links[i].id = cid;
                    if n.id >= 0 {
                        n.id = NIL_CHUNK;
                    }
                }
                n.links[i].node = None;
            }
            self.drop_subtree(c);
        }
        Ok(())
    }

    /// Re-slide the cache window around the current snapshot: evict
    /// in-memory snapshots beyond the radius in both directions, then
    /// reset the tail counters from the actual in-memory extents.
    fn update_cache_level(&mut self) -> HistoryResult<()> {
        if !self.is_attached() {
            self.forward_tail = UNBOUNDED;
            self.backward_tail = UNBOUNDED;
            return Ok(());
        }
        let cur = self.current;
        let radius = self.max_cached_strata;
        let cur_stratum = self.node(cur).stratum;
        let min_stratum = cur_stratum.saturating_sub(radius);
        let max_stratum = cur_stratum + radius;
        debug!(
            stratum = cur_stratum,
            radius, "re-sliding snapshot cache window"
        );

        self.update_forward_radius(cur, max_stratum)?;

        // find the spine node at the backward boundary
        let mut boundary = cur;
        let mut skip: Option<NodeKey> = None;
        while self.node(boundary).stratum > min_stratum {
            match self.node(boundary).previous {
                Some(p) => {
                    skip = Some(boundary);
                    boundary = p;
                }
                None => break,
            }
        }
        if self.node(boundary).stratum == min_stratum && self.node(boundary).previous.is_some() {
            self.save_backward(boundary, min_stratum, skip, max_stratum)?;
        }

        self.backward_tail = self.backward_extent(cur).min(radius) as i64;
        self.forward_tail = self.forward_extent(cur).min(radius) as i64;
        Ok(())
    }

    /// Forward half of the re-slide: below the radius recurse, at or
    /// beyond it evict in-memory successors.
    fn update_forward_radius(&mut self, key: NodeKey, max_stratum: u64) -> HistoryResult<()> {
        let at_boundary = self.node(key).stratum >= max_stratum;
        let children: SmallVec<[(usize, NodeKey); 2]> = self.in_memory_children(key, None);
        for (i, c) in children {
            if at_boundary {
                self.save_forward(c, max_stratum)?;
                let cid = self.node(c).id;
                {
                    let n = self.node_mut(key);
                    if n.links[i].id != cid {
                        n.links[i].id = cid;
                        if n.id >= 0 {
                            n.id = NIL_CHUNK;
                        }
                    }
                    n.links[i].node = None;
                }
                self.drop_subtree(c);
            } else {
                self.update_forward_radius(c, max_stratum)?;
            }
        }
        Ok(())
    }

    /// Serialize one node and append it to the stage, minting its chunk id.
    ///
    /// With `backward` the real parent chunk id is written, otherwise `-1`.
    /// The slot of `skip` (the current-side child) is written as `-1`.
    /// Children outside `skip` must already hold chunk ids.
    fn persist_node(
        &mut self,
        key: NodeKey,
        backward: bool,
        skip: Option<NodeKey>,
    ) -> HistoryResult<ChunkId> {
        let stage = self
            .stage
            .clone()
            .ok_or_else(|| HistoryError::state("history is not attached to a stage"))?;
        let (stratum, prev_id, link_ids) = {
            let node = self
                .nodes
                .get(&key)
                .expect("persisted snapshot is resident");
            let prev_id = if backward {
                match node.previous {
                    Some(p) => self.nodes.get(&p).map(|n| n.id).unwrap_or(node.previous_id),
                    None => node.previous_id,
                }
            } else {
                NIL_CHUNK
            };
            let link_ids: SmallVec<[ChunkId; 4]> = node
                .links
                .iter()
                .map(|l| match l.node {
                    Some(c) if Some(c) == skip => NIL_CHUNK,
                    Some(c) => self.nodes.get(&c).map(|n| n.id).unwrap_or(l.id),
                    None => l.id,
                })
                .collect();
            (node.stratum, prev_id, link_ids)
        };

        let enc = |e: io::Error| HistoryError::codec(format!("snapshot encode failed: {e}"));
        {
            let codec = self
                .codec
                .as_deref()
                .ok_or_else(|| HistoryError::state("history has no snapshot codec"))?;
            let node = self
                .nodes
                .get(&key)
                .expect("persisted snapshot is resident");
            let scratch = &mut self.scratch;
            scratch.clear();
            scratch.write_i64::<BigEndian>(stratum as i64).map_err(enc)?;
            scratch.write_i64::<BigEndian>(prev_id).map_err(enc)?;
            let before = scratch.len();
            codec.write_node(&node.state, &mut *scratch).map_err(enc)?;
            let written = scratch.len() - before;
            if written != codec.node_len() {
                return Err(HistoryError::codec(format!(
                    "codec wrote {written} bytes, node_len is {}",
                    codec.node_len()
                )));
            }
            scratch
                .write_i32::<BigEndian>(link_ids.len() as i32)
                .map_err(enc)?;
            for lid in &link_ids {
                scratch.write_i64::<BigEndian>(*lid).map_err(enc)?;
            }
        }
        let id = stage.append(&self.scratch)?;

        {
            let node = self.node_mut(key);
            node.id = id;
            node.saved_backward = backward;
            if backward {
                node.previous_id = prev_id;
            }
            for (i, lid) in link_ids.iter().enumerate() {
                let resolved = node.links[i].node.is_some() && node.links[i].node != skip;
                if resolved {
                    node.links[i].id = *lid;
                }
            }
        }
        // keep the parent's in-memory edge current; its on-disk slot is
        // either severed or refreshed when the parent itself is written
        let parent = self.node(key).previous;
        if let Some(p) = parent {
            if let Some(pn) = self.nodes.get_mut(&p) {
                if let Some(idx) = pn.link_to(key) {
                    pn.links[idx].id = id;
                }
            }
        }
        trace!(chunk = id, stratum, backward, "persisted snapshot");
        Ok(id)
    }

    /// Whether the node's on-disk form is missing or inaccurate for use
    /// as a backward-linked spine chunk.
    fn needs_backward_write(&self, key: NodeKey) -> bool {
        let node = self.node(key);
        if node.id < 0 || !node.saved_backward {
            return true;
        }
        match node.previous {
            Some(p) => self.node(p).id != node.previous_id,
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Loading, lifting, remapping
    // ------------------------------------------------------------------

    /// Hydrate one snapshot from the stage.
    ///
    /// A stored forward slot of `-1` (or one equal to `elided_fwd_id`) is
    /// reconstructed as the caller-supplied pair: the caller knows which
    /// in-memory snapshot the severed slot stood for.
    fn load_snapshot(
        &mut self,
        id: ChunkId,
        elided_fwd_id: ChunkId,
        elided_fwd: Option<NodeKey>,
    ) -> HistoryResult<NodeKey> {
        let stage = self
            .stage
            .clone()
            .ok_or_else(|| HistoryError::state("history is not attached to a stage"))?;
        let dec = |e: io::Error| HistoryError::codec(format!("snapshot decode failed: {e}"));

        let (stratum, prev_id, state, link_count, node_len) = {
            let codec = self
                .codec
                .as_deref()
                .ok_or_else(|| HistoryError::state("history has no snapshot codec"))?;
            let node_len = codec.node_len();
            let prefix = format::prefix_len(node_len);
            let scratch = &mut self.scratch;
            scratch.clear();
            scratch.resize(prefix, 0);
            stage.read(&mut scratch[..], id)?;

            let mut rd = &scratch[..];
            let stratum = rd.read_i64::<BigEndian>().map_err(dec)?;
            let prev_id = rd.read_i64::<BigEndian>().map_err(dec)?;
            if stratum < 0 {
                return Err(HistoryError::codec(format!(
                    "negative stratum {stratum} in chunk {id}"
                )));
            }
            let state = codec.read_node(&mut rd).map_err(dec)?;
            if rd.len() != format::LINK_COUNT_SIZE {
                return Err(HistoryError::codec(format!(
                    "codec consumed {} bytes, node_len is {node_len}",
                    node_len + format::LINK_COUNT_SIZE - rd.len()
                )));
            }
            let link_count = rd.read_i32::<BigEndian>().map_err(dec)?;
            if link_count < 0 {
                return Err(HistoryError::codec(format!(
                    "negative link count {link_count} in chunk {id}"
                )));
            }
            (stratum, prev_id, state, link_count as usize, node_len)
        };

        // link ids in batches bounded by the scratch capacity
        let mut links: SmallVec<[NextLink; 2]> = SmallVec::with_capacity(link_count);
        let batch = (format::prefix_len(node_len) / format::LINK_SIZE).max(1);
        let mut loaded = 0usize;
        while loaded < link_count {
            let n = batch.min(link_count - loaded);
            let scratch = &mut self.scratch;
            scratch.clear();
            scratch.resize(n * format::LINK_SIZE, 0);
            let off = format::links_offset(id, node_len) + (loaded * format::LINK_SIZE) as i64;
            stage.read(&mut scratch[..], off)?;
            let mut rd = &scratch[..];
            for _ in 0..n {
                let lid = rd.read_i64::<BigEndian>().map_err(dec)?;
                if lid == NIL_CHUNK || (elided_fwd_id >= 0 && lid == elided_fwd_id) {
                    links.push(NextLink {
                        id: elided_fwd_id,
                        node: elided_fwd,
                    });
                } else {
                    links.push(NextLink {
                        id: lid,
                        node: None,
                    });
                }
            }
            loaded += n;
        }

        let key = self.alloc(Node {
            stratum: stratum as u64,
            state,
            id,
            previous_id: prev_id,
            previous: None,
            saved_backward: prev_id >= 0,
            links,
        });
        trace!(chunk = id, stratum, links = link_count, "loaded snapshot");
        Ok(key)
    }

    /// Fault the entire reachable tree into memory.
    fn hydrate_all(&mut self) -> HistoryResult<()> {
        let mut top = self.current;
        loop {
            let (prev, prev_id, my_id) = {
                let n = self.node(top);
                (n.previous, n.previous_id, n.id)
            };
            match prev {
                Some(p) => top = p,
                None if prev_id >= 0 => {
                    let p = self.load_snapshot(prev_id, my_id, Some(top))?;
                    self.node_mut(top).previous = Some(p);
                    top = p;
                }
                None => break,
            }
        }
        self.hydrate_down(top)
    }

    fn hydrate_down(&mut self, key: NodeKey) -> HistoryResult<()> {
        let count = self.node(key).links.len();
        for i in 0..count {
            let link = self.node(key).links[i];
            let child = match link.node {
                Some(c) => c,
                None if link.id >= 0 => {
                    let c = self.load_snapshot(link.id, NIL_CHUNK, None)?;
                    self.node_mut(c).previous = Some(key);
                    self.node_mut(key).links[i].node = Some(c);
                    c
                }
                None => continue,
            };
            self.hydrate_down(child)?;
        }
        Ok(())
    }

    /// Hydrate everything and mark it all unsaved; disables radius logic.
    fn lift_all(&mut self) -> HistoryResult<()> {
        self.hydrate_all()?;
        self.reset_ids();
        self.forward_tail = UNBOUNDED;
        self.backward_tail = UNBOUNDED;
        info!(resident = self.nodes.len(), "lifted history into memory");
        Ok(())
    }

    /// Re-materialize the reachable tree onto a different stage.
    ///
    /// Chunk ids are offsets and cannot be reused across stages, so every
    /// node is rewritten and receives a fresh id.
    fn map_to_stage(&mut self, new_stage: Arc<Stage>) -> HistoryResult<()> {
        self.hydrate_all()?;
        self.reset_ids();
        info!(path = %new_stage.path().display(), "remapping history onto stage");
        self.stage = Some(new_stage);
        self.save_all()
    }

    fn reset_ids(&mut self) {
        for node in self.nodes.values_mut() {
            node.id = NIL_CHUNK;
            node.previous_id = NIL_CHUNK;
            node.saved_backward = false;
            for link in node.links.iter_mut() {
                link.id = NIL_CHUNK;
            }
        }
    }

    // ------------------------------------------------------------------
    // Arena plumbing
    // ------------------------------------------------------------------

    fn node(&self, key: NodeKey) -> &Node<S> {
        self.nodes.get(&key).expect("snapshot is resident")
    }

    fn node_mut(&mut self, key: NodeKey) -> &mut Node<S> {
        self.nodes.get_mut(&key).expect("snapshot is resident")
    }

    fn alloc(&mut self, node: Node<S>) -> NodeKey {
        let key = self.next_key;
        self.next_key += 1;
        self.nodes.insert(key, node);
        key
    }

    fn make_ref(&self, key: NodeKey) -> SnapshotRef {
        SnapshotRef {
            history: self.token,
            key,
        }
    }

    fn resolve(&self, r: SnapshotRef) -> HistoryResult<NodeKey> {
        if r.history != self.token {
            return Err(HistoryError::argument(
                "snapshot belongs to a different history",
            ));
        }
        if !self.nodes.contains_key(&r.key) {
            return Err(HistoryError::argument(
                "snapshot is no longer memory-resident",
            ));
        }
        Ok(r.key)
    }

    fn require_attached(&self) -> HistoryResult<()> {
        if self.is_attached() {
            Ok(())
        } else {
            Err(HistoryError::state("history is not attached to a stage"))
        }
    }

    /// In-memory children of `key` except `keep`, as (link index, key).
    fn in_memory_children(
        &self,
        key: NodeKey,
        keep: Option<NodeKey>,
    ) -> SmallVec<[(usize, NodeKey); 2]> {
        self.node(key)
            .links
            .iter()
            .enumerate()
            .filter_map(|(i, l)| match l.node {
                Some(c) if Some(c) != keep => Some((i, c)),
                _ => None,
            })
            .collect()
    }

    /// Remove a subtree from the arena.
    fn drop_subtree(&mut self, key: NodeKey) {
        if let Some(node) = self.nodes.remove(&key) {
            for link in &node.links {
                if let Some(c) = link.node {
                    self.drop_subtree(c);
                }
            }
        }
    }

    /// Sever `boundary.previous` and remove the detached ancestor chain
    /// (with its hanging subtrees) from the arena.
    fn drop_ancestors(&mut self, boundary: NodeKey) {
        let first = match self.nodes.get_mut(&boundary) {
            Some(n) => n.previous.take(),
            None => None,
        };
        let mut cursor = first.map(|p| (p, boundary));
        while let Some((k, came_from)) = cursor {
            let node = match self.nodes.remove(&k) {
                Some(n) => n,
                None => break,
            };
            for link in &node.links {
                if let Some(c) = link.node {
                    if c != came_from {
                        self.drop_subtree(c);
                    }
                }
            }
            cursor = node.previous.map(|p| (p, k));
        }
    }

    /// Number of in-memory levels behind `key`.
    fn backward_extent(&self, key: NodeKey) -> u64 {
        let mut depth = 0;
        let mut k = key;
        while let Some(p) = self.node(k).previous {
            depth += 1;
            k = p;
        }
        depth
    }

    /// Deepest in-memory descent below `key`.
    fn forward_extent(&self, key: NodeKey) -> u64 {
        self.node(key)
            .links
            .iter()
            .filter_map(|l| l.node)
            .map(|c| 1 + self.forward_extent(c))
            .max()
            .unwrap_or(0)
    }
}

impl<S> std::fmt::Debug for History<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("History")
            .field("stratum", &self.node(self.current).stratum)
            .field("resident", &self.nodes.len())
            .field("attached", &self.is_attached())
            .field("max_cached_strata", &self.max_cached_strata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    #[test]
    fn memory_only_advance_undo_redo() {
        let mut h: History<i32> = History::new(0);
        h.advance(1).unwrap();
        h.advance(2).unwrap();
        assert_eq!(h.stratum(), 2);
        assert_eq!(*h.state(), 2);
        assert_eq!(h.chunk_id(), NIL_CHUNK);

        h.undo().unwrap();
        assert_eq!(*h.state(), 1);
        let child = h.children_of(h.current()).unwrap()[0].snapshot.unwrap();
        h.redo_to(child).unwrap();
        assert_eq!(*h.state(), 2);
    }

    #[test]
    fn stratum_counts_steps_from_the_root() {
        let mut h: History<i32> = History::new(0);
        for i in 1..=7 {
            h.advance(i).unwrap();
            assert_eq!(h.stratum(), i as u64);
        }
        h.undo_to(3).unwrap();
        assert_eq!(h.stratum(), 3);
        assert_eq!(*h.state(), 3);
    }

    struct ShortCodec;

    impl NodeCodec<i32> for ShortCodec {
        fn node_len(&self) -> usize {
            4
        }

        fn write_node(&self, _value: &i32, out: &mut dyn Write) -> io::Result<()> {
            out.write_all(&[0u8; 2]) // breaks the exact-advance contract
        }

        fn read_node(&self, input: &mut dyn Read) -> io::Result<i32> {
            let mut buf = [0u8; 4];
            input.read_exact(&mut buf)?;
            Ok(i32::from_be_bytes(buf))
        }
    }

    #[test]
    fn codec_contract_violations_surface_as_codec_errors() {
        let dir = TempDir::new().unwrap();
        let stage = Arc::new(Stage::open(dir.path().join("bad.stage"), true).unwrap());
        let mut h = History::attached(0, stage, Box::new(ShortCodec));
        h.advance(1).unwrap();
        match h.save() {
            Err(HistoryError::Codec(msg)) => assert!(msg.contains("node_len")),
            other => panic!("expected a codec error, got {other:?}"),
        }
    }

    #[test]
    fn foreign_refs_are_rejected() {
        let a: History<i32> = History::new(0);
        let b: History<i32> = History::new(0);
        assert!(b.state_of(a.current()).unwrap_err().is_argument());
    }
}
