//! Stage: append-only chunk log over a single file
//!
//! The stage is the substrate on which persistent structures materialize
//! overflow. It exposes exactly two data operations:
//!
//! - `append(bytes) -> chunk id` — write a chunk at the end of the file
//! - `read(buf, offset)` — read a chunk whose offset and size the caller
//!   already knows
//!
//! # Invariants
//!
//! - The file is never truncated after construction.
//! - Bytes never change once written; a returned chunk id stays valid for
//!   the lifetime of the file.
//! - `append` returns the file size *before* the append, so ids are
//!   strictly increasing offsets.
//! - Each successful `append` has been flushed to the underlying storage
//!   before it returns.
//!
//! Chunk boundaries are not recorded. The file has no header; its contents
//! are exactly the concatenation of appended chunks.
//!
//! # Locking
//!
//! One stage-wide reentrant lock protects the file handle identity and
//! write ordering. [`Stage::sequence`] runs a task under the lock so that a
//! group of appends lands adjacently; reentrancy lets the task call
//! `append` and `read` directly.
//!
//! # Reopen on closed
//!
//! After [`Stage::close`], the next `read` or `append` reopens the same
//! path with the same non-truncating options and proceeds. Reopen failures
//! surface as the corresponding chunk I/O error.

use crate::error::{StageError, StageResult};
use parking_lot::ReentrantMutex;
use snaptree_core::ChunkId;
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

struct Inner {
    /// `None` between `close()` and the reopening read/append.
    file: Option<File>,
    /// Logical file size; authoritative under the single-writer model.
    len: u64,
}

/// Append-only chunk log over a single file.
///
/// `Stage` is `Send + Sync`; appends are serialized by the stage lock and
/// reads are exact positioned reads. Share it across owners with an `Arc`.
pub struct Stage {
    path: PathBuf,
    inner: ReentrantMutex<RefCell<Inner>>,
}

impl Stage {
    /// Open a stage file, creating it if missing.
    ///
    /// `truncate` discards existing contents; it applies only here, never
    /// on the reopen path.
    pub fn open(path: impl Into<PathBuf>, truncate: bool) -> StageResult<Stage> {
        let path = path.into();
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        if truncate {
            opts.truncate(true);
        }
        let file = opts.open(&path).map_err(|source| StageError::Open {
            path: path.clone(),
            source,
        })?;
        let len = file
            .metadata()
            .map_err(|source| StageError::Open {
                path: path.clone(),
                source,
            })?
            .len();

        info!(path = %path.display(), len, truncate, "opened stage file");
        Ok(Stage {
            path,
            inner: ReentrantMutex::new(RefCell::new(Inner {
                file: Some(file),
                len,
            })),
        })
    }

    /// Append one chunk and return its id (the file size before the append).
    ///
    /// The chunk is flushed to storage before this returns. Appends from
    /// concurrent callers are serialized by the stage lock.
    pub fn append(&self, buf: &[u8]) -> StageResult<ChunkId> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        self.ensure_open(&mut inner)?;

        let offset = inner.len;
        let file = inner.file.as_mut().expect("stage file is open");
        let write_err = |source| StageError::Write {
            path: self.path.clone(),
            source,
        };
        file.seek(SeekFrom::Start(offset)).map_err(write_err)?;
        file.write_all(buf).map_err(write_err)?;
        file.sync_data().map_err(write_err)?;
        inner.len = offset + buf.len() as u64;

        trace!(offset, len = buf.len(), "appended chunk");
        Ok(offset as ChunkId)
    }

    /// Read exactly `buf.len()` bytes starting at `offset`.
    ///
    /// The region `[offset, offset + buf.len())` must lie fully within the
    /// current file size. An empty buffer succeeds at any non-negative
    /// offset without touching the file. Short reads are retried until the
    /// count is met.
    pub fn read(&self, buf: &mut [u8], offset: ChunkId) -> StageResult<()> {
        if offset < 0 {
            return Err(StageError::NegativeOffset {
                path: self.path.clone(),
                offset,
            });
        }
        if buf.is_empty() {
            return Ok(());
        }

        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        self.ensure_open(&mut inner)?;

        let size = inner.len;
        let end = (offset as u64).saturating_add(buf.len() as u64);
        if end > size {
            return Err(StageError::OffsetOutOfRange {
                path: self.path.clone(),
                offset,
                len: buf.len(),
                size,
            });
        }

        let file = inner.file.as_mut().expect("stage file is open");
        let read_err = |source| StageError::Read {
            path: self.path.clone(),
            offset,
            source,
        };
        file.seek(SeekFrom::Start(offset as u64)).map_err(read_err)?;
        file.read_exact(buf).map_err(read_err)?;
        Ok(())
    }

    /// Run `task` while holding the stage lock.
    ///
    /// Appends performed inside `task` observe no interleaving from other
    /// threads, so a group of chunks lands at adjacent offsets.
    pub fn sequence<R>(&self, task: impl FnOnce() -> R) -> R {
        let _guard = self.inner.lock();
        task()
    }

    /// Sync and drop the file handle.
    ///
    /// The stage stays usable: the next `read` or `append` reopens the
    /// path transparently.
    pub fn close(&self) -> StageResult<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if let Some(file) = inner.file.take() {
            file.sync_all().map_err(|source| StageError::Close {
                path: self.path.clone(),
                source,
            })?;
            debug!(path = %self.path.display(), "closed stage file");
        }
        Ok(())
    }

    /// Current logical size of the stage file in bytes.
    pub fn len(&self) -> u64 {
        self.inner.lock().borrow().len
    }

    /// Whether the stage file holds no chunks yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reopen the file if it was closed; refreshes the tracked length.
    fn ensure_open(&self, inner: &mut Inner) -> StageResult<()> {
        if inner.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.path)
                .map_err(|source| StageError::Open {
                    path: self.path.clone(),
                    source,
                })?;
            inner.len = file
                .metadata()
                .map_err(|source| StageError::Open {
                    path: self.path.clone(),
                    source,
                })?
                .len();
            debug!(path = %self.path.display(), len = inner.len, "reopened stage file");
            inner.file = Some(file);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_stage(dir: &TempDir) -> Stage {
        Stage::open(dir.path().join("test.stage"), true).unwrap()
    }

    #[test]
    fn append_returns_previous_size() {
        let dir = TempDir::new().unwrap();
        let stage = temp_stage(&dir);

        assert_eq!(stage.append(&[1, 2, 3, 4]).unwrap(), 0);
        assert_eq!(stage.append(&[5, 6]).unwrap(), 4);
        assert_eq!(stage.len(), 6);
    }

    #[test]
    fn read_crosses_append_boundaries() {
        let dir = TempDir::new().unwrap();
        let stage = temp_stage(&dir);
        stage.append(&[0x01, 0x02, 0x03, 0x04]).unwrap();
        stage.append(&[0x05, 0x06]).unwrap();

        let mut buf = [0u8; 4];
        stage.read(&mut buf, 1).unwrap();
        assert_eq!(buf, [0x02, 0x03, 0x04, 0x05]);

        let mut buf = [0u8; 2];
        stage.read(&mut buf, 4).unwrap();
        assert_eq!(buf, [0x05, 0x06]);
    }

    #[test]
    fn read_past_end_is_out_of_range() {
        let dir = TempDir::new().unwrap();
        let stage = temp_stage(&dir);
        stage.append(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]).unwrap();

        let mut buf = [0u8; 1];
        let err = stage.read(&mut buf, 6).unwrap_err();
        assert!(err.is_out_of_range());

        let mut buf = [0u8; 4];
        let err = stage.read(&mut buf, 3).unwrap_err();
        assert!(err.is_out_of_range());
    }

    #[test]
    fn empty_read_succeeds_anywhere_non_negative() {
        let dir = TempDir::new().unwrap();
        let stage = temp_stage(&dir);
        stage.append(&[1, 2]).unwrap();

        stage.read(&mut [], 0).unwrap();
        stage.read(&mut [], 2).unwrap();
        stage.read(&mut [], 1000).unwrap();
    }

    #[test]
    fn negative_offset_is_rejected() {
        let dir = TempDir::new().unwrap();
        let stage = temp_stage(&dir);
        stage.append(&[1, 2]).unwrap();

        let mut buf = [0u8; 1];
        let err = stage.read(&mut buf, -1).unwrap_err();
        assert!(matches!(err, StageError::NegativeOffset { offset: -1, .. }));
    }

    #[test]
    fn close_then_read_reopens() {
        let dir = TempDir::new().unwrap();
        let stage = temp_stage(&dir);
        stage.append(&[9, 8, 7]).unwrap();
        stage.close().unwrap();

        let mut buf = [0u8; 3];
        stage.read(&mut buf, 0).unwrap();
        assert_eq!(buf, [9, 8, 7]);
    }

    #[test]
    fn close_then_append_reopens_without_truncating() {
        let dir = TempDir::new().unwrap();
        let stage = temp_stage(&dir);
        stage.append(&[1, 2, 3]).unwrap();
        stage.close().unwrap();

        assert_eq!(stage.append(&[4, 5]).unwrap(), 3);
        let mut buf = [0u8; 5];
        stage.read(&mut buf, 0).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn reopen_preserves_existing_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("persist.stage");
        {
            let stage = Stage::open(&path, true).unwrap();
            stage.append(&[0xAA, 0xBB]).unwrap();
        }
        let stage = Stage::open(&path, false).unwrap();
        assert_eq!(stage.len(), 2);
        assert_eq!(stage.append(&[0xCC]).unwrap(), 2);
    }

    #[test]
    fn sequence_keeps_appends_adjacent_and_reentrant() {
        let dir = TempDir::new().unwrap();
        let stage = temp_stage(&dir);

        let (a, b) = stage.sequence(|| {
            let a = stage.append(&[1]).unwrap();
            let b = stage.append(&[2, 3]).unwrap();
            (a, b)
        });
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(stage.append(&[4]).unwrap(), 3);
    }
}
