//! Stage contract tests
//!
//! These exercise the append/read contract end to end on real files:
//! offset arithmetic, alignment independence of reads from append
//! boundaries, the zero-length and out-of-range edge cases, and
//! reopen-on-closed behavior.

use proptest::prelude::*;
use snaptree_storage::{Stage, StageError};
use tempfile::TempDir;

/// Capture the stage's structured logs in test output.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// Open a fresh stage under `dir` with log capture installed.
fn open_stage(dir: &TempDir, name: &str) -> Stage {
    init_tracing();
    Stage::open(dir.path().join(name), true).unwrap()
}

#[test]
fn append_read_literal_scenario() {
    let dir = TempDir::new().unwrap();
    let stage = open_stage(&dir, "s1.stage");

    assert_eq!(stage.append(&[0x01, 0x02, 0x03, 0x04]).unwrap(), 0);
    assert_eq!(stage.append(&[0x05, 0x06]).unwrap(), 4);

    let mut buf = [0u8; 4];
    stage.read(&mut buf, 1).unwrap();
    assert_eq!(buf, [0x02, 0x03, 0x04, 0x05]);

    let mut buf = [0u8; 2];
    stage.read(&mut buf, 4).unwrap();
    assert_eq!(buf, [0x05, 0x06]);

    let mut one = [0u8; 1];
    assert!(stage.read(&mut one, 6).unwrap_err().is_out_of_range());
    stage.read(&mut [], 6).unwrap();
}

#[test]
fn out_of_range_read_leaves_buffer_untouched() {
    let dir = TempDir::new().unwrap();
    let stage = open_stage(&dir, "oob.stage");
    stage.append(&[1, 2, 3]).unwrap();

    let mut buf = [0xEE; 8];
    let err = stage.read(&mut buf, 1).unwrap_err();
    assert!(matches!(
        err,
        StageError::OffsetOutOfRange {
            offset: 1,
            len: 8,
            size: 3,
            ..
        }
    ));
    assert_eq!(buf, [0xEE; 8]);
}

#[test]
fn errors_carry_the_stage_path() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("named.stage");
    let stage = Stage::open(&path, true).unwrap();

    let mut buf = [0u8; 1];
    let msg = stage.read(&mut buf, 0).unwrap_err().to_string();
    assert!(msg.contains("named.stage"));

    let msg = stage.read(&mut buf, -5).unwrap_err().to_string();
    assert!(msg.contains("-5"));
    assert!(msg.contains("named.stage"));
}

#[test]
fn close_is_transparent_to_both_operations() {
    let dir = TempDir::new().unwrap();
    let stage = open_stage(&dir, "reopen.stage");
    stage.append(&[1, 2, 3, 4]).unwrap();

    stage.close().unwrap();
    assert_eq!(stage.append(&[5]).unwrap(), 4);

    stage.close().unwrap();
    let mut buf = [0u8; 5];
    stage.read(&mut buf, 0).unwrap();
    assert_eq!(buf, [1, 2, 3, 4, 5]);

    // close is idempotent
    stage.close().unwrap();
    stage.close().unwrap();
}

#[test]
fn opening_without_truncate_keeps_chunks() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("keep.stage");
    {
        let stage = Stage::open(&path, true).unwrap();
        stage.append(&[7; 16]).unwrap();
    }
    {
        let stage = Stage::open(&path, false).unwrap();
        assert_eq!(stage.len(), 16);
    }
    {
        let stage = Stage::open(&path, true).unwrap();
        assert_eq!(stage.len(), 0);
    }
}

proptest! {
    /// Reads return the originally written bytes for any region inside the
    /// file, independent of how appends chopped the byte sequence up.
    #[test]
    fn reads_are_alignment_independent(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..16),
        seed in any::<u64>(),
    ) {
        let dir = TempDir::new().unwrap();
        let stage = open_stage(&dir, "prop.stage");

        let mut mirror = Vec::new();
        for chunk in &chunks {
            let id = stage.append(chunk).unwrap();
            prop_assert_eq!(id as usize, mirror.len());
            mirror.extend_from_slice(chunk);
        }

        // derive a handful of read regions from the seed
        let mut x = seed | 1;
        for _ in 0..8 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let offset = (x as usize >> 16) % mirror.len();
            let max_len = mirror.len() - offset;
            let len = 1 + ((x as usize >> 40) % max_len.max(1)).min(max_len - 1);

            let mut buf = vec![0u8; len];
            stage.read(&mut buf, offset as i64).unwrap();
            prop_assert_eq!(&buf[..], &mirror[offset..offset + len]);
        }
    }
}
