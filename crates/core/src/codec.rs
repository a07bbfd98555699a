//! Node codec contract
//!
//! Persistent structures do not hand raw bytes to the stage directly; they
//! go through a [`NodeCodec`], the fixed-size serialization seam between a
//! user payload type and a chunk. The contract is deliberately narrow:
//!
//! - `node_len()` is a positive constant per codec instance;
//! - `write_node` advances the output by exactly `node_len()` bytes;
//! - `read_node` consumes exactly `node_len()` bytes.
//!
//! Callers that compose codecs into larger chunk layouts (the history's
//! snapshot chunks, chain nodes) rely on the exact-advance contract to
//! compute offsets without framing.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Fixed-size codec for one payload value.
///
/// Implementations must be pure with respect to the buffer: encoding writes
/// exactly [`node_len`](NodeCodec::node_len) bytes and decoding reads
/// exactly as many, regardless of the value.
pub trait NodeCodec<T> {
    /// Encoded size of one payload in bytes. Positive, constant per instance.
    fn node_len(&self) -> usize;

    /// Serialize `value`, writing exactly `node_len()` bytes to `out`.
    fn write_node(&self, value: &T, out: &mut dyn Write) -> io::Result<()>;

    /// Deserialize one payload, reading exactly `node_len()` bytes.
    fn read_node(&self, input: &mut dyn Read) -> io::Result<T>;
}

/// Big-endian codec for `i32` payloads.
///
/// Reference implementation of the codec contract; also convenient for
/// small counter-like states.
#[derive(Debug, Clone, Copy, Default)]
pub struct I32Codec;

impl NodeCodec<i32> for I32Codec {
    fn node_len(&self) -> usize {
        4
    }

    fn write_node(&self, value: &i32, out: &mut dyn Write) -> io::Result<()> {
        out.write_i32::<BigEndian>(*value)
    }

    fn read_node(&self, input: &mut dyn Read) -> io::Result<i32> {
        input.read_i32::<BigEndian>()
    }
}

/// Big-endian codec for `i64` payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct I64Codec;

impl NodeCodec<i64> for I64Codec {
    fn node_len(&self) -> usize {
        8
    }

    fn write_node(&self, value: &i64, out: &mut dyn Write) -> io::Result<()> {
        out.write_i64::<BigEndian>(*value)
    }

    fn read_node(&self, input: &mut dyn Read) -> io::Result<i64> {
        input.read_i64::<BigEndian>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn i32_codec_round_trip() {
        let codec = I32Codec;
        let mut buf = Vec::new();
        codec.write_node(&-7, &mut buf).unwrap();
        assert_eq!(buf.len(), codec.node_len());
        assert_eq!(buf, [0xFF, 0xFF, 0xFF, 0xF9]);

        let mut rd = &buf[..];
        assert_eq!(codec.read_node(&mut rd).unwrap(), -7);
        assert!(rd.is_empty());
    }

    #[test]
    fn i64_codec_is_big_endian() {
        let codec = I64Codec;
        let mut buf = Vec::new();
        codec.write_node(&0x0102030405060708, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn codec_is_object_safe() {
        let codec: Box<dyn NodeCodec<i32>> = Box::new(I32Codec);
        assert_eq!(codec.node_len(), 4);
    }

    proptest! {
        /// Every value round-trips, and both directions advance the buffer
        /// by exactly `node_len()` bytes.
        #[test]
        fn i32_codec_round_trips_exactly(value in any::<i32>()) {
            let codec = I32Codec;
            let mut buf = Vec::new();
            codec.write_node(&value, &mut buf).unwrap();
            prop_assert_eq!(buf.len(), codec.node_len());

            let mut rd = &buf[..];
            prop_assert_eq!(codec.read_node(&mut rd).unwrap(), value);
            prop_assert!(rd.is_empty());
        }

        #[test]
        fn i64_codec_round_trips_exactly(value in any::<i64>()) {
            let codec = I64Codec;
            let mut buf = Vec::new();
            codec.write_node(&value, &mut buf).unwrap();
            prop_assert_eq!(buf.len(), codec.node_len());

            let mut rd = &buf[..];
            prop_assert_eq!(codec.read_node(&mut rd).unwrap(), value);
            prop_assert!(rd.is_empty());
        }

        /// Decoding is position-independent: a value embedded mid-buffer
        /// reads back from its own offset.
        #[test]
        fn decoding_is_offset_independent(
            prefix in prop::collection::vec(any::<u8>(), 0..16),
            value in any::<i64>(),
        ) {
            let codec = I64Codec;
            let mut buf = prefix.clone();
            codec.write_node(&value, &mut buf).unwrap();

            let mut rd = &buf[prefix.len()..];
            prop_assert_eq!(codec.read_node(&mut rd).unwrap(), value);
        }
    }
}
