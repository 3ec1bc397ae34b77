//! Optional LZ4 compression of serialized frames.
//!
//! Batched flushes of many messages are compressed before they hit the
//! socket; handshakes and heartbeats are far below the threshold and go out
//! as-is. The first byte of every packed frame says which path was taken.

use lz4_flex::block::{compress_prepend_size, decompress, uncompressed_size};

/// Flag byte: the frame body follows uncompressed.
pub const COMPRESSION_FLAG_NONE: u8 = 0x00;

/// Flag byte: the frame body is LZ4-compressed with its size prepended.
pub const COMPRESSION_FLAG_LZ4: u8 = 0x01;

/// Controls when serialized frames are compressed.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Minimum serialized frame size (bytes) before compression kicks in. Default: 256.
    pub threshold: usize,
    /// Whether compression is enabled at all. Default: true.
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 256,
            enabled: true,
        }
    }
}

impl CompressionConfig {
    fn should_compress(&self, len: usize) -> bool {
        self.enabled && len >= self.threshold
    }
}

/// Errors raised while unpacking a received frame.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The frame had no flag byte.
    #[error("empty frame, missing compression flag")]
    EmptyPayload,
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),
    /// The flag byte is not one we know.
    #[error("unknown compression flag: 0x{0:02X}")]
    UnknownFlag(u8),
    /// The declared uncompressed size is above the limit.
    #[error("uncompressed size {size} exceeds maximum {max}")]
    TooLarge {
        /// Size claimed by the frame.
        size: usize,
        /// Largest size accepted.
        max: usize,
    },
}

/// Prefix a serialized frame with its flag byte, compressing it when it is large enough.
pub fn pack(frame: &[u8], config: &CompressionConfig) -> Vec<u8> {
    let (flag, body) = if config.should_compress(frame.len()) {
        (COMPRESSION_FLAG_LZ4, compress_prepend_size(frame))
    } else {
        (COMPRESSION_FLAG_NONE, frame.to_vec())
    };
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(flag);
    out.extend(body);
    out
}

/// Strip the flag byte from a received frame, decompressing if needed.
///
/// The size prefix of a compressed body is checked against `max_size` before
/// anything is allocated for it.
pub fn unpack(packed: &[u8], max_size: usize) -> Result<Vec<u8>, CompressionError> {
    let (&flag, body) = packed.split_first().ok_or(CompressionError::EmptyPayload)?;
    match flag {
        COMPRESSION_FLAG_NONE => Ok(body.to_vec()),
        COMPRESSION_FLAG_LZ4 => {
            let (size, compressed) = uncompressed_size(body)
                .map_err(|e| CompressionError::DecompressFailed(e.to_string()))?;
            if size > max_size {
                return Err(CompressionError::TooLarge { size, max: max_size });
            }
            decompress(compressed, size).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
        }
        other => Err(CompressionError::UnknownFlag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, WireKind, WireMessage, deserialize_frame, serialize_frame};

    fn batch_of(count: u64) -> Frame {
        Frame::Batch(
            (1..=count)
                .map(|sequence| WireMessage {
                    sequence,
                    ack: 0,
                    kind: WireKind::OneWay,
                    body: b"unit moved to waypoint".to_vec(),
                })
                .collect(),
        )
    }

    #[test]
    fn test_small_frame_is_not_compressed() {
        let packed = pack(b"tiny", &CompressionConfig::default());
        assert_eq!(packed[0], COMPRESSION_FLAG_NONE);
        assert_eq!(&packed[1..], b"tiny");
    }

    #[test]
    fn test_large_batch_is_compressed_and_restored() {
        let frame = batch_of(64);
        let raw = serialize_frame(&frame).unwrap();
        let packed = pack(&raw, &CompressionConfig::default());

        assert_eq!(packed[0], COMPRESSION_FLAG_LZ4);
        assert!(
            packed.len() < raw.len(),
            "packed size {} should be below raw size {}",
            packed.len(),
            raw.len()
        );

        let restored = deserialize_frame(&unpack(&packed, usize::MAX).unwrap()).unwrap();
        assert_eq!(restored, frame);
    }

    #[test]
    fn test_threshold_boundary() {
        let config = CompressionConfig {
            threshold: 10,
            enabled: true,
        };
        assert_eq!(pack(&[1u8; 9], &config)[0], COMPRESSION_FLAG_NONE);
        assert_eq!(pack(&[1u8; 10], &config)[0], COMPRESSION_FLAG_LZ4);
    }

    #[test]
    fn test_compression_disabled() {
        let config = CompressionConfig {
            threshold: 0,
            enabled: false,
        };
        let data = vec![0u8; 4096];
        let packed = pack(&data, &config);
        assert_eq!(packed[0], COMPRESSION_FLAG_NONE);
        assert_eq!(unpack(&packed, data.len()).unwrap(), data);
    }

    #[test]
    fn test_unpack_errors() {
        assert!(matches!(unpack(&[], 1024), Err(CompressionError::EmptyPayload)));
        assert!(matches!(
            unpack(&[0xFF, 0x01], 1024),
            Err(CompressionError::UnknownFlag(0xFF))
        ));
        assert!(matches!(
            unpack(&[COMPRESSION_FLAG_LZ4, 0x04, 0x00, 0x00, 0x00, 0x40], 1024),
            Err(CompressionError::DecompressFailed(_))
        ));
    }

    #[test]
    fn test_declared_size_above_limit_is_refused() {
        // Five bytes claiming a 4 GiB body.
        let packed = [COMPRESSION_FLAG_LZ4, 0xFF, 0xFF, 0xFF, 0xFF, 0x00];
        assert!(matches!(
            unpack(&packed, 1 << 20),
            Err(CompressionError::TooLarge { size: 0xFFFF_FFFF, max: 1_048_576 })
        ));

        let packed = pack(&[7u8; 4096], &CompressionConfig::default());
        assert!(matches!(
            unpack(&packed, 4095),
            Err(CompressionError::TooLarge { size: 4096, .. })
        ));
        assert_eq!(unpack(&packed, 4096).unwrap().len(), 4096);
    }

    #[test]
    fn test_sizes_around_threshold_survive() {
        let config = CompressionConfig::default();
        for size in [0, 1, 255, 256, 257, 10_000] {
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            assert_eq!(unpack(&pack(&data, &config), 10_000).unwrap(), data, "size {size}");
        }
    }
}
