//! Conditional LZ4 compression of frame bodies.
//!
//! Every frame body starts with a flag byte. Bodies at or above the
//! configured threshold are LZ4-compressed with the original size prepended;
//! smaller ones are sent as-is to avoid the overhead.

use bytes::{BufMut, Bytes, BytesMut};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};

/// Flag byte: body is stored verbatim.
pub const COMPRESSION_FLAG_NONE: u8 = 0x00;

/// Flag byte: body is LZ4-compressed.
pub const COMPRESSION_FLAG_LZ4: u8 = 0x01;

/// Controls when frame bodies are compressed.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Minimum body size in bytes before compression is applied. Default: 512.
    pub threshold: usize,
    /// Whether compression is enabled at all. Default: true.
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 512,
            enabled: true,
        }
    }
}

/// Append the flag byte and the (possibly compressed) body to `out`.
pub fn compress_into(body: &[u8], config: &CompressionConfig, out: &mut BytesMut) {
    if !config.enabled || body.len() < config.threshold {
        out.reserve(1 + body.len());
        out.put_u8(COMPRESSION_FLAG_NONE);
        out.put_slice(body);
    } else {
        let compressed = compress_prepend_size(body);
        out.reserve(1 + compressed.len());
        out.put_u8(COMPRESSION_FLAG_LZ4);
        out.put_slice(&compressed);
    }
}

/// Strip the flag byte, decompressing when needed.
///
/// Uncompressed bodies are returned as a zero-copy slice of `frame`.
pub fn decompress_body(frame: Bytes) -> Result<Bytes, CompressionError> {
    let Some(&flag) = frame.first() else {
        return Err(CompressionError::EmptyPayload);
    };

    match flag {
        COMPRESSION_FLAG_NONE => Ok(frame.slice(1..)),
        COMPRESSION_FLAG_LZ4 => decompress_size_prepended(&frame[1..])
            .map(Bytes::from)
            .map_err(|e| CompressionError::DecompressFailed(e.to_string())),
        flag => Err(CompressionError::UnknownFlag(flag)),
    }
}

/// Errors that can occur while decompressing a frame body.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The frame body was empty, so no flag byte was present.
    #[error("empty frame body, no compression flag")]
    EmptyPayload,
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),
    /// An unknown flag byte was encountered.
    #[error("unknown compression flag: 0x{0:02X}")]
    UnknownFlag(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compress(body: &[u8], config: &CompressionConfig) -> Bytes {
        let mut out = BytesMut::new();
        compress_into(body, config, &mut out);
        out.freeze()
    }

    #[test]
    fn test_small_body_is_stored_verbatim() {
        let framed = compress(b"tiny", &CompressionConfig::default());
        assert_eq!(framed[0], COMPRESSION_FLAG_NONE);
        assert_eq!(&framed[1..], b"tiny");
    }

    #[test]
    fn test_large_body_is_compressed_and_restored() {
        let body = vec![9u8; 4096];
        let framed = compress(&body, &CompressionConfig::default());

        assert_eq!(framed[0], COMPRESSION_FLAG_LZ4);
        assert!(
            framed.len() < body.len(),
            "Compressed size {} should be below {}",
            framed.len(),
            body.len()
        );
        assert_eq!(decompress_body(framed).unwrap(), body);
    }

    #[test]
    fn test_disabled_compression_skips_lz4() {
        let config = CompressionConfig {
            threshold: 16,
            enabled: false,
        };
        let framed = compress(&[1u8; 1024], &config);
        assert_eq!(framed[0], COMPRESSION_FLAG_NONE);
    }

    #[test]
    fn test_empty_body_error() {
        assert!(matches!(
            decompress_body(Bytes::new()),
            Err(CompressionError::EmptyPayload)
        ));
    }

    #[test]
    fn test_unknown_flag_error() {
        let result = decompress_body(Bytes::from_static(&[0x7F, 1, 2]));
        assert!(matches!(result, Err(CompressionError::UnknownFlag(0x7F))));
    }

    #[test]
    fn test_corrupt_lz4_body_error() {
        // Declares 16 bytes, then a token promising more literals than follow.
        let result = decompress_body(Bytes::from_static(&[COMPRESSION_FLAG_LZ4, 16, 0, 0, 0, 0xFF]));
        assert!(matches!(result, Err(CompressionError::DecompressFailed(_))));
    }
}
