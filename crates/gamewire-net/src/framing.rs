//! Length-prefixed packet framing for TCP streams.
//!
//! Every packet on the wire is one frame:
//!
//! ```text
//! +-------------------+------------------+---------------------------------+
//! | length (4 bytes)  | flag (1 byte)    |  header + payload               |
//! | u32 little-endian | compression flag |  (LZ4-compressed when flagged)  |
//! +-------------------+------------------+---------------------------------+
//! ```
//!
//! The length counts everything after the prefix. A length of 0 is a no-op
//! padding frame and is skipped by [`FrameBuffer::take_packet`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::compression::{CompressionConfig, CompressionError, compress_into, decompress_body};
use crate::packet::{HEADER_LEN, Packet, PacketHeader};

const LEN_PREFIX: usize = 4;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed frame length in bytes. Default: 1 MB.
    pub max_payload_size: u32,
    /// Body compression settings.
    pub compression: CompressionConfig,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
            compression: CompressionConfig::default(),
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame length exceeds the configured maximum. The stream cannot be
    /// resynchronised after this.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual frame length.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// A complete frame was received but its contents are malformed. The
    /// frame has been consumed.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether the error only affects one packet and the stream is still usable.
    pub fn is_invalid_packet(&self) -> bool {
        matches!(self, FrameError::InvalidPacket(_))
    }
}

impl From<CompressionError> for FrameError {
    fn from(e: CompressionError) -> Self {
        FrameError::InvalidPacket(e.to_string())
    }
}

/// Encode `packet` into one complete frame.
pub fn encode_packet(packet: &Packet, config: &FrameConfig) -> Result<Bytes, FrameError> {
    let mut body = BytesMut::with_capacity(HEADER_LEN + packet.payload.len());
    packet.header.encode(&mut body);
    body.put_slice(&packet.payload);

    let mut frame = BytesMut::with_capacity(LEN_PREFIX + 1 + body.len());
    frame.put_u32_le(0);
    compress_into(&body, &config.compression, &mut frame);

    let len = (frame.len() - LEN_PREFIX) as u32;
    if len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: config.max_payload_size,
        });
    }
    frame[..LEN_PREFIX].copy_from_slice(&len.to_le_bytes());
    Ok(frame.freeze())
}

/// Receive buffer that accumulates stream bytes and yields whole packets.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
    config: FrameConfig,
}

impl FrameBuffer {
    /// Create an empty buffer.
    pub fn new(config: FrameConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            config,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not yet deframed bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Deframe the next packet.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn take_packet(&mut self) -> Result<Option<Packet>, FrameError> {
        loop {
            if self.buf.len() < LEN_PREFIX {
                return Ok(None);
            }
            let mut prefix = [0u8; LEN_PREFIX];
            prefix.copy_from_slice(&self.buf[..LEN_PREFIX]);
            let len = u32::from_le_bytes(prefix);

            if len > self.config.max_payload_size {
                return Err(FrameError::PayloadTooLarge {
                    size: len,
                    max: self.config.max_payload_size,
                });
            }
            if self.buf.len() < LEN_PREFIX + len as usize {
                return Ok(None);
            }

            self.buf.advance(LEN_PREFIX);
            if len == 0 {
                continue;
            }
            let frame = self.buf.split_to(len as usize).freeze();
            let mut body = decompress_body(frame)?;
            let header = PacketHeader::decode(&mut body)?;
            return Ok(Some(Packet::from_parts(header, body)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MessageId;

    fn packet(id: u32, body: &'static [u8]) -> Packet {
        Packet::new(MessageId(id), Bytes::from_static(body))
    }

    fn buffer() -> FrameBuffer {
        FrameBuffer::new(FrameConfig::default())
    }

    #[test]
    fn test_single_packet_roundtrip() {
        let config = FrameConfig::default();
        let sent = packet(10, b"hello world");
        let mut buf = buffer();
        buf.extend(&encode_packet(&sent, &config).unwrap());

        let received = buf.take_packet().unwrap().unwrap();
        assert_eq!(received.header, sent.header);
        assert_eq!(received.payload, sent.payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let frame = encode_packet(&packet(11, b"split across reads"), &FrameConfig::default())
            .unwrap();
        let mut buf = buffer();

        buf.extend(&frame[..7]);
        assert!(buf.take_packet().unwrap().is_none());

        buf.extend(&frame[7..]);
        let received = buf.take_packet().unwrap().unwrap();
        assert_eq!(&received.payload[..], b"split across reads");
    }

    #[test]
    fn test_back_to_back_frames_dont_merge() {
        let config = FrameConfig::default();
        let mut buf = buffer();
        buf.extend(&encode_packet(&packet(1, b"aaa"), &config).unwrap());
        buf.extend(&encode_packet(&packet(2, b"bbb"), &config).unwrap());

        let first = buf.take_packet().unwrap().unwrap();
        let second = buf.take_packet().unwrap().unwrap();
        assert_eq!(&first.payload[..], b"aaa");
        assert_eq!(&second.payload[..], b"bbb");
        assert!(buf.take_packet().unwrap().is_none());
    }

    #[test]
    fn test_large_payload_is_compressed_on_the_wire() {
        let config = FrameConfig::default();
        let big = Packet::new(MessageId(3), vec![5u8; 8192]);
        let frame = encode_packet(&big, &config).unwrap();
        assert!(frame.len() < 8192, "Frame should be compressed");

        let mut buf = buffer();
        buf.extend(&frame);
        let received = buf.take_packet().unwrap().unwrap();
        assert_eq!(received.payload.len(), 8192);
    }

    #[test]
    fn test_oversized_frame_rejected_on_read() {
        let mut buf = FrameBuffer::new(FrameConfig {
            max_payload_size: 16,
            ..Default::default()
        });
        buf.extend(&1024u32.to_le_bytes());
        let result = buf.take_packet();
        assert!(
            matches!(result, Err(FrameError::PayloadTooLarge { .. })),
            "Should reject oversized frame"
        );
    }

    #[test]
    fn test_oversized_frame_rejected_on_write() {
        let config = FrameConfig {
            max_payload_size: 16,
            compression: CompressionConfig {
                enabled: false,
                ..Default::default()
            },
        };
        let result = encode_packet(&packet(4, b"definitely longer than sixteen bytes"), &config);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_zero_length_frame_is_skipped() {
        let mut buf = buffer();
        buf.extend(&0u32.to_le_bytes());
        buf.extend(&encode_packet(&packet(5, b"after padding"), &FrameConfig::default()).unwrap());

        let received = buf.take_packet().unwrap().unwrap();
        assert_eq!(received.message_id(), MessageId(5));
    }

    #[test]
    fn test_malformed_frame_is_consumed() {
        let mut buf = buffer();
        // A 3-byte frame: valid flag, but far too short for a header.
        buf.extend(&3u32.to_le_bytes());
        buf.extend(&[0x00, 1, 2]);
        buf.extend(&encode_packet(&packet(6, b"next"), &FrameConfig::default()).unwrap());

        let err = buf.take_packet().unwrap_err();
        assert!(err.is_invalid_packet(), "{err}");

        let next = buf.take_packet().unwrap().unwrap();
        assert_eq!(next.message_id(), MessageId(6));
    }
}
