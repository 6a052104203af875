//! Transport-level errors.

use crate::framing::FrameError;

/// Errors produced by transports, codecs, and payload serialization.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The host name did not resolve to any address.
    #[error("can not resolve hostname {host}: {reason}")]
    Resolve {
        /// Host that failed to resolve.
        host: String,
        /// Resolver detail.
        reason: String,
    },

    /// The transport was closed locally.
    #[error("transport closed")]
    Closed,

    /// Framing or deframing failed.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A payload could not be (de)serialized.
    #[error("payload encoding failed: {0}")]
    Encode(#[from] postcard::Error),

    /// The packet codec rejected a packet.
    #[error("codec error: {0}")]
    Codec(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
