//! Outcomes of handler steps and connection operations.
//!
//! Handlers never report failure by panicking; every step returns an
//! [`Outcome`]. Panics are still caught by the execution engine and surface
//! as [`Outcome::ExceptionOccurred`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable reason attached to [`Outcome::Fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    /// DNS lookup for the connection's host failed.
    CantResolveHostname,
    /// Opening the transport failed.
    ConnectFailed,
    /// A received frame could not be decoded.
    InvalidPacket,
    /// Reading from the transport failed.
    SocketRecvFailed,
    /// Writing to the transport failed.
    SocketSendFailed,
    /// The peer closed the connection.
    SocketClosedByPeer,
    /// An offline packet ran out of send retries.
    SocketResendOverflow,
    /// No heartbeat arrived within the gauge window.
    SocketHeartbeatTimeout,
    /// The packet codec refused to encrypt a packet.
    EncryptFailed,
    /// A suspended handler was swept after its time-to-live.
    HandlerExpired,
    /// Application-defined code.
    Custom(u32),
}

/// Result of a handler step or connection operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Step succeeded.
    #[default]
    Ok,
    /// Step failed; the handler is cleaned up.
    Fail {
        /// Failure reason.
        code: ResultCode,
        /// Human-readable detail.
        message: String,
    },
    /// An unexpected fault was caught at the engine boundary.
    ExceptionOccurred(String),
    /// Another code path already produced the effect; stop quietly.
    AlreadyProcessed,
    /// Still waiting; do not clean up yet.
    NotComplete,
}

impl Outcome {
    /// Shorthand for [`Outcome::Fail`].
    pub fn fail(code: ResultCode, message: impl Into<String>) -> Self {
        Outcome::Fail {
            code,
            message: message.into(),
        }
    }

    /// Whether this is [`Outcome::Ok`].
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok)
    }

    /// Whether this terminates a handler with an error (fail or exception).
    pub fn is_fail(&self) -> bool {
        matches!(self, Outcome::Fail { .. } | Outcome::ExceptionOccurred(_))
    }

    /// Whether a fault was caught.
    pub fn is_exception(&self) -> bool {
        matches!(self, Outcome::ExceptionOccurred(_))
    }

    /// Whether the step is still waiting.
    pub fn is_not_complete(&self) -> bool {
        matches!(self, Outcome::NotComplete)
    }

    /// Whether the effect was already produced elsewhere.
    pub fn is_already_processed(&self) -> bool {
        matches!(self, Outcome::AlreadyProcessed)
    }

    /// The failure code, if this is [`Outcome::Fail`].
    pub fn code(&self) -> Option<ResultCode> {
        match self {
            Outcome::Fail { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this is a failure carrying `code`.
    pub fn is_code(&self, code: ResultCode) -> bool {
        self.code() == Some(code)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok => f.write_str("ok"),
            Outcome::Fail { code, message } => write!(f, "fail({code:?}): {message}"),
            Outcome::ExceptionOccurred(detail) => write!(f, "exception: {detail}"),
            Outcome::AlreadyProcessed => f.write_str("already processed"),
            Outcome::NotComplete => f.write_str("not complete"),
        }
    }
}
