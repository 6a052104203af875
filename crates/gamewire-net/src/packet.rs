//! Packets, packet headers, and relay wrapping.
//!
//! A [`Packet`] is the unit every other module moves around: the receive loop
//! produces them, the [`Dispatcher`](crate::Dispatcher) fans them out, handlers
//! consume them, and the send queue drains them onto the wire. The payload is
//! opaque [`Bytes`], so cloning a packet for fan-out or retry is cheap.
//!
//! The fixed-size header travels in front of every payload:
//!
//! ```text
//! +------------+-----------+----------+---------+------------+------------------+-----------+------------------+
//! | message_id |   guid    | sequence | auth_id | session_id | relay_session_id | server_id | relay_message_id |
//! |  u32 LE    | 16 bytes  |  u32 LE  | u64 LE  |   u64 LE   |      u64 LE      |  u16 LE   |      u32 LE      |
//! +------------+-----------+----------+---------+------------+------------------+-----------+------------------+
//! ```

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::{Buf, BufMut, Bytes};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::NetError;
use crate::framing::FrameError;
use crate::notices;

/// Encoded size of a [`PacketHeader`] in bytes.
pub const HEADER_LEN: usize = 4 + 16 + 4 + 8 + 8 + 8 + 2 + 4;

// ---------------------------------------------------------------------------
// MessageId
// ---------------------------------------------------------------------------

/// Numeric identifier of a logical message type.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MessageId(pub u32);

impl MessageId {
    /// The zero id, never assigned to a real message.
    pub const NONE: MessageId = MessageId(0);

    /// Whether this is the zero id.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match notices::well_known_name(*self) {
            Some(name) => write!(f, "{name}({})", self.0),
            None => write!(f, "msg({})", self.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

/// Which kind of dispatcher delivered a packet.
///
/// Stamped by [`Dispatcher::notify`](crate::Dispatcher::notify) before any
/// receiver sees the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotifierKind {
    /// An outbound (connector) socket.
    Socket,
    /// A socket accepted by a server. Treated as the authority for the
    /// correlation ids it delivers.
    ServerSocket,
    /// The in-process loopback notifier.
    Internal,
}

/// Where a relay-wrapped packet is headed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayTarget {
    /// Not a relay packet.
    #[default]
    None,
    /// The session named by the header's relay-session id.
    ToSession,
    /// Every session on the current channel.
    Broadcast,
    /// A backend server.
    ToServer,
    /// A game server.
    ToGame,
    /// Any peer, without session information.
    Anonymous,
    /// A community server.
    ToCommunity,
}

impl RelayTarget {
    /// Wire message id used to wrap a packet for this target.
    pub fn message_id(self) -> Option<MessageId> {
        match self {
            RelayTarget::None => None,
            RelayTarget::ToSession => Some(notices::RELAY_PACKET),
            RelayTarget::Broadcast => Some(notices::RELAY_BROADCAST),
            RelayTarget::ToServer => Some(notices::RELAY_SERVER),
            RelayTarget::ToGame => Some(notices::RELAY_GAME),
            RelayTarget::Anonymous => Some(notices::RELAY_ANONYMOUS),
            RelayTarget::ToCommunity => Some(notices::RELAY_COMMUNITY),
        }
    }

    /// Recover the target from a wire message id.
    pub fn from_message_id(id: MessageId) -> RelayTarget {
        match id {
            notices::RELAY_PACKET => RelayTarget::ToSession,
            notices::RELAY_BROADCAST => RelayTarget::Broadcast,
            notices::RELAY_SERVER => RelayTarget::ToServer,
            notices::RELAY_GAME => RelayTarget::ToGame,
            notices::RELAY_ANONYMOUS => RelayTarget::Anonymous,
            notices::RELAY_COMMUNITY => RelayTarget::ToCommunity,
            _ => RelayTarget::None,
        }
    }
}

// ---------------------------------------------------------------------------
// PacketHeader
// ---------------------------------------------------------------------------

/// Fixed-size header carried in front of every payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketHeader {
    /// Message type on the wire. A relay id while the packet is relay-wrapped.
    pub message_id: MessageId,
    /// Correlation GUID shared by a request and every continuation of it.
    pub guid: Uuid,
    /// Per-connection send sequence, stamped at send time.
    pub sequence: u32,
    /// Opaque authenticated account id.
    pub auth_id: u64,
    /// Opaque session id.
    pub session_id: u64,
    /// Opaque session id of the relay hop.
    pub relay_session_id: u64,
    /// Opaque id of the originating server.
    pub server_id: u16,
    /// Original message id of a relay-wrapped packet, zero otherwise.
    pub relay_message_id: MessageId,
}

impl PacketHeader {
    /// Header for a freshly originated message with a new correlation GUID.
    pub fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            guid: Uuid::new_v4(),
            ..Default::default()
        }
    }

    /// String form of the GUID, used as the correlation registry key.
    pub fn correlation_id(&self) -> String {
        self.guid.to_string()
    }

    /// Copy the correlation GUID and session identifiers from `src`.
    ///
    /// Replies and relays continuing a request carry the request's GUID.
    /// With no source the header keeps its own values.
    pub fn copy_session_info_from(&mut self, src: Option<&PacketHeader>) {
        let Some(src) = src else {
            return;
        };
        self.guid = src.guid;
        self.auth_id = src.auth_id;
        self.session_id = src.session_id;
        self.relay_session_id = src.relay_session_id;
        self.server_id = src.server_id;
    }

    /// Whether the header carries a relay-wrapped message.
    pub fn is_relay_message(&self) -> bool {
        !self.relay_message_id.is_none()
            && RelayTarget::from_message_id(self.message_id) != RelayTarget::None
    }

    /// Restore the original message id of a relay-wrapped header.
    pub fn relay_to_message(&mut self) {
        if !self.is_relay_message() {
            return;
        }
        self.message_id = self.relay_message_id;
        self.relay_message_id = MessageId::NONE;
    }

    /// Append the encoded header to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.message_id.0);
        buf.put_slice(self.guid.as_bytes());
        buf.put_u32_le(self.sequence);
        buf.put_u64_le(self.auth_id);
        buf.put_u64_le(self.session_id);
        buf.put_u64_le(self.relay_session_id);
        buf.put_u16_le(self.server_id);
        buf.put_u32_le(self.relay_message_id.0);
    }

    /// Decode a header from the front of `buf`.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        if buf.remaining() < HEADER_LEN {
            return Err(FrameError::InvalidPacket(format!(
                "header needs {HEADER_LEN} bytes, got {}",
                buf.remaining()
            )));
        }
        let message_id = MessageId(buf.get_u32_le());
        let mut guid = [0u8; 16];
        buf.copy_to_slice(&mut guid);
        Ok(Self {
            message_id,
            guid: Uuid::from_bytes(guid),
            sequence: buf.get_u32_le(),
            auth_id: buf.get_u64_le(),
            session_id: buf.get_u64_le(),
            relay_session_id: buf.get_u64_le(),
            server_id: buf.get_u16_le(),
            relay_message_id: MessageId(buf.get_u32_le()),
        })
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// One inbound or outbound unit of communication.
#[derive(Clone, Default)]
pub struct Packet {
    /// Wire header.
    pub header: PacketHeader,
    /// Opaque message body.
    pub payload: Bytes,
    /// Offline-send attempts so far. Reset whenever the packet is enqueued.
    pub send_retry_count: u16,
    /// Relay destination while relay-wrapped.
    pub relay_target: RelayTarget,
    notifier: Option<NotifierKind>,
    connection: Option<Weak<Connection>>,
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .field("send_retry_count", &self.send_retry_count)
            .field("relay_target", &self.relay_target)
            .field("notifier", &self.notifier)
            .finish()
    }
}

impl Packet {
    /// Packet with a fresh correlation GUID and the given payload.
    pub fn new(message_id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            header: PacketHeader::new(message_id),
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Rebuild a packet from a decoded header and body.
    pub fn from_parts(header: PacketHeader, payload: Bytes) -> Self {
        let relay_target = if header.is_relay_message() {
            RelayTarget::from_message_id(header.message_id)
        } else {
            RelayTarget::None
        };
        Self {
            header,
            payload,
            relay_target,
            ..Default::default()
        }
    }

    /// Serialize `msg` with postcard into a new packet.
    pub fn from_message<T: Serialize>(message_id: MessageId, msg: &T) -> Result<Self, NetError> {
        let body = postcard::to_allocvec(msg)?;
        Ok(Self::new(message_id, body))
    }

    /// Deserialize the payload with postcard.
    pub fn decode_message<T: DeserializeOwned>(&self) -> Result<T, NetError> {
        Ok(postcard::from_bytes(&self.payload)?)
    }

    /// Message id on the wire.
    pub fn message_id(&self) -> MessageId {
        self.header.message_id
    }

    /// Whether the packet carries `id`.
    pub fn is_message_id(&self, id: MessageId) -> bool {
        self.header.message_id == id
    }

    /// Correlation registry key of this packet.
    pub fn correlation_id(&self) -> String {
        self.header.correlation_id()
    }

    /// Kind of the dispatcher that delivered this packet, if any.
    pub fn notifier_kind(&self) -> Option<NotifierKind> {
        self.notifier
    }

    /// Whether the packet was delivered by a dispatcher of `kind`.
    pub fn is_notifier_kind(&self, kind: NotifierKind) -> bool {
        self.notifier == Some(kind)
    }

    pub(crate) fn set_notifier_kind(&mut self, kind: NotifierKind) {
        self.notifier = Some(kind);
    }

    /// The connection this packet arrived on or will be sent on.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.as_ref().and_then(Weak::upgrade)
    }

    /// Attach the packet to `connection`.
    pub fn set_connection(&mut self, connection: &Arc<Connection>) {
        self.connection = Some(Arc::downgrade(connection));
    }

    /// Wrap the packet for `target`, remembering the original message id.
    pub fn message_to_relay(&mut self, target: RelayTarget) {
        let Some(relay_id) = target.message_id() else {
            return;
        };
        if !self.header.is_relay_message() {
            self.header.relay_message_id = self.header.message_id;
        }
        self.header.message_id = relay_id;
        self.relay_target = target;
    }

    /// Whether the packet is relay-wrapped.
    pub fn is_relay_message(&self) -> bool {
        self.header.is_relay_message()
    }

    /// Restore the original message id of a relay-wrapped packet.
    pub fn relay_to_message(&mut self) {
        self.header.relay_to_message();
        self.relay_target = RelayTarget::None;
    }
}
