//! Reserved message ids and the internal notifications the core emits.
//!
//! Internal notifications travel as ordinary packets on a connection's
//! dispatcher, so applications subscribe to them the same way they subscribe
//! to game messages. Payloads are postcard-encoded.

use serde::{Deserialize, Serialize};

use crate::packet::MessageId;
use crate::result::Outcome;

/// Liveness probe exchanged by both peers every heartbeat interval.
pub const NOTIFY_HEARTBEAT: MessageId = MessageId(0xFFFF_0001);
/// Reply to a duplicate request whose handler is still running or suspended.
pub const NOTIFY_NOT_COMPLETE: MessageId = MessageId(0xFFFF_0002);
/// A received frame could not be decoded.
pub const NOTIFY_INVALID_PACKET: MessageId = MessageId(0xFFFF_0003);
/// A queued packet could not be delivered.
pub const NOTIFY_SEND_FAILED: MessageId = MessageId(0xFFFF_0004);
/// The connection closed.
pub const NOTIFY_SOCKET_CLOSED: MessageId = MessageId(0xFFFF_0005);

/// Relay to the session named by the relay-session id.
pub const RELAY_PACKET: MessageId = MessageId(0xFFFF_0100);
/// Relay to every session on the current channel.
pub const RELAY_BROADCAST: MessageId = MessageId(0xFFFF_0101);
/// Relay to a backend server.
pub const RELAY_SERVER: MessageId = MessageId(0xFFFF_0102);
/// Relay to a game server.
pub const RELAY_GAME: MessageId = MessageId(0xFFFF_0103);
/// Relay without session information.
pub const RELAY_ANONYMOUS: MessageId = MessageId(0xFFFF_0104);
/// Relay to a community server.
pub const RELAY_COMMUNITY: MessageId = MessageId(0xFFFF_0105);

/// Name of a reserved message id, for logging.
pub fn well_known_name(id: MessageId) -> Option<&'static str> {
    let name = match id {
        NOTIFY_HEARTBEAT => "notify_heartbeat",
        NOTIFY_NOT_COMPLETE => "notify_not_complete",
        NOTIFY_INVALID_PACKET => "notify_invalid_packet",
        NOTIFY_SEND_FAILED => "notify_send_failed",
        NOTIFY_SOCKET_CLOSED => "notify_socket_closed",
        RELAY_PACKET => "relay_packet",
        RELAY_BROADCAST => "relay_broadcast",
        RELAY_SERVER => "relay_server",
        RELAY_GAME => "relay_game",
        RELAY_ANONYMOUS => "relay_anonymous",
        RELAY_COMMUNITY => "relay_community",
        _ => return None,
    };
    Some(name)
}

/// Heartbeat body. Empty on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyHeartbeat {}

/// Sent back to the requester of a duplicate correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyNotComplete {
    /// Correlation id of the request that is still in progress.
    pub guid: String,
    /// Always [`Outcome::NotComplete`].
    pub outcome: Outcome,
}

/// Raised locally when deframing a read produced a malformed packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyInvalidPacket {
    /// Decoding failure.
    pub outcome: Outcome,
}

/// Raised locally when a packet could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifySendFailed {
    /// Key of the failed packet in the connection's send-failed table.
    pub manage_id: String,
    /// Message id of the failed packet.
    pub message_id: MessageId,
    /// Why the send failed.
    pub outcome: Outcome,
}

/// Raised locally once per transition to disconnected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifySocketClosed {
    /// Disconnect reason.
    pub outcome: Outcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use crate::result::ResultCode;

    #[test]
    fn test_reserved_ids_have_names() {
        assert_eq!(well_known_name(NOTIFY_HEARTBEAT), Some("notify_heartbeat"));
        assert_eq!(well_known_name(RELAY_GAME), Some("relay_game"));
        assert_eq!(well_known_name(MessageId(42)), None);
    }

    #[test]
    fn test_send_failed_notice_travels_as_packet() {
        let notice = NotifySendFailed {
            manage_id: "abc".into(),
            message_id: MessageId(7),
            outcome: Outcome::fail(ResultCode::SocketResendOverflow, "retry count over"),
        };
        let packet = Packet::from_message(NOTIFY_SEND_FAILED, &notice).unwrap();
        assert_eq!(packet.message_id(), NOTIFY_SEND_FAILED);
        let decoded: NotifySendFailed = packet.decode_message().unwrap();
        assert_eq!(decoded, notice);
    }
}
