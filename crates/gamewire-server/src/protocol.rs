//! Messages and handlers served by the gamewire server.

use serde::{Deserialize, Serialize};

use gamewire_net::{
    HandlerContext, HandlerTable, MessageHandler, MessageId, Outcome, Packet, ResultCode,
};

/// Echo request.
pub const ECHO_REQ: MessageId = MessageId(1);
/// Echo reply.
pub const ECHO_ACK: MessageId = MessageId(2);

/// Body of [`ECHO_REQ`] and [`ECHO_ACK`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Echo {
    pub text: String,
}

/// Replies to every echo request with the same text, on the same connection
/// and under the request's correlation id.
#[derive(Default)]
pub struct EchoHandler {
    request: Option<Echo>,
}

impl MessageHandler for EchoHandler {
    fn req_msg_id(&self) -> MessageId {
        ECHO_REQ
    }

    fn prepare(&mut self, packet: &Packet) -> Outcome {
        match packet.decode_message::<Echo>() {
            Ok(echo) => {
                self.request = Some(echo);
                Outcome::Ok
            }
            Err(e) => Outcome::fail(ResultCode::InvalidPacket, e.to_string()),
        }
    }

    fn process(&mut self, ctx: &mut HandlerContext<'_>) -> Outcome {
        let Some(echo) = self.request.take() else {
            return Outcome::fail(ResultCode::InvalidPacket, "prepare did not run");
        };
        let Some(connection) = ctx.connection() else {
            return Outcome::AlreadyProcessed;
        };

        match Packet::from_message(ECHO_ACK, &echo) {
            Ok(reply) => {
                tracing::debug!("[{}] echo {} bytes", connection.id(), echo.text.len());
                connection.send_back(reply, ctx.packet());
                Outcome::Ok
            }
            Err(e) => Outcome::fail(ResultCode::SocketSendFailed, e.to_string()),
        }
    }
}

/// Register every server handler.
pub fn register_handlers(table: &mut HandlerTable) {
    table.register(|| Box::new(EchoHandler::default()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use gamewire_net::{
        Acceptor, AcceptorConfig, NetContext, TcpTransportFactory, Transport, TransportFactory,
    };
    use tokio::net::TcpListener;

    async fn next_packet(transport: &dyn Transport) -> Packet {
        loop {
            if let Some(packet) = transport.take_packet().unwrap() {
                return packet;
            }
            let n = transport.receive().await.unwrap();
            assert!(n > 0, "Server closed early");
        }
    }

    #[test]
    fn test_handlers_are_registered() {
        let context = NetContext::new(Duration::from_secs(1));
        let mut table = context.handler_table();
        register_handlers(&mut table);
        assert!(table.processor(ECHO_REQ).is_some());
    }

    #[tokio::test]
    async fn test_echo_round_trip_over_tcp() {
        let context = NetContext::new(Duration::from_secs(1));
        let mut table = context.handler_table();
        register_handlers(&mut table);

        let acceptor = Arc::new(Acceptor::new(AcceptorConfig::default(), context));
        acceptor.add_receiver(table.into_receiver("handlers"));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::clone(&acceptor);
        tokio::spawn(async move { server.run_with_listener(listener).await });

        let client = TcpTransportFactory::default().open(addr).await.unwrap();
        let echo = Echo {
            text: "hello".to_string(),
        };
        let request = Packet::from_message(ECHO_REQ, &echo).unwrap();
        client.send(&request).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), next_packet(client.as_ref()))
            .await
            .expect("echo reply in time");
        assert_eq!(reply.message_id(), ECHO_ACK);
        assert_eq!(reply.correlation_id(), request.correlation_id());
        assert_eq!(reply.decode_message::<Echo>().unwrap(), echo);

        acceptor.shutdown();
    }

    #[test]
    fn test_undecodable_request_fails_prepare() {
        let mut handler = EchoHandler::default();
        let packet = Packet::new(ECHO_REQ, vec![0xFF, 0xFF, 0xFF]);
        assert!(handler.prepare(&packet).is_code(ResultCode::InvalidPacket));
    }
}
