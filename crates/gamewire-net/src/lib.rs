//! Game-server transport core: packet dispatch, the suspendable handler
//! engine, and the connection state machine with its send queue, heartbeat,
//! and receive loop.

pub mod acceptor;
pub mod compression;
pub mod connection;
pub mod context;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod handler;
pub mod notices;
pub mod packet;
pub mod platform;
pub mod processor;
pub mod reconnection;
pub mod result;
pub mod send_queue;
pub mod sync;
pub mod timer;
pub mod transport;

#[cfg(test)]
mod testing;

pub use acceptor::{Acceptor, AcceptorConfig, ConnectionLimitReached, ConnectionMap};
pub use compression::CompressionConfig;
pub use connection::{
    Connection, ConnectionBuilder, ConnectionConfig, ConnectionId, ConnectionKind,
    ConnectionPolicy, ConnectionState, IdGenerator, NoPolicy, RecvState, SendState,
    SessionIdentity,
};
pub use context::NetContext;
pub use correlation::CorrelationRegistry;
pub use dispatcher::{Dispatcher, MessageReceiver, PacketCallback, PacketPredicate};
pub use error::NetError;
pub use framing::{FrameBuffer, FrameConfig, FrameError, encode_packet};
pub use handler::{HandlerContext, HandlerFactory, HandlerState, MessageHandler};
pub use packet::{MessageId, NotifierKind, Packet, PacketHeader, RelayTarget};
pub use platform::SocketConfig;
pub use processor::{HandlerTable, MessageProcessor, expire_suspended, spawn_registry_sweeper};
pub use reconnection::{ReconnectConfig, ReconnectError, ReconnectPolicy, ReconnectState};
pub use result::{Outcome, ResultCode};
pub use send_queue::SendQueue;
pub use timer::{HeartbeatScheduler, LogicTimer};
pub use transport::{
    PacketCodec, PlainCodec, TcpTransport, TcpTransportFactory, Transport, TransportFactory,
};
