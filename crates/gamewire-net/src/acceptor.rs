//! TCP acceptor: binds a listener and turns every accepted stream into a
//! started [`Connection`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::sync::{RwLock, watch};

use crate::connection::{
    Connection, ConnectionBuilder, ConnectionConfig, ConnectionId, ConnectionState,
};
use crate::context::NetContext;
use crate::dispatcher::MessageReceiver;
use crate::framing::FrameConfig;
use crate::platform::{SocketConfig, bind_listener, configure_stream, ipv4_bind_address};
use crate::result::Outcome;
use crate::sync::lock;
use crate::transport::{PacketCodec, PlainCodec, TcpTransport};

/// Error returned when the connection map is at capacity.
#[derive(Debug)]
pub struct ConnectionLimitReached;

/// Thread-safe map of live connections keyed by [`ConnectionId`].
pub struct ConnectionMap {
    inner: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    max_connections: usize,
}

impl ConnectionMap {
    /// Create a new map with the given capacity limit.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    /// Insert a connection. Returns `Err` if the map is at capacity.
    pub async fn insert(&self, connection: Arc<Connection>) -> Result<(), ConnectionLimitReached> {
        let mut map = self.inner.write().await;
        if map.len() >= self.max_connections {
            return Err(ConnectionLimitReached);
        }
        map.insert(connection.id(), connection);
        Ok(())
    }

    /// Remove a connection by ID.
    pub async fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.write().await.remove(id)
    }

    /// Look a connection up by ID.
    pub async fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.read().await.get(id).cloned()
    }

    /// Every live connection.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Remove and return every connection.
    pub async fn drain(&self) -> Vec<Arc<Connection>> {
        self.inner.write().await.drain().map(|(_, c)| c).collect()
    }

    /// Return the number of live connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Return whether the map is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Configuration for [`Acceptor`].
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// Address to bind to. Default: `0.0.0.0:7777`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections. Default: 256.
    pub max_connections: usize,
    /// Options applied to the listener and every accepted stream.
    pub socket: SocketConfig,
    /// Framing limits of accepted streams.
    pub frame: FrameConfig,
    /// Behavior of accepted connections.
    pub connection: ConnectionConfig,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            bind_addr: ipv4_bind_address(7777),
            max_connections: 256,
            socket: SocketConfig::default(),
            frame: FrameConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Accepts TCP clients and manages their connections' lifecycle.
pub struct Acceptor {
    config: AcceptorConfig,
    context: Arc<NetContext>,
    connections: Arc<ConnectionMap>,
    receivers: Mutex<Vec<Arc<MessageReceiver>>>,
    codec: Arc<dyn PacketCodec>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Acceptor {
    /// Create an acceptor sharing `context` with the rest of the process.
    pub fn new(config: AcceptorConfig, context: Arc<NetContext>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            connections: Arc::new(ConnectionMap::new(config.max_connections)),
            config,
            context,
            receivers: Mutex::new(Vec::new()),
            codec: Arc::new(PlainCodec),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Encrypt outbound packets of accepted connections with `codec`.
    pub fn with_codec(mut self, codec: Arc<dyn PacketCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Register `receiver` on every connection accepted from now on.
    pub fn add_receiver(&self, receiver: Arc<MessageReceiver>) {
        lock(&self.receivers).push(receiver);
    }

    /// Live connections.
    pub fn connections(&self) -> &Arc<ConnectionMap> {
        &self.connections
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = bind_listener(self.config.bind_addr, &self.config.socket)?;
        tracing::info!("Server listening on {}", self.config.bind_addr);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => self.on_accept(stream, peer_addr).await,
                        Err(e) => tracing::warn!("accept failed: {e}"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Server shutting down");
                        break;
                    }
                }
            }
        }

        for connection in self.connections.drain().await {
            connection.close_socket(Outcome::Ok);
        }
        Ok(())
    }

    /// Signal the accept loop to stop and close every connection.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    async fn on_accept(&self, stream: tokio::net::TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = configure_stream(&stream, &self.config.socket) {
            tracing::warn!("socket options for {peer_addr} failed: {e}");
        }

        let transport = Arc::new(TcpTransport::new(stream, self.config.frame.clone()));
        let connection = ConnectionBuilder::new(Arc::clone(&self.context))
            .config(self.config.connection.clone())
            .codec(Arc::clone(&self.codec))
            .accepted(transport);

        if self.connections.insert(Arc::clone(&connection)).await.is_err() {
            tracing::warn!("Connection limit reached, rejecting {peer_addr}");
            connection.close_socket(Outcome::Ok);
            return;
        }

        let receivers = lock(&self.receivers).clone();
        for receiver in receivers {
            connection.register_message_receiver(receiver);
        }
        tracing::info!("Accepted connection {} from {peer_addr}", connection.id());

        self.watch_disconnect(&connection);
        connection.start();
    }

    /// Drop `connection` from the map once it disconnects.
    fn watch_disconnect(&self, connection: &Arc<Connection>) {
        let id = connection.id();
        let mut states = connection.subscribe_state();
        let connections = Arc::clone(&self.connections);

        tokio::spawn(async move {
            loop {
                let state = *states.borrow_and_update();
                if state == ConnectionState::Disconnected {
                    break;
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
            connections.remove(&id).await;
            tracing::info!("Connection {id} closed");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{MessageId, Packet};
    use crate::transport::{TcpTransportFactory, Transport, TransportFactory};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    const PING: MessageId = MessageId(1);
    const PONG: MessageId = MessageId(2);

    /// Helper: start an acceptor on an ephemeral port and return the bound address.
    async fn start_test_server(max_connections: usize) -> (SocketAddr, Arc<Acceptor>) {
        let config = AcceptorConfig {
            max_connections,
            ..Default::default()
        };
        let acceptor = Arc::new(Acceptor::new(
            config,
            NetContext::new(Duration::from_secs(1)),
        ));

        let receiver = Arc::new(MessageReceiver::direct("echo"));
        receiver.register_handler(PING, |request| {
            if let Some(connection) = request.connection() {
                connection.send_back(Packet::new(PONG, Bytes::from_static(b"pong")), &request);
            }
        });
        acceptor.add_receiver(receiver);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = Arc::clone(&acceptor);
        tokio::spawn(async move {
            srv.run_with_listener(listener).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        (addr, acceptor)
    }

    async fn next_packet(transport: &dyn Transport) -> Packet {
        loop {
            if let Some(packet) = transport.take_packet().unwrap() {
                return packet;
            }
            let n = transport.receive().await.unwrap();
            assert!(n > 0, "Server closed early");
        }
    }

    #[tokio::test]
    async fn test_multiple_clients_connect() {
        let (addr, acceptor) = start_test_server(16).await;
        let mut streams = Vec::new();
        for _ in 0..5 {
            let stream = TcpStream::connect(addr).await.unwrap();
            streams.push(stream);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(acceptor.connections().len().await, 5);
    }

    #[tokio::test]
    async fn test_max_connections_enforced() {
        let max = 2;
        let (addr, acceptor) = start_test_server(max).await;

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(acceptor.connections().len().await, 2);

        let mut c3 = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(acceptor.connections().len().await <= max);

        let mut buf = [0u8; 16];
        let n = c3.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "Rejected client should receive EOF");
    }

    #[tokio::test]
    async fn test_request_is_answered_on_same_connection() {
        let (addr, _acceptor) = start_test_server(16).await;
        let client = TcpTransportFactory::default().open(addr).await.unwrap();

        let request = Packet::new(PING, Bytes::from_static(b"ping"));
        client.send(&request).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), next_packet(client.as_ref()))
            .await
            .expect("reply in time");
        assert_eq!(reply.message_id(), PONG);
        assert_eq!(reply.header.guid, request.header.guid, "Reply keeps correlation");
        assert_eq!(reply.header.sequence, 1);
    }

    #[tokio::test]
    async fn test_client_disconnect_removes_connection() {
        let (addr, acceptor) = start_test_server(16).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(acceptor.connections().len().await, 1);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(acceptor.connections().is_empty().await);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_closes_connections() {
        let (addr, acceptor) = start_test_server(16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        acceptor.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "Client should receive EOF after server shutdown");
        assert!(acceptor.connections().is_empty().await);
    }
}
