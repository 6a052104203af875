//! Connection state machine.
//!
//! A [`Connection`] owns one transport at a time and drives three loops over
//! it:
//!
//! - **Send**: a FIFO [`SendQueue`] drained by at most one outstanding write.
//!   The head packet stays queued until its write completes. While the
//!   connection is offline the head is retried up to
//!   [`ConnectionConfig::max_resend_count`] times, then dropped with a
//!   send-failed notification.
//! - **Receive**: reads, deframes, and fans every packet out through the
//!   connection's [`Dispatcher`]. A malformed frame raises an invalid-packet
//!   notification and keeps the connection.
//! - **Heartbeat**: a gauge reset to its maximum on connect and on every
//!   received heartbeat, decremented every interval by the shared
//!   [`HeartbeatScheduler`](crate::HeartbeatScheduler). An empty gauge is a
//!   heartbeat timeout.
//!
//! State transitions are compare-and-swap cells, so receive completion, send
//! completion, and timer ticks can race freely. Every transition to
//! [`ConnectionState::Disconnected`] happens exactly once and emits exactly one
//! socket-closed notification.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::context::NetContext;
use crate::dispatcher::{Dispatcher, MessageReceiver};
use crate::error::NetError;
use crate::notices::{
    NOTIFY_HEARTBEAT, NOTIFY_INVALID_PACKET, NOTIFY_SEND_FAILED, NOTIFY_SOCKET_CLOSED,
    NotifyHeartbeat, NotifyInvalidPacket, NotifySendFailed, NotifySocketClosed,
};
use crate::packet::{MessageId, NotifierKind, Packet, PacketHeader, RelayTarget};
use crate::result::{Outcome, ResultCode};
use crate::send_queue::SendQueue;
use crate::sync::{AtomicState, SyncState, lock, read, write};
use crate::timer::LogicTimer;
use crate::transport::{PacketCodec, PlainCodec, Transport, TransportFactory};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique id.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Socket lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never armed.
    NotConnected,
    /// Opening a transport.
    Connecting,
    /// Transport open.
    Connected,
    /// An intentional close is in progress.
    Disconnecting,
    /// Closed, ready to reconnect.
    Disconnected,
}

impl AtomicState for ConnectionState {
    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotConnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }
}

/// Whether a write is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// No write outstanding.
    NotSending,
    /// The send loop owns the queue head.
    Sending,
}

impl AtomicState for SendState {
    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        if value == 0 {
            Self::NotSending
        } else {
            Self::Sending
        }
    }
}

/// Whether a receive loop is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    /// No receive loop.
    NotReceiving,
    /// A receive loop owns the transport's read side.
    Receiving,
}

impl AtomicState for RecvState {
    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        if value == 0 {
            Self::NotReceiving
        } else {
            Self::Receiving
        }
    }
}

/// How a connection was created and where its packets go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Outbound; resolves and opens its own transport.
    Connector,
    /// Accepted by a listener.
    Acceptor,
    /// In-process; sends go to the context's internal notifier.
    Internal,
    /// In-process; sends go to the context's local-logic notifier.
    LocalLogic,
}

impl ConnectionKind {
    fn is_in_process(self) -> bool {
        matches!(self, Self::Internal | Self::LocalLogic)
    }
}

// ---------------------------------------------------------------------------
// Configuration and hooks
// ---------------------------------------------------------------------------

/// Per-connection behavior.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Run heartbeat supervision. Default: true.
    pub heartbeat_enabled: bool,
    /// Heartbeat interval. Default: 10 s.
    pub heartbeat_interval: Duration,
    /// Intervals without a heartbeat before timing out. Default: 3.
    pub heartbeat_gauge_max: i32,
    /// Disconnect on heartbeat timeout instead of only logging. Default: true.
    pub heartbeat_disconnect: bool,
    /// Offline-send attempts before a packet is dropped. Default: 5.
    pub max_resend_count: u16,
    /// One spawned write per packet instead of one draining writer task.
    /// Default: true.
    pub use_async_send: bool,
    /// Run outbound packets through the connection's codec. Default: true.
    pub use_encryption: bool,
    /// Unwrap relay packets before dispatch. Default: true.
    pub use_relay_to_message: bool,
    /// Overwrite inbound session fields with the registered identity.
    /// Default: false.
    pub header_touchable: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_enabled: true,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_gauge_max: 3,
            heartbeat_disconnect: true,
            max_resend_count: 5,
            use_async_send: true,
            use_encryption: true,
            use_relay_to_message: true,
            header_touchable: false,
        }
    }
}

/// Session fields stamped on inbound headers of a touchable connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Authenticated account id.
    pub auth_id: u64,
    /// Session id.
    pub session_id: u64,
    /// Server id.
    pub server_id: u16,
}

/// Lifecycle hooks of a connection. Every hook defaults to a no-op.
pub trait ConnectionPolicy: Send + Sync {
    /// A packet could not be sent because the connection is offline.
    /// Typically starts a reconnect.
    fn prepare_offline_send(&self, connection: &Arc<Connection>) {
        let _ = connection;
    }

    /// [`Connection::create_raw_socket`] armed a new endpoint.
    fn on_create_raw_socket(&self, connection: &Arc<Connection>) {
        let _ = connection;
    }

    /// The transport opened.
    fn on_connected(&self, connection: &Arc<Connection>) {
        let _ = connection;
    }

    /// Timers stopped during a disconnect.
    fn on_cancel_timers(&self, connection: &Arc<Connection>) {
        let _ = connection;
    }

    /// The heartbeat gauge ran empty.
    fn on_heartbeat_timeout(&self, connection: &Arc<Connection>) {
        let _ = connection;
    }

    /// Called on every scheduler pass over this connection.
    fn on_process_timer(&self, connection: &Arc<Connection>) {
        let _ = connection;
    }
}

/// Policy with no hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPolicy;

impl ConnectionPolicy for NoPolicy {}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds [`Connection`]s of every kind.
pub struct ConnectionBuilder {
    context: Arc<NetContext>,
    config: ConnectionConfig,
    policy: Arc<dyn ConnectionPolicy>,
    codec: Arc<dyn PacketCodec>,
}

impl ConnectionBuilder {
    /// Start from the default config, [`NoPolicy`], and [`PlainCodec`].
    pub fn new(context: Arc<NetContext>) -> Self {
        Self {
            context,
            config: ConnectionConfig::default(),
            policy: Arc::new(NoPolicy),
            codec: Arc::new(PlainCodec),
        }
    }

    /// Use `config`.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `policy` for lifecycle hooks.
    pub fn policy(mut self, policy: Arc<dyn ConnectionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Use `codec` for outbound encryption.
    pub fn codec(mut self, codec: Arc<dyn PacketCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// An outbound connection. Call [`Connection::create_raw_socket`] and
    /// [`Connection::connect`] to bring it up.
    pub fn connector(self, factory: Arc<dyn TransportFactory>) -> Arc<Connection> {
        self.build(
            ConnectionKind::Connector,
            Some(factory),
            None,
            ConnectionState::NotConnected,
        )
    }

    /// A connection over an accepted transport, already connected. Call
    /// [`Connection::start`] once its receivers are registered.
    pub fn accepted(self, transport: Arc<dyn Transport>) -> Arc<Connection> {
        self.build(
            ConnectionKind::Acceptor,
            None,
            Some(transport),
            ConnectionState::Connected,
        )
    }

    /// An in-process connection delivering to the internal notifier.
    pub fn internal(self) -> Arc<Connection> {
        self.build(
            ConnectionKind::Internal,
            None,
            None,
            ConnectionState::Connected,
        )
    }

    /// An in-process connection delivering to the local-logic notifier.
    pub fn local_logic(self) -> Arc<Connection> {
        self.build(
            ConnectionKind::LocalLogic,
            None,
            None,
            ConnectionState::Connected,
        )
    }

    fn build(
        self,
        kind: ConnectionKind,
        factory: Option<Arc<dyn TransportFactory>>,
        transport: Option<Arc<dyn Transport>>,
        initial: ConnectionState,
    ) -> Arc<Connection> {
        let id = self.context.next_connection_id();
        let notifier_kind = match kind {
            ConnectionKind::Acceptor => NotifierKind::ServerSocket,
            ConnectionKind::Connector => NotifierKind::Socket,
            ConnectionKind::Internal | ConnectionKind::LocalLogic => NotifierKind::Internal,
        };
        let (state_tx, _) = watch::channel(initial);

        Arc::new_cyclic(|me: &Weak<Connection>| {
            let socket_receiver = Arc::new(MessageReceiver::direct(format!("{id}.socket")));
            let owner = me.clone();
            socket_receiver.register_handler(NOTIFY_HEARTBEAT, move |_| {
                if let Some(connection) = owner.upgrade() {
                    connection.reset_heartbeat_gauge();
                }
            });
            let dispatcher = Dispatcher::new(notifier_kind, id.to_string());
            dispatcher.add_receiver(socket_receiver);

            Connection {
                id,
                kind,
                me: me.clone(),
                heartbeat_gauge: AtomicI32::new(self.config.heartbeat_gauge_max),
                heartbeat_timer: Mutex::new(LogicTimer::new(self.config.heartbeat_interval)),
                config: self.config,
                context: self.context,
                policy: self.policy,
                codec: self.codec,
                factory,
                state: SyncState::new(initial),
                send_state: SyncState::new(SendState::NotSending),
                recv_state: SyncState::new(RecvState::NotReceiving),
                state_tx,
                transport: RwLock::new(transport),
                endpoint: Mutex::new(None),
                socket_lock: tokio::sync::Mutex::new(()),
                dispatcher,
                send_queue: SendQueue::new(),
                sequence: AtomicU32::new(0),
                identity: Mutex::new(SessionIdentity::default()),
                disconnect_reason: Mutex::new(Outcome::Ok),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One peer link: send queue, receive loop, heartbeat, and dispatcher.
pub struct Connection {
    id: ConnectionId,
    kind: ConnectionKind,
    me: Weak<Connection>,
    config: ConnectionConfig,
    context: Arc<NetContext>,
    policy: Arc<dyn ConnectionPolicy>,
    codec: Arc<dyn PacketCodec>,
    factory: Option<Arc<dyn TransportFactory>>,

    state: SyncState<ConnectionState>,
    send_state: SyncState<SendState>,
    recv_state: SyncState<RecvState>,
    state_tx: watch::Sender<ConnectionState>,

    transport: RwLock<Option<Arc<dyn Transport>>>,
    endpoint: Mutex<Option<(String, SocketAddr)>>,
    socket_lock: tokio::sync::Mutex<()>,

    dispatcher: Dispatcher,
    send_queue: SendQueue,
    sequence: AtomicU32,
    heartbeat_gauge: AtomicI32,
    heartbeat_timer: Mutex<LogicTimer>,
    identity: Mutex<SessionIdentity>,
    disconnect_reason: Mutex<Outcome>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("send_state", &self.send_state)
            .field("recv_state", &self.recv_state)
            .finish()
    }
}

impl Connection {
    // -- accessors ----------------------------------------------------------

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// How the connection was created.
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Behavior settings.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Observe every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Whether the transport is open.
    pub fn is_connected(&self) -> bool {
        self.state.is(ConnectionState::Connected)
    }

    /// Current send sub-state.
    pub fn send_state(&self) -> SendState {
        self.send_state.get()
    }

    /// Current receive sub-state.
    pub fn recv_state(&self) -> RecvState {
        self.recv_state.get()
    }

    /// Remaining heartbeat intervals before a timeout.
    pub fn heartbeat_gauge(&self) -> i32 {
        self.heartbeat_gauge.load(Ordering::Acquire)
    }

    /// Reason of the last disconnect, [`Outcome::Ok`] if none.
    pub fn disconnect_reason(&self) -> Outcome {
        lock(&self.disconnect_reason).clone()
    }

    /// Address resolved by the last [`create_raw_socket`](Self::create_raw_socket).
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        lock(&self.endpoint).as_ref().map(|(_, addr)| *addr)
    }

    /// Remote address of the open transport.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.current_transport().and_then(|t| t.peer_addr())
    }

    /// Packets waiting in the send queue.
    pub fn send_queue_len(&self) -> usize {
        self.send_queue.len()
    }

    /// Dispatcher receiving every inbound packet and local notification.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Append a receiver to this connection's dispatcher.
    pub fn register_message_receiver(&self, receiver: Arc<MessageReceiver>) {
        self.dispatcher.add_receiver(receiver);
    }

    /// Identity stamped on inbound headers when the connection is touchable.
    pub fn set_session_identity(&self, identity: SessionIdentity) {
        *lock(&self.identity) = identity;
    }

    /// Registered session identity.
    pub fn session_identity(&self) -> SessionIdentity {
        *lock(&self.identity)
    }

    fn arc(&self) -> Option<Arc<Connection>> {
        self.me.upgrade()
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        read(&self.transport).clone()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.set(state);
        self.state_tx.send_replace(state);
    }

    fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(task);
                true
            }
            Err(_) => {
                tracing::error!("[{}] no tokio runtime to drive connection I/O", self.id);
                false
            }
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Arm an outbound connection for `host:port`.
    ///
    /// Closes the previous transport, resolves the host, resets the heartbeat
    /// gauge and the send sub-state, and leaves the connection
    /// [`Disconnected`](ConnectionState::Disconnected), ready for
    /// [`connect`](Self::connect).
    pub async fn create_raw_socket(&self, host: &str, port: u16) -> Outcome {
        let Some(factory) = self.factory.clone() else {
            return Outcome::fail(
                ResultCode::ConnectFailed,
                format!("{} connection has no transport factory", self.kind_name()),
            );
        };
        let _guard = self.socket_lock.lock().await;

        self.release_transport();

        let addr = match factory.resolve(host, port).await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("[{}] {e}", self.id);
                return Outcome::fail(ResultCode::CantResolveHostname, e.to_string());
            }
        };
        *lock(&self.endpoint) = Some((host.to_string(), addr));
        tracing::debug!("[{}] armed {host}:{port} -> {addr}", self.id);

        self.reset_heartbeat_gauge();
        if let Some(this) = self.arc() {
            self.policy.on_create_raw_socket(&this);
        }
        self.send_state.set(SendState::NotSending);
        self.set_state(ConnectionState::Disconnected);
        Outcome::Ok
    }

    /// Open the transport to the armed endpoint and start the loops.
    pub async fn connect(&self) -> Outcome {
        let Some(factory) = self.factory.clone() else {
            return Outcome::fail(
                ResultCode::ConnectFailed,
                format!("{} connection can not connect", self.kind_name()),
            );
        };
        let Some(addr) = self.remote_addr() else {
            return Outcome::fail(ResultCode::ConnectFailed, "no endpoint, call create_raw_socket");
        };

        if let Err(current) = self.state.transition_from_any(
            &[ConnectionState::NotConnected, ConnectionState::Disconnected],
            ConnectionState::Connecting,
        ) {
            tracing::debug!("[{}] connect skipped, state {current:?}", self.id);
            return Outcome::fail(
                ResultCode::ConnectFailed,
                format!("already in progress ({current:?})"),
            );
        }
        self.state_tx.send_replace(ConnectionState::Connecting);
        tracing::info!("[{}] connecting to {addr}", self.id);

        let transport = match factory.open(addr).await {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!("[{}] connect to {addr} failed: {e}", self.id);
                if self
                    .state
                    .transition(ConnectionState::Connecting, ConnectionState::Disconnected)
                    .is_ok()
                {
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                }
                return Outcome::fail(ResultCode::ConnectFailed, e.to_string());
            }
        };

        *write(&self.transport) = Some(Arc::clone(&transport));
        if let Err(current) = self
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Connected)
        {
            tracing::info!("[{}] closed while connecting ({current:?})", self.id);
            self.release_transport();
            return Outcome::fail(ResultCode::ConnectFailed, "closed while connecting");
        }
        self.state_tx.send_replace(ConnectionState::Connected);
        tracing::info!("[{}] connected to {addr}", self.id);

        self.start();
        Outcome::Ok
    }

    /// Connect again unless already connected.
    pub async fn reconnect(&self) -> Outcome {
        if self.is_connected() {
            return Outcome::Ok;
        }
        self.connect().await
    }

    /// Bring up a connected connection: reset the gauge, run the
    /// on-connected hook, start timers, and start the socket loops.
    pub fn start(&self) {
        self.reset_heartbeat_gauge();
        if let Some(this) = self.arc() {
            self.policy.on_connected(&this);
        }
        self.start_timers();
        self.start_socket();
    }

    /// Prime the send loop and start the receive loop.
    pub fn start_socket(&self) {
        if self.kind.is_in_process() {
            return;
        }
        let Some(transport) = self.current_transport() else {
            tracing::warn!("[{}] start_socket without a transport", self.id);
            return;
        };
        self.begin_send();
        self.begin_receive(transport);
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            ConnectionKind::Connector => "connector",
            ConnectionKind::Acceptor => "accepted",
            ConnectionKind::Internal => "internal",
            ConnectionKind::LocalLogic => "local-logic",
        }
    }

    // -- receive ------------------------------------------------------------

    fn begin_receive(&self, transport: Arc<dyn Transport>) {
        if let Err(current) = self
            .recv_state
            .transition(RecvState::NotReceiving, RecvState::Receiving)
        {
            tracing::debug!("[{}] receive already in progress ({current:?})", self.id);
            return;
        }
        let Some(this) = self.arc() else {
            self.recv_state.set(RecvState::NotReceiving);
            return;
        };
        if !self.spawn(this.receive_loop(transport)) {
            self.recv_state.set(RecvState::NotReceiving);
        }
    }

    async fn receive_loop(self: Arc<Self>, transport: Arc<dyn Transport>) {
        while self.is_connected() {
            match transport.receive().await {
                Ok(0) => {
                    self.on_disconnected(Outcome::fail(
                        ResultCode::SocketClosedByPeer,
                        "closed by peer",
                    ));
                    break;
                }
                Ok(_) => {
                    if !self.deframe(transport.as_ref()) {
                        break;
                    }
                }
                Err(NetError::Closed) => break,
                Err(e) => {
                    self.on_disconnected(Outcome::fail(ResultCode::SocketRecvFailed, e.to_string()));
                    break;
                }
            }
        }

        if self.is_current_transport(&transport) {
            self.recv_state.set(RecvState::NotReceiving);
        }
        tracing::trace!("[{}] receive loop ended", self.id);
    }

    fn is_current_transport(&self, transport: &Arc<dyn Transport>) -> bool {
        read(&self.transport)
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, transport))
    }

    /// Dispatch every complete packet. Returns `false` when the loop must stop.
    fn deframe(self: &Arc<Self>, transport: &dyn Transport) -> bool {
        loop {
            match transport.take_packet() {
                Ok(Some(packet)) => self.dispatch_inbound(packet),
                Ok(None) => return true,
                Err(e) if e.is_invalid_packet() => {
                    tracing::warn!("[{}] {e}", self.id);
                    self.notify_invalid_packet(Outcome::fail(
                        ResultCode::InvalidPacket,
                        e.to_string(),
                    ));
                    return true;
                }
                Err(e) => {
                    self.on_disconnected(Outcome::fail(ResultCode::SocketRecvFailed, e.to_string()));
                    return false;
                }
            }
        }
    }

    fn dispatch_inbound(self: &Arc<Self>, mut packet: Packet) {
        if self.config.header_touchable {
            self.touch_header(&mut packet.header);
        }
        if self.config.use_relay_to_message {
            packet.relay_to_message();
        }
        packet.set_connection(self);

        let id = packet.message_id();
        if !self.dispatcher.notify(packet) {
            tracing::error!("[{}] unregistered message {id}", self.id);
        }
    }

    /// Stamp the registered identity on an inbound header.
    pub fn touch_header(&self, header: &mut PacketHeader) {
        let identity = *lock(&self.identity);
        header.auth_id = identity.auth_id;
        header.session_id = identity.session_id;
        header.server_id = identity.server_id;
    }

    // -- send ---------------------------------------------------------------

    /// Queue `packet` and kick the send loop.
    ///
    /// Queued sends report failures only through send-failed notifications.
    pub fn send_packet(&self, mut packet: Packet) {
        packet.send_retry_count = 0;
        if self.kind.is_in_process() {
            self.deliver_in_process(packet);
            return;
        }
        self.send_queue.push(packet);
        self.begin_send();
    }

    /// Write `packet` right away, bypassing the queue.
    ///
    /// Falls back to the queue while the connection is offline.
    pub async fn send_packet_sync(&self, mut packet: Packet) -> Outcome {
        packet.send_retry_count = 0;
        if self.kind.is_in_process() {
            self.deliver_in_process(packet);
            return Outcome::Ok;
        }
        let transport = match self.current_transport() {
            Some(transport) if self.is_connected() => transport,
            _ => {
                tracing::debug!("[{}] offline, queueing {}", self.id, packet.message_id());
                self.send_queue.push(packet);
                self.begin_send();
                return Outcome::Ok;
            }
        };

        let wire = match self.prepare_wire(&packet) {
            Ok(wire) => wire,
            Err(outcome) => {
                self.notify_send_fail(packet, outcome.clone());
                return outcome;
            }
        };
        match transport.send(&wire).await {
            Ok(()) => Outcome::Ok,
            Err(e) => {
                let outcome = Outcome::fail(ResultCode::SocketSendFailed, e.to_string());
                self.notify_send_fail(packet, outcome.clone());
                if self.is_current_transport(&transport) {
                    self.on_disconnected(outcome.clone());
                }
                outcome
            }
        }
    }

    fn deliver_in_process(&self, mut packet: Packet) {
        packet.relay_to_message();
        if let Some(this) = self.arc() {
            packet.set_connection(&this);
        }
        let notifier = match self.kind {
            ConnectionKind::LocalLogic => self.context.local_notifier(),
            _ => self.context.internal_notifier(),
        };
        let id = packet.message_id();
        if !notifier.notify(packet) {
            tracing::error!("[{}] {}: unregistered message {id}", self.id, notifier.name());
        }
    }

    /// Take ownership of the queue head and write it.
    ///
    /// Returns `false` when another send is in progress or nothing is queued.
    pub fn begin_send(&self) -> bool {
        if self
            .send_state
            .transition(SendState::NotSending, SendState::Sending)
            .is_err()
        {
            tracing::trace!("[{}] send already in progress", self.id);
            return false;
        }
        if self.send_queue.is_empty() {
            self.send_state.set(SendState::NotSending);
            // A push may have landed between the check and the release.
            if !self.send_queue.is_empty() {
                return self.begin_send();
            }
            return false;
        }
        self.send_internal();
        true
    }

    fn send_internal(&self) {
        let transport = match self.current_transport() {
            Some(transport) if self.is_connected() => transport,
            _ => {
                self.process_offline_send();
                return;
            }
        };
        let Some(this) = self.arc() else {
            self.send_state.set(SendState::NotSending);
            return;
        };

        if !self.config.use_async_send {
            if !self.spawn(this.drain_send_queue(transport)) {
                self.send_state.set(SendState::NotSending);
            }
            return;
        }

        let Some(packet) = self.send_queue.peek() else {
            self.send_state.set(SendState::NotSending);
            return;
        };
        let wire = match self.prepare_wire(&packet) {
            Ok(wire) => wire,
            Err(outcome) => {
                if let Some(packet) = self.send_queue.pop() {
                    self.notify_send_fail(packet, outcome);
                }
                self.send_state.set(SendState::NotSending);
                self.begin_send();
                return;
            }
        };
        let spawned = self.spawn(async move {
            let result = transport.send(&wire).await;
            this.on_end_send(&transport, result);
        });
        if !spawned {
            self.send_state.set(SendState::NotSending);
        }
    }

    /// Stamp the next sequence and encrypt a copy of `packet`.
    ///
    /// The queued original stays unencrypted so a retried packet is never
    /// encrypted twice.
    fn prepare_wire(&self, packet: &Packet) -> Result<Packet, Outcome> {
        let mut wire = packet.clone();
        wire.header.sequence = self.sequence.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        if self.config.use_encryption {
            self.codec
                .encrypt(&mut wire)
                .map_err(|e| Outcome::fail(ResultCode::EncryptFailed, e.to_string()))?;
        }
        Ok(wire)
    }

    /// Completion of a write issued on `transport`.
    ///
    /// The send slot belongs to the current transport. A completion from a
    /// released transport must not touch the queue, the slot, or the state.
    fn on_end_send(&self, transport: &Arc<dyn Transport>, result: Result<(), NetError>) {
        if !self.is_current_transport(transport) {
            tracing::debug!(
                "[{}] ignoring send completion from a released transport",
                self.id
            );
            return;
        }
        match result {
            Ok(()) => {
                self.send_queue.pop();
                self.send_state.set(SendState::NotSending);
                self.begin_send();
            }
            Err(e) => {
                let outcome = Outcome::fail(ResultCode::SocketSendFailed, e.to_string());
                tracing::warn!("[{}] send failed: {e}", self.id);
                if let Some(packet) = self.send_queue.pop() {
                    self.notify_send_fail(packet, outcome.clone());
                }
                self.send_state.set(SendState::NotSending);
                self.on_disconnected(outcome);
            }
        }
    }

    async fn drain_send_queue(self: Arc<Self>, transport: Arc<dyn Transport>) {
        while let Some(packet) = self.send_queue.peek() {
            let wire = match self.prepare_wire(&packet) {
                Ok(wire) => wire,
                Err(outcome) => {
                    if let Some(packet) = self.send_queue.pop() {
                        self.notify_send_fail(packet, outcome);
                    }
                    continue;
                }
            };
            if let Err(e) = transport.send(&wire).await {
                self.on_end_send(&transport, Err(e));
                return;
            }
            if !self.is_current_transport(&transport) {
                tracing::debug!("[{}] transport released while draining", self.id);
                return;
            }
            self.send_queue.pop();
        }
        if !self.is_current_transport(&transport) {
            return;
        }
        self.send_state.set(SendState::NotSending);
        if !self.send_queue.is_empty() {
            self.begin_send();
        }
    }

    /// Offline-send policy for the queue head. Runs with the send sub-state
    /// held and always releases it.
    fn process_offline_send(&self) {
        let Some(head) = self.send_queue.peek() else {
            self.send_state.set(SendState::NotSending);
            return;
        };

        if head.is_message_id(NOTIFY_HEARTBEAT) {
            self.send_queue.pop();
            self.send_state.set(SendState::NotSending);
            self.request_reconnect();
            return;
        }

        if head.send_retry_count >= self.config.max_resend_count {
            if let Some(packet) = self.send_queue.pop() {
                tracing::warn!(
                    "[{}] {} dropped after {} offline attempts",
                    self.id,
                    packet.message_id(),
                    packet.send_retry_count
                );
                self.notify_send_fail(
                    packet,
                    Outcome::fail(ResultCode::SocketResendOverflow, "resend count exceeded"),
                );
            }
            self.send_state.set(SendState::NotSending);
            return;
        }

        self.send_queue.with_head(|p| p.send_retry_count += 1);
        self.send_state.set(SendState::NotSending);
        if self.state.is(ConnectionState::Connecting) {
            return;
        }
        self.request_reconnect();
    }

    fn request_reconnect(&self) {
        if let Some(this) = self.arc() {
            self.policy.prepare_offline_send(&this);
        }
    }

    // -- disconnect ---------------------------------------------------------

    /// React to a transport failure or peer close.
    pub fn on_disconnected(&self, reason: Outcome) {
        if self.state.is(ConnectionState::Disconnected) {
            tracing::warn!("[{}] already disconnected: {reason}", self.id);
            return;
        }
        if let Err(current) = self.state.transition_from_any(
            &[ConnectionState::NotConnected, ConnectionState::Connected],
            ConnectionState::Disconnected,
        ) {
            tracing::debug!("[{}] disconnect skipped in {current:?}: {reason}", self.id);
            return;
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        tracing::info!("[{}] disconnected: {reason}", self.id);
        self.finish_disconnect(reason);
    }

    /// Close the connection on purpose.
    pub fn close_socket(&self, reason: Outcome) {
        if self.kind.is_in_process() || self.state.is(ConnectionState::Disconnected) {
            return;
        }
        if let Err(current) = self.state.transition_from_any(
            &[
                ConnectionState::NotConnected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ],
            ConnectionState::Disconnecting,
        ) {
            tracing::debug!("[{}] close skipped in {current:?}", self.id);
            return;
        }
        self.state_tx.send_replace(ConnectionState::Disconnecting);

        self.cancel_timers();
        self.dispatcher.clear_message_queues();
        self.set_state(ConnectionState::Disconnected);

        if reason.is_fail() {
            tracing::error!("[{}] closed: {reason}", self.id);
        } else {
            tracing::info!("[{}] closed", self.id);
        }
        self.finish_disconnect(reason);
    }

    fn finish_disconnect(&self, reason: Outcome) {
        self.cancel_timers();
        self.release_transport();
        *lock(&self.disconnect_reason) = reason.clone();
        self.notify_local(NOTIFY_SOCKET_CLOSED, &NotifySocketClosed { outcome: reason });
    }

    /// Close and forget the current transport. A write still pending on it
    /// no longer holds the send slot.
    fn release_transport(&self) {
        if let Some(transport) = write(&self.transport).take() {
            transport.close();
            self.recv_state.set(RecvState::NotReceiving);
            self.send_state.set(SendState::NotSending);
        }
    }

    // -- timers -------------------------------------------------------------

    fn start_timers(&self) {
        if !self.config.heartbeat_enabled || self.kind.is_in_process() {
            return;
        }
        {
            let mut timer = lock(&self.heartbeat_timer);
            timer.set_timer(self.config.heartbeat_interval);
            timer.activate();
        }
        if let Some(this) = self.arc() {
            self.context.heartbeat().register(&this);
        }
    }

    fn cancel_timers(&self) {
        lock(&self.heartbeat_timer).deactivate();
        if let Some(this) = self.arc() {
            self.policy.on_cancel_timers(&this);
        }
    }

    /// Whether the heartbeat timer is running.
    pub fn heartbeat_timer_active(&self) -> bool {
        lock(&self.heartbeat_timer).is_active()
    }

    /// Scheduler entry point: fire the heartbeat if its interval elapsed.
    pub fn process_timer(&self) {
        let expired = lock(&self.heartbeat_timer).expired();
        if expired {
            self.handle_heartbeat_timer();
        }
        if let Some(this) = self.arc() {
            self.policy.on_process_timer(&this);
        }
    }

    /// One heartbeat interval elapsed.
    pub fn handle_heartbeat_timer(&self) {
        if !self.is_connected() {
            return;
        }
        let remaining = self.heartbeat_gauge.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 0 {
            match Packet::from_message(NOTIFY_HEARTBEAT, &NotifyHeartbeat {}) {
                Ok(heartbeat) => self.send_packet(heartbeat),
                Err(e) => tracing::error!("[{}] heartbeat encode failed: {e}", self.id),
            }
            return;
        }

        self.reset_heartbeat_gauge();
        tracing::warn!("[{}] heartbeat timeout", self.id);
        if let Some(this) = self.arc() {
            self.policy.on_heartbeat_timeout(&this);
        }
        if self.config.heartbeat_disconnect {
            self.on_disconnected(Outcome::fail(
                ResultCode::SocketHeartbeatTimeout,
                "heartbeat timeout",
            ));
        }
    }

    /// Refill the heartbeat gauge.
    pub fn reset_heartbeat_gauge(&self) {
        self.heartbeat_gauge
            .store(self.config.heartbeat_gauge_max, Ordering::Release);
    }

    // -- notifications ------------------------------------------------------

    fn notify_local<T: Serialize>(&self, id: MessageId, message: &T) {
        let mut packet = match Packet::from_message(id, message) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::error!("[{}] failed to encode {id}: {e}", self.id);
                return;
            }
        };
        if let Some(this) = self.arc() {
            packet.set_connection(&this);
        }
        if !self.dispatcher.notify(packet) {
            tracing::debug!("[{}] nobody listens for {id}", self.id);
        }
    }

    fn notify_invalid_packet(&self, outcome: Outcome) {
        self.notify_local(NOTIFY_INVALID_PACKET, &NotifyInvalidPacket { outcome });
    }

    fn notify_send_fail(&self, packet: Packet, outcome: Outcome) {
        let message_id = packet.message_id();
        let manage_id = self.send_queue.record_failed(packet);
        tracing::warn!("[{}] send failed {message_id} ({manage_id}): {outcome}", self.id);
        self.notify_local(
            NOTIFY_SEND_FAILED,
            &NotifySendFailed {
                manage_id,
                message_id,
                outcome,
            },
        );
    }

    /// Take a packet named by a send-failed notification back out.
    pub fn pop_send_failed_packet(&self, manage_id: &str) -> Option<Packet> {
        self.send_queue.pop_failed(manage_id)
    }

    // -- relay helpers ------------------------------------------------------

    /// Send `packet`, continuing `source` when given.
    pub fn send(&self, mut packet: Packet, source: Option<&PacketHeader>) {
        packet.header.copy_session_info_from(source);
        self.send_packet(packet);
    }

    /// Encode `message` and send it, continuing `source` when given.
    pub fn send_message<T: Serialize>(
        &self,
        id: MessageId,
        message: &T,
        source: Option<&PacketHeader>,
    ) -> Result<(), NetError> {
        self.send(Packet::from_message(id, message)?, source);
        Ok(())
    }

    /// Reply to `request` on this connection.
    pub fn send_back(&self, packet: Packet, request: &Packet) {
        self.send(packet, Some(&request.header));
    }

    fn relay_to(&self, target: RelayTarget, mut packet: Packet, source: Option<&PacketHeader>) {
        packet.header.copy_session_info_from(source);
        packet.message_to_relay(target);
        self.send_packet(packet);
    }

    /// Relay to the session named by the header's relay-session id.
    pub fn relay(&self, packet: Packet, source: Option<&PacketHeader>) {
        self.relay_to(RelayTarget::ToSession, packet, source);
    }

    /// Encode `message` and relay it to a session.
    pub fn relay_message<T: Serialize>(
        &self,
        id: MessageId,
        message: &T,
        source: Option<&PacketHeader>,
    ) -> Result<(), NetError> {
        self.relay(Packet::from_message(id, message)?, source);
        Ok(())
    }

    /// Relay without session information.
    pub fn relay_anonymous(&self, packet: Packet) {
        self.relay_to(RelayTarget::Anonymous, packet, None);
    }

    /// Relay to a community server.
    pub fn relay_to_community(&self, packet: Packet, source: Option<&PacketHeader>) {
        self.relay_to(RelayTarget::ToCommunity, packet, source);
    }

    /// Relay to a game server.
    pub fn relay_to_game(&self, packet: Packet, source: Option<&PacketHeader>) {
        self.relay_to(RelayTarget::ToGame, packet, source);
    }

    /// Relay to a backend server.
    pub fn relay_to_server(&self, packet: Packet, source: Option<&PacketHeader>) {
        self.relay_to(RelayTarget::ToServer, packet, source);
    }

    /// Relay to every session on the current channel.
    pub fn relay_broadcast(&self, packet: Packet, source: Option<&PacketHeader>) {
        self.relay_to(RelayTarget::Broadcast, packet, source);
    }
}
