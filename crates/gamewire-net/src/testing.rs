//! In-memory transport for connection tests.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, mpsc};

use crate::error::NetError;
use crate::framing::FrameError;
use crate::packet::Packet;
use crate::sync::lock;
use crate::transport::{Transport, TransportFactory};

type Batch = Vec<Result<Packet, FrameError>>;

/// Transport fed by a [`MockPeer`]. An empty batch reads as a peer close.
pub(crate) struct MockTransport {
    inbound: Mutex<mpsc::UnboundedReceiver<Batch>>,
    ready: StdMutex<VecDeque<Result<Packet, FrameError>>>,
    sent: StdMutex<Vec<Packet>>,
    fail_sends: AtomicBool,
    hold_sends: AtomicBool,
    send_gate: Notify,
    closed: AtomicBool,
    close_notify: Notify,
    close_count: AtomicUsize,
}

/// Test-side handle of a [`MockTransport`].
#[derive(Clone)]
pub(crate) struct MockPeer {
    tx: mpsc::UnboundedSender<Batch>,
    pub(crate) transport: Arc<MockTransport>,
}

impl MockTransport {
    pub(crate) fn pair() -> MockPeer {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            inbound: Mutex::new(rx),
            ready: StdMutex::new(VecDeque::new()),
            sent: StdMutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            hold_sends: AtomicBool::new(false),
            send_gate: Notify::new(),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            close_count: AtomicUsize::new(0),
        });
        MockPeer { tx, transport }
    }
}

impl MockPeer {
    /// Deliver packets as one read.
    pub(crate) fn deliver(&self, packets: Vec<Packet>) {
        let _ = self.tx.send(packets.into_iter().map(Ok).collect());
    }

    /// Deliver a read containing one malformed frame.
    pub(crate) fn deliver_invalid(&self) {
        let _ = self
            .tx
            .send(vec![Err(FrameError::InvalidPacket("garbage".into()))]);
    }

    /// Deliver a read that fails deframing fatally.
    pub(crate) fn deliver_fatal(&self) {
        let _ = self
            .tx
            .send(vec![Err(FrameError::PayloadTooLarge { size: 9, max: 1 })]);
    }

    /// Close from the remote side.
    pub(crate) fn hang_up(&self) {
        let _ = self.tx.send(Vec::new());
    }

    /// Make every following write fail.
    pub(crate) fn fail_sends(&self) {
        self.transport.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Park every following write until [`release_sends`](Self::release_sends).
    pub(crate) fn hold_sends(&self) {
        self.transport.hold_sends.store(true, Ordering::SeqCst);
    }

    /// Let parked writes finish.
    pub(crate) fn release_sends(&self) {
        self.transport.hold_sends.store(false, Ordering::SeqCst);
        self.transport.send_gate.notify_waiters();
    }

    /// Everything written so far.
    pub(crate) fn sent(&self) -> Vec<Packet> {
        lock(&self.transport.sent).clone()
    }

    /// How many times the transport was closed locally.
    pub(crate) fn close_count(&self) -> usize {
        self.transport.close_count.load(Ordering::SeqCst)
    }

    pub(crate) fn as_transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport) as Arc<dyn Transport>
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn receive(&self) -> Result<usize, NetError> {
        let closed = self.close_notify.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetError::Closed);
        }

        let mut inbound = self.inbound.lock().await;
        let batch = tokio::select! {
            batch = inbound.recv() => batch,
            _ = &mut closed => return Err(NetError::Closed),
        };
        match batch {
            Some(batch) if !batch.is_empty() => {
                let n = batch.len();
                lock(&self.ready).extend(batch);
                Ok(n)
            }
            _ => Ok(0),
        }
    }

    fn take_packet(&self) -> Result<Option<Packet>, FrameError> {
        match lock(&self.ready).pop_front() {
            None => Ok(None),
            Some(Ok(packet)) => Ok(Some(packet)),
            Some(Err(e)) => Err(e),
        }
    }

    async fn send(&self, packet: &Packet) -> Result<(), NetError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetError::Closed);
        }
        if self.hold_sends.load(Ordering::SeqCst) {
            let released = self.send_gate.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.hold_sends.load(Ordering::SeqCst) {
                released.await;
            }
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(NetError::Io(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )));
        }
        lock(&self.sent).push(packet.clone());
        Ok(())
    }

    fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_notify.notify_waiters();
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Factory handing out a fresh [`MockTransport`] per open.
#[derive(Default)]
pub(crate) struct MockFactory {
    peers: StdMutex<Vec<MockPeer>>,
    fail_open: AtomicBool,
}

impl MockFactory {
    pub(crate) const UNRESOLVABLE: &'static str = "unresolvable.invalid";

    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Peer of the most recently opened transport.
    pub(crate) fn last_peer(&self) -> Option<MockPeer> {
        lock(&self.peers).last().cloned()
    }

    pub(crate) fn open_count(&self) -> usize {
        lock(&self.peers).len()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, NetError> {
        if host == Self::UNRESOLVABLE {
            return Err(NetError::Resolve {
                host: host.to_string(),
                reason: "no such host".to_string(),
            });
        }
        Ok(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    async fn open(&self, _addr: SocketAddr) -> Result<Arc<dyn Transport>, NetError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(NetError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )));
        }
        let peer = MockTransport::pair();
        let transport = peer.as_transport();
        lock(&self.peers).push(peer);
        Ok(transport)
    }
}

/// Let spawned connection tasks run.
pub(crate) async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
}
