//! Transport and codec seams, with the TCP implementation.
//!
//! A [`Connection`](crate::Connection) never touches a socket directly. It
//! resolves and opens through a [`TransportFactory`], reads and writes whole
//! packets through a [`Transport`], and encrypts outbound payloads through a
//! [`PacketCodec`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify};

use crate::error::NetError;
use crate::framing::{FrameBuffer, FrameConfig, FrameError, encode_packet};
use crate::packet::Packet;
use crate::platform::{SocketConfig, configure_stream};
use crate::sync::lock;

const READ_CHUNK: usize = 8192;

/// A byte stream that carries framed packets.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Read more bytes into the transport's frame buffer.
    ///
    /// Returns the number of bytes read; `0` means the peer closed the
    /// stream. Returns [`NetError::Closed`] once [`close`](Self::close) ran.
    async fn receive(&self) -> Result<usize, NetError>;

    /// Deframe the next buffered packet. `Ok(None)` means more bytes are
    /// needed.
    fn take_packet(&self) -> Result<Option<Packet>, FrameError>;

    /// Write one packet.
    async fn send(&self, packet: &Packet) -> Result<(), NetError>;

    /// Close the transport. Pending and future reads fail with
    /// [`NetError::Closed`].
    fn close(&self);

    /// Remote address, if known.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Resolves endpoints and opens transports for outbound connections.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Resolve `host:port` to a single address.
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, NetError> {
        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| NetError::Resolve {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        addrs.next().ok_or_else(|| NetError::Resolve {
            host: host.to_string(),
            reason: "no addresses".to_string(),
        })
    }

    /// Open a transport to `addr`.
    async fn open(&self, addr: SocketAddr) -> Result<Arc<dyn Transport>, NetError>;
}

/// Outbound payload transformation applied right before a packet is written.
pub trait PacketCodec: Send + Sync {
    /// Encrypt `packet` in place.
    fn encrypt(&self, packet: &mut Packet) -> Result<(), NetError>;
}

/// Codec that leaves payloads untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCodec;

impl PacketCodec for PlainCodec {
    fn encrypt(&self, _packet: &mut Packet) -> Result<(), NetError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

struct ReadSide {
    half: OwnedReadHalf,
    scratch: BytesMut,
}

/// [`Transport`] over a tokio [`TcpStream`].
pub struct TcpTransport {
    reader: Mutex<ReadSide>,
    writer: Mutex<OwnedWriteHalf>,
    frames: StdMutex<FrameBuffer>,
    frame_config: FrameConfig,
    closed: AtomicBool,
    close_notify: Notify,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream, frame_config: FrameConfig) -> Self {
        let peer = stream.peer_addr().ok();
        let (half, writer) = stream.into_split();
        Self {
            reader: Mutex::new(ReadSide {
                half,
                scratch: BytesMut::with_capacity(READ_CHUNK),
            }),
            writer: Mutex::new(writer),
            frames: StdMutex::new(FrameBuffer::new(frame_config.clone())),
            frame_config,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            peer,
        }
    }

    /// Whether [`close`](Transport::close) ran.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn receive(&self) -> Result<usize, NetError> {
        let closed = self.close_notify.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        if self.is_closed() {
            return Err(NetError::Closed);
        }

        let mut reader = self.reader.lock().await;
        let ReadSide { half, scratch } = &mut *reader;
        scratch.clear();
        scratch.reserve(READ_CHUNK);

        let n = tokio::select! {
            result = half.read_buf(scratch) => result?,
            _ = &mut closed => return Err(NetError::Closed),
        };
        if n > 0 {
            lock(&self.frames).extend(&scratch[..n]);
        }
        Ok(n)
    }

    fn take_packet(&self) -> Result<Option<Packet>, FrameError> {
        lock(&self.frames).take_packet()
    }

    async fn send(&self, packet: &Packet) -> Result<(), NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        let frame = encode_packet(packet, &self.frame_config)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Opens [`TcpTransport`]s with the configured socket options.
#[derive(Debug, Clone, Default)]
pub struct TcpTransportFactory {
    /// Options applied to every opened stream.
    pub socket: SocketConfig,
    /// Framing limits for every opened stream.
    pub frame: FrameConfig,
}

impl TcpTransportFactory {
    /// Create a factory.
    pub fn new(socket: SocketConfig, frame: FrameConfig) -> Self {
        Self { socket, frame }
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    async fn open(&self, addr: SocketAddr) -> Result<Arc<dyn Transport>, NetError> {
        let stream = TcpStream::connect(addr).await?;
        configure_stream(&stream, &self.socket)?;
        Ok(Arc::new(TcpTransport::new(stream, self.frame.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MessageId;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    async fn pair() -> (Arc<dyn Transport>, TcpTransport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let factory = TcpTransportFactory::default();
        let (client, accepted) = tokio::join!(factory.open(addr), listener.accept());
        let (stream, _) = accepted.unwrap();
        (
            client.unwrap(),
            TcpTransport::new(stream, FrameConfig::default()),
        )
    }

    async fn next_packet(transport: &dyn Transport) -> Packet {
        loop {
            if let Some(packet) = transport.take_packet().unwrap() {
                return packet;
            }
            let n = transport.receive().await.unwrap();
            assert!(n > 0, "Peer closed early");
        }
    }

    #[tokio::test]
    async fn test_packets_cross_a_tcp_pair() {
        let (client, server) = pair().await;
        let sent = Packet::new(MessageId(42), Bytes::from_static(b"over tcp"));
        client.send(&sent).await.unwrap();

        let received = next_packet(&server).await;
        assert_eq!(received.header, sent.header);
        assert_eq!(&received.payload[..], b"over tcp");
    }

    #[tokio::test]
    async fn test_close_interrupts_pending_receive() {
        let (client, _server) = pair().await;
        let reader = Arc::clone(&client);
        let pending = tokio::spawn(async move { reader.receive().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        client.close();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(NetError::Closed)));
        assert!(matches!(client.receive().await, Err(NetError::Closed)));
    }

    #[tokio::test]
    async fn test_peer_drop_reads_zero() {
        let (client, server) = pair().await;
        drop(server);
        assert_eq!(client.receive().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let factory = TcpTransportFactory::default();
        let addr = factory.resolve("127.0.0.1", 7777).await.unwrap();
        assert_eq!(addr.port(), 7777);
    }

    #[test]
    fn test_plain_codec_is_identity() {
        let mut packet = Packet::new(MessageId(1), Bytes::from_static(b"same"));
        PlainCodec.encrypt(&mut packet).unwrap();
        assert_eq!(&packet.payload[..], b"same");
    }
}
