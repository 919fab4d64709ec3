//! Bearer transports: framed message channels over TCP or in-memory pipes.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mesh_core::wire::{decode_frame, encode_frame, FrameDecodeError};
use mesh_core::{MeshError, Message, PeerId};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

const MEMORY_PIPE_CAPACITY: usize = 64 * 1024;

/// Read half of a channel. `recv` is cancel safe: partial frames stay buffered, so it can
/// sit in a `select!` next to a send or a cancellation signal.
pub struct FrameReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    buf: Vec<u8>,
}

impl FrameReader {
    pub async fn recv(&mut self) -> Result<Message, MeshError> {
        loop {
            match decode_frame(&self.buf) {
                Ok((msg, used)) => {
                    self.buf.drain(..used);
                    return Ok(msg);
                }
                Err(FrameDecodeError::NeedMore) => {}
                Err(e) => return Err(MeshError::Protocol(format!("bad frame: {e}"))),
            }
            let n = self
                .inner
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| MeshError::Connection(format!("read: {e}")))?;
            if n == 0 {
                return Err(MeshError::Connection("channel closed by peer".into()));
            }
        }
    }
}

pub struct FrameWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
}

impl FrameWriter {
    pub async fn send(&mut self, msg: &Message) -> Result<(), MeshError> {
        let frame = encode_frame(msg)
            .map_err(|e| MeshError::Protocol(format!("encode {}: {e}", msg.kind())))?;
        self.inner
            .write_all(&frame)
            .await
            .map_err(|e| MeshError::Connection(format!("write: {e}")))?;
        self.inner
            .flush()
            .await
            .map_err(|e| MeshError::Connection(format!("flush: {e}")))
    }

    pub async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// Reliable, ordered, framed message channel to one peer.
pub struct FrameChannel {
    reader: FrameReader,
    writer: FrameWriter,
    remote: String,
}

impl FrameChannel {
    pub fn new<R, W>(reader: R, writer: W, remote: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: FrameReader {
                inner: Box::new(reader),
                buf: Vec::new(),
            },
            writer: FrameWriter {
                inner: Box::new(writer),
            },
            remote: remote.into(),
        }
    }

    pub fn from_stream<S>(stream: S, remote: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self::new(r, w, remote)
    }

    /// Remote end, for logs.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), MeshError> {
        self.writer.send(msg).await
    }

    pub async fn recv(&mut self) -> Result<Message, MeshError> {
        self.reader.recv().await
    }

    /// Both halves, for selecting a receive against a send.
    pub fn halves(&mut self) -> (&mut FrameReader, &mut FrameWriter) {
        (&mut self.reader, &mut self.writer)
    }

    pub async fn close(&mut self) {
        self.writer.close().await;
    }
}

/// Opens channels to peers by id.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, peer: &PeerId) -> impl Future<Output = io::Result<FrameChannel>> + Send;
}

/// Yields channels opened by remote peers.
pub trait Listener: Send + 'static {
    fn accept(&mut self) -> impl Future<Output = io::Result<FrameChannel>> + Send;
}

/// Transport addresses learned from discovery beacons.
#[derive(Clone, Default)]
pub struct AddressBook {
    inner: Arc<RwLock<HashMap<PeerId, SocketAddr>>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: PeerId, addr: SocketAddr) {
        self.inner.write().insert(peer, addr);
    }

    pub fn get(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.inner.read().get(peer).copied()
    }

    pub fn remove(&self, peer: &PeerId) {
        self.inner.write().remove(peer);
    }
}

pub struct TcpConnector {
    addresses: AddressBook,
}

impl TcpConnector {
    pub fn new(addresses: AddressBook) -> Self {
        Self { addresses }
    }
}

impl Connector for TcpConnector {
    async fn connect(&self, peer: &PeerId) -> io::Result<FrameChannel> {
        let addr = self.addresses.get(peer).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {peer}"))
        })?;
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(peer_id = %peer, %addr, "connected");
        Ok(FrameChannel::from_stream(stream, addr.to_string()))
    }
}

pub struct TcpBearer {
    listener: tokio::net::TcpListener,
}

impl TcpBearer {
    pub async fn bind(port: u16) -> io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Listener for TcpBearer {
    async fn accept(&mut self) -> io::Result<FrameChannel> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(FrameChannel::from_stream(stream, addr.to_string()))
    }
}

/// In-process network of duplex pipes, keyed by peer id.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<FrameChannel>>>>,
    unresponsive: Arc<Mutex<HashSet<PeerId>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer` as reachable; replaces any earlier listener for it.
    pub fn listen(&self, peer: impl Into<PeerId>) -> MemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(peer.into(), tx);
        MemoryListener { rx }
    }

    /// Make connects to `peer` hang until the caller gives up.
    pub fn set_unresponsive(&self, peer: impl Into<PeerId>) {
        self.unresponsive.lock().insert(peer.into());
    }

    /// Connector that dials as `local`.
    pub fn connector(&self, local: impl Into<PeerId>) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            local: local.into(),
        }
    }
}

pub struct MemoryConnector {
    network: MemoryNetwork,
    local: PeerId,
}

impl Connector for MemoryConnector {
    async fn connect(&self, peer: &PeerId) -> io::Result<FrameChannel> {
        if self.network.unresponsive.lock().contains(peer) {
            std::future::pending::<()>().await;
        }
        let tx = self.network.listeners.lock().get(peer).cloned();
        let tx = tx.ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, format!("{peer} is not listening"))
        })?;
        let (near, far) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
        tx.send(FrameChannel::from_stream(far, self.local.to_string()))
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("{peer} stopped listening"),
                )
            })?;
        Ok(FrameChannel::from_stream(near, peer.to_string()))
    }
}

pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<FrameChannel>,
}

impl Listener for MemoryListener {
    async fn accept(&mut self) -> io::Result<FrameChannel> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "network dropped"))
    }
}
