// Transport layer
// Datagram and framed-stream delivery between nodes

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

use rill_common::{Result, RillError};

/// Largest frame accepted on a stream
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Largest datagram read from the socket
const MAX_DATAGRAM_LEN: usize = 65536;

const INBOUND_QUEUE_SIZE: usize = 4096;

/// How a frame travelled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Path {
    /// Unordered, unreliable, size-limited
    Datagram,
    /// Reliable ordered stream, any size
    Stream,
}

/// A received frame and where it came from
#[derive(Clone, Debug)]
pub struct Inbound {
    pub source: SocketAddr,
    pub path: Path,
    pub bytes: Bytes,
}

/// Delivery of encoded frames to other nodes
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    /// Best effort; loss is not reported
    async fn send_datagram(&self, target: SocketAddr, frame: Bytes) -> Result<()>;

    /// Reliable delivery of one whole frame
    async fn send_stream(&self, target: SocketAddr, frame: Bytes) -> Result<()>;

    async fn close(&self);
}

/// UDP datagrams plus length-prefixed TCP frames on the same port
pub struct NetTransport {
    local: SocketAddr,
    udp: Arc<UdpSocket>,
    streams: DashMap<SocketAddr, Arc<Mutex<TcpStream>>>,
    shutdown: watch::Sender<bool>,
}

impl NetTransport {
    /// Bind both sockets and start the receive loops
    pub async fn bind(addr: SocketAddr) -> Result<(Arc<Self>, mpsc::Receiver<Inbound>)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let udp = Arc::new(UdpSocket::bind(local).await?);
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let (shutdown, _) = watch::channel(false);

        let transport = Arc::new(Self {
            local,
            udp: udp.clone(),
            streams: DashMap::new(),
            shutdown,
        });

        Self::spawn_datagram_loop(udp, tx.clone(), transport.shutdown.subscribe());
        Self::spawn_accept_loop(listener, tx, transport.shutdown.subscribe());

        info!(address = %local, "Transport bound");
        Ok((transport, rx))
    }

    fn spawn_datagram_loop(
        udp: Arc<UdpSocket>,
        tx: mpsc::Sender<Inbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
            loop {
                tokio::select! {
                    received = udp.recv_from(&mut buf) => match received {
                        Ok((len, source)) => {
                            let inbound = Inbound {
                                source,
                                path: Path::Datagram,
                                bytes: Bytes::copy_from_slice(&buf[..len]),
                            };
                            // A full queue drops the datagram like a full socket buffer would
                            if tx.try_send(inbound).is_err() && tx.is_closed() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Datagram receive failed");
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Datagram loop stopped");
        });
    }

    fn spawn_accept_loop(
        listener: TcpListener,
        tx: mpsc::Sender<Inbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            Self::spawn_stream_reader(stream, peer, tx.clone(), shutdown.clone());
                        }
                        Err(e) => {
                            error!(error = %e, "Stream accept failed");
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Accept loop stopped");
        });
    }

    fn spawn_stream_reader(
        mut stream: TcpStream,
        peer: SocketAddr,
        tx: mpsc::Sender<Inbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = read_frame(&mut stream) => match frame {
                        Ok(bytes) => {
                            let inbound = Inbound {
                                source: peer,
                                path: Path::Stream,
                                bytes,
                            };
                            if tx.send(inbound).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "Stream closed");
                            break;
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    async fn connection(&self, target: SocketAddr) -> Result<Arc<Mutex<TcpStream>>> {
        if let Some(existing) = self.streams.get(&target) {
            return Ok(existing.clone());
        }
        let stream = TcpStream::connect(target).await?;
        let _ = stream.set_nodelay(true);
        let stream = Arc::new(Mutex::new(stream));
        // Another sender may have connected meanwhile; keep whichever landed first
        Ok(self.streams.entry(target).or_insert(stream).clone())
    }
}

async fn read_frame(stream: &mut TcpStream) -> Result<Bytes> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(RillError::NetworkError(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> Result<()> {
    stream.write_u32(frame.len() as u32).await?;
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

#[async_trait]
impl Transport for NetTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn send_datagram(&self, target: SocketAddr, frame: Bytes) -> Result<()> {
        self.udp.send_to(&frame, target).await?;
        Ok(())
    }

    async fn send_stream(&self, target: SocketAddr, frame: Bytes) -> Result<()> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(RillError::IllegalArgument(format!(
                "frame of {} bytes exceeds limit",
                frame.len()
            )));
        }
        // One reconnect on a stale cached connection
        for attempt in 0..2 {
            let conn = self.connection(target).await?;
            let mut stream = conn.lock().await;
            match write_frame(&mut stream, &frame).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    drop(stream);
                    self.streams.remove(&target);
                    if attempt == 1 {
                        return Err(e);
                    }
                    debug!(target_addr = %target, error = %e, "Reconnecting stream");
                }
            }
        }
        Err(RillError::NetworkError(format!("stream to {} failed", target)))
    }

    async fn close(&self) {
        let _ = self.shutdown.send(true);
        self.streams.clear();
        info!(address = %self.local, "Transport closed");
    }
}

#[derive(Default)]
struct MemoryInner {
    endpoints: DashMap<SocketAddr, mpsc::Sender<Inbound>>,
    isolated: DashSet<SocketAddr>,
    duplicate: AtomicBool,
    drop_every: AtomicU64,
    datagrams: AtomicU64,
}

/// In-process network for tests, with fault injection
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<MemoryInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint at `addr`, replacing any previous one
    pub fn endpoint(&self, addr: SocketAddr) -> (Arc<MemoryTransport>, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        self.inner.endpoints.insert(addr, tx);
        self.inner.isolated.remove(&addr);
        (
            Arc::new(MemoryTransport {
                addr,
                network: self.clone(),
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Deliver every datagram twice
    pub fn set_duplicate_datagrams(&self, on: bool) {
        self.inner.duplicate.store(on, Ordering::SeqCst);
    }

    /// Drop every `n`th datagram (0 disables)
    pub fn set_drop_every(&self, n: u64) {
        self.inner.drop_every.store(n, Ordering::SeqCst);
    }

    /// Cut `addr` off in both directions
    pub fn isolate(&self, addr: SocketAddr) {
        self.inner.isolated.insert(addr);
    }

    pub fn heal(&self, addr: SocketAddr) {
        self.inner.isolated.remove(&addr);
    }

    pub fn remove(&self, addr: SocketAddr) {
        self.inner.endpoints.remove(&addr);
    }

    fn cut(&self, from: SocketAddr, to: SocketAddr) -> bool {
        self.inner.isolated.contains(&from) || self.inner.isolated.contains(&to)
    }

    fn route(&self, target: SocketAddr) -> Option<mpsc::Sender<Inbound>> {
        self.inner.endpoints.get(&target).map(|tx| tx.clone())
    }
}

/// One node's view of a [`MemoryNetwork`]
pub struct MemoryTransport {
    addr: SocketAddr,
    network: MemoryNetwork,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send_datagram(&self, target: SocketAddr, frame: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || self.network.cut(self.addr, target) {
            return Ok(());
        }
        let inner = &self.network.inner;
        let n = inner.drop_every.load(Ordering::SeqCst);
        let seq = inner.datagrams.fetch_add(1, Ordering::SeqCst) + 1;
        if n > 0 && seq % n == 0 {
            return Ok(());
        }
        let Some(tx) = self.network.route(target) else {
            return Ok(());
        };
        let inbound = Inbound {
            source: self.addr,
            path: Path::Datagram,
            bytes: frame,
        };
        if inner.duplicate.load(Ordering::SeqCst) {
            let _ = tx.try_send(inbound.clone());
        }
        let _ = tx.try_send(inbound);
        Ok(())
    }

    async fn send_stream(&self, target: SocketAddr, frame: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RillError::NetworkError("transport closed".to_string()));
        }
        if self.network.cut(self.addr, target) {
            return Err(RillError::NetworkError(format!("{} unreachable", target)));
        }
        let tx = self
            .network
            .route(target)
            .ok_or_else(|| RillError::NetworkError(format!("{} unreachable", target)))?;
        tx.send(Inbound {
            source: self.addr,
            path: Path::Stream,
            bytes: frame,
        })
        .await
        .map_err(|_| RillError::NetworkError(format!("{} closed", target)))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.network.remove(self.addr);
    }
}
