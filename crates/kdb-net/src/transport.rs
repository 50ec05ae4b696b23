use crate::TransportError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Opaque reference to one live connection of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    /// The single connection of a connecting-mode transport.
    pub const OUTBOUND: ConnectionHandle = ConnectionHandle(0);

    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Listening,
    Connecting,
}

/// Connection-oriented byte transport.
///
/// `recv` never blocks: it returns an empty buffer when nothing is ready, and
/// callers park on `readable` in between. `send` may write fewer bytes than
/// asked; see `frame::send_all`. After `close`, every operation fails with
/// `TransportError::Disconnected`.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    fn mode(&self) -> TransportMode;

    /// Binds the listening socket. Calling it again with port 0 or the bound
    /// port returns the existing address.
    async fn listen(&self, port: u16) -> Result<SocketAddr, TransportError>;

    async fn local_addr(&self) -> Option<SocketAddr>;

    /// Waits for a peer and registers its connection.
    async fn accept(&self) -> Result<ConnectionHandle, TransportError>;

    /// Waits until `recv` on `conn` may return data (or observe EOF).
    async fn readable(&self, conn: ConnectionHandle) -> Result<(), TransportError>;

    /// Non-blocking read of up to `max_len` bytes. EOF is `Disconnected`.
    fn recv(&self, conn: ConnectionHandle, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Writes some prefix of `buf` and returns its length.
    async fn send(&self, conn: ConnectionHandle, buf: &[u8]) -> Result<usize, TransportError>;

    fn peer_addr(&self, conn: ConnectionHandle) -> Option<SocketAddr>;

    /// Drops one connection; the others are untouched.
    fn disconnect(&self, conn: ConnectionHandle);

    /// Releases every socket.
    async fn close(&self);
}

/// TCP implementation of both transport modes.
pub struct TcpTransport {
    mode: TransportMode,
    bind_host: IpAddr,
    listener: Mutex<Option<Arc<TcpListener>>>,
    connections: DashMap<ConnectionHandle, Arc<TcpStream>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl TcpTransport {
    /// An unbound listening transport on all interfaces.
    pub fn listening() -> Self {
        Self::listening_on(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn listening_on(bind_host: IpAddr) -> Self {
        Self::with_mode(TransportMode::Listening, bind_host)
    }

    /// Opens the single outbound connection, reachable as `ConnectionHandle::OUTBOUND`.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(peer = ?stream.peer_addr().ok(), "connected");

        let transport = Self::with_mode(
            TransportMode::Connecting,
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        );
        transport
            .connections
            .insert(ConnectionHandle::OUTBOUND, Arc::new(stream));
        Ok(transport)
    }

    fn with_mode(mode: TransportMode, bind_host: IpAddr) -> Self {
        Self {
            mode,
            bind_host,
            listener: Mutex::new(None),
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    fn ensure_mode(&self, op: &'static str, mode: TransportMode) -> Result<(), TransportError> {
        if self.mode != mode {
            return Err(TransportError::Unsupported {
                op,
                mode: self.mode,
            });
        }
        Ok(())
    }

    fn stream(&self, conn: ConnectionHandle) -> Result<Arc<TcpStream>, TransportError> {
        self.ensure_open()?;
        self.connections
            .get(&conn)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::Disconnected)
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[async_trait]
impl TransportProvider for TcpTransport {
    fn mode(&self) -> TransportMode {
        self.mode
    }

    async fn listen(&self, port: u16) -> Result<SocketAddr, TransportError> {
        self.ensure_open()?;
        self.ensure_mode("listen", TransportMode::Listening)?;

        let mut slot = self.listener.lock().await;
        if let Some(listener) = slot.as_ref() {
            let addr = listener.local_addr()?;
            if port == 0 || port == addr.port() {
                return Ok(addr);
            }
            return Err(TransportError::AlreadyBound(addr));
        }

        let listener = TcpListener::bind((self.bind_host, port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "transport listening");
        *slot = Some(Arc::new(listener));
        Ok(addr)
    }

    async fn local_addr(&self) -> Option<SocketAddr> {
        match self.mode {
            TransportMode::Listening => {
                let slot = self.listener.lock().await;
                slot.as_ref().and_then(|l| l.local_addr().ok())
            }
            TransportMode::Connecting => self
                .connections
                .get(&ConnectionHandle::OUTBOUND)
                .and_then(|s| s.local_addr().ok()),
        }
    }

    async fn accept(&self) -> Result<ConnectionHandle, TransportError> {
        self.ensure_open()?;
        self.ensure_mode("accept", TransportMode::Listening)?;

        let listener = {
            let slot = self.listener.lock().await;
            slot.clone().ok_or(TransportError::NotBound)?
        };

        let (stream, peer) = listener.accept().await?;
        // Closed while we were parked in accept
        self.ensure_open()?;
        stream.set_nodelay(true)?;

        let handle = ConnectionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.insert(handle, Arc::new(stream));
        debug!(%handle, %peer, "connection accepted");
        Ok(handle)
    }

    async fn readable(&self, conn: ConnectionHandle) -> Result<(), TransportError> {
        let stream = self.stream(conn)?;
        stream
            .readable()
            .await
            .map_err(TransportError::from_socket)
    }

    fn recv(&self, conn: ConnectionHandle, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream(conn)?;
        if max_len == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; max_len];
        match stream.try_read(&mut buf) {
            Ok(0) => Err(TransportError::Disconnected),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(e) => Err(TransportError::from_socket(e)),
        }
    }

    async fn send(&self, conn: ConnectionHandle, buf: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream(conn)?;
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            stream
                .writable()
                .await
                .map_err(TransportError::from_socket)?;
            match stream.try_write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(TransportError::from_socket(e)),
            }
        }
    }

    fn peer_addr(&self, conn: ConnectionHandle) -> Option<SocketAddr> {
        self.connections
            .get(&conn)
            .and_then(|s| s.peer_addr().ok())
    }

    fn disconnect(&self, conn: ConnectionHandle) {
        if self.connections.remove(&conn).is_some() {
            debug!(handle = %conn, "connection dropped");
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.listener.lock().await.take();
        self.connections.clear();
        info!("transport closed");
    }
}
