use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;

/// OS error number tagged with the platform family, for support diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsErrorCode(Option<i32>);

impl OsErrorCode {
    pub fn of(err: &io::Error) -> Self {
        Self(err.raw_os_error())
    }

    pub fn raw(&self) -> Option<i32> {
        self.0
    }
}

impl fmt::Display for OsErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let family = if cfg!(windows) { "win" } else { "posix" };
        match self.0 {
            Some(code) => write!(f, "{}:{}", family, code),
            None => write!(f, "{}:-", family),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("bind {addr} failed: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: SocketAddr, source: io::Error },
    #[error("setting {option} failed: {source}")]
    Configure {
        option: &'static str,
        source: io::Error,
    },
    #[error("socket i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl SocketError {
    pub fn io_error(&self) -> &io::Error {
        match self {
            SocketError::Bind { source, .. }
            | SocketError::Connect { source, .. }
            | SocketError::Configure { source, .. } => source,
            SocketError::Io(source) => source,
        }
    }

    pub fn os_code(&self) -> OsErrorCode {
        OsErrorCode::of(self.io_error())
    }

    pub fn is_addr_in_use(&self) -> bool {
        self.io_error().kind() == io::ErrorKind::AddrInUse
    }
}

pub fn is_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

pub fn listen_tcp(addr: SocketAddr) -> Result<TcpListener, SocketError> {
    let listener = TcpListener::bind(addr).map_err(|source| SocketError::Bind { addr, source })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| SocketError::Configure {
            option: "non-blocking",
            source,
        })?;
    log::info!("Listening for players on {}", listener.local_addr()?);
    Ok(listener)
}

/// Connects with a bounded blocking wait, then switches the stream to non-blocking.
pub fn connect_tcp(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, SocketError> {
    let stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|source| SocketError::Connect { addr, source })?;
    configure_stream(&stream)?;
    log::info!("Connected to {}", addr);
    Ok(stream)
}

pub fn configure_stream(stream: &TcpStream) -> Result<(), SocketError> {
    stream
        .set_nonblocking(true)
        .map_err(|source| SocketError::Configure {
            option: "non-blocking",
            source,
        })?;
    stream
        .set_nodelay(true)
        .map_err(|source| SocketError::Configure {
            option: "nodelay",
            source,
        })?;
    Ok(())
}

/// Non-blocking UDP socket allowed to send to broadcast addresses.
pub fn bind_udp_broadcast(addr: SocketAddr) -> Result<UdpSocket, SocketError> {
    let socket = UdpSocket::bind(addr).map_err(|source| SocketError::Bind { addr, source })?;
    socket
        .set_broadcast(true)
        .map_err(|source| SocketError::Configure {
            option: "broadcast",
            source,
        })?;
    socket
        .set_nonblocking(true)
        .map_err(|source| SocketError::Configure {
            option: "non-blocking",
            source,
        })?;
    log::info!("Created UDP socket on {}", socket.local_addr()?);
    Ok(socket)
}

/// Owned socket slot. Closing twice is harmless.
#[derive(Debug)]
pub struct SocketHandle<S> {
    inner: Option<S>,
}

impl<S> Default for SocketHandle<S> {
    fn default() -> Self {
        Self::closed()
    }
}

impl<S> SocketHandle<S> {
    pub fn new(socket: S) -> Self {
        Self {
            inner: Some(socket),
        }
    }

    pub fn closed() -> Self {
        Self { inner: None }
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    pub fn get(&self) -> Option<&S> {
        self.inner.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut S> {
        self.inner.as_mut()
    }

    /// Returns false when there was nothing to close.
    pub fn close(&mut self) -> bool {
        self.inner.take().is_some()
    }
}
