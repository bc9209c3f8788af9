//! Backend roles, dialing, and the TCP/Unix stream abstraction.
//!
//! A detected protocol maps to one of three backend roles. Each role is
//! bound at startup to an immutable [`Endpoint`]; sessions dial the role
//! they decided on with a bounded connect timeout and never retry.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::debug;

use crate::config::{Endpoint, Family};

/// Default connect timeout for backend dials.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// The closed set of backend roles a sniffed connection can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// SSH daemon (also the destination for sniff timeouts).
    Ssh,
    /// HTTPS/TLS server.
    Https,
    /// Optional catch-all for unclassifiable traffic.
    Other,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Ssh => "ssh",
            BackendKind::Https => "https",
            BackendKind::Other => "other",
        })
    }
}

/// The set of backend endpoints, constructed once at startup and shared
/// read-only by every session.
#[derive(Debug, Clone)]
pub struct Backends {
    ssh: Endpoint,
    https: Endpoint,
    other: Option<Endpoint>,
    connect_timeout: Duration,
}

impl Backends {
    pub fn new(ssh: Endpoint, https: Endpoint, other: Option<Endpoint>) -> Self {
        Self {
            ssh,
            https,
            other,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the backend connect timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Whether a fallback ("other") backend is configured.
    pub fn has_fallback(&self) -> bool {
        self.other.is_some()
    }

    /// Endpoint for a role. `None` only for [`BackendKind::Other`] when
    /// no fallback is configured.
    pub fn endpoint(&self, kind: BackendKind) -> Option<&Endpoint> {
        match kind {
            BackendKind::Ssh => Some(&self.ssh),
            BackendKind::Https => Some(&self.https),
            BackendKind::Other => self.other.as_ref(),
        }
    }

    /// Dial the backend for a role.
    pub async fn dial(&self, kind: BackendKind) -> io::Result<Stream> {
        let endpoint = self
            .endpoint(kind)
            .ok_or_else(|| io::Error::other("no fallback backend configured"))?;

        debug!(backend = %kind, endpoint = %endpoint, "Connecting to backend");

        match endpoint.family {
            Family::Tcp => {
                match timeout(self.connect_timeout, TcpStream::connect(&endpoint.address)).await {
                    Ok(result) => result.map(Stream::Tcp),
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
                }
            }
            Family::Unix => {
                match timeout(self.connect_timeout, UnixStream::connect(&endpoint.address)).await {
                    Ok(result) => result.map(Stream::Unix),
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
                }
            }
        }
    }
}

/// A connected byte stream, TCP or Unix flavored.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A bound listening endpoint, TCP or Unix flavored.
pub enum MuxListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl MuxListener {
    /// Bind a listener on the given endpoint. A stale Unix socket file
    /// left by a previous run is removed before binding.
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint.family {
            Family::Tcp => TcpListener::bind(&endpoint.address)
                .await
                .map(MuxListener::Tcp),
            Family::Unix => {
                let _ = std::fs::remove_file(&endpoint.address);
                UnixListener::bind(&endpoint.address).map(MuxListener::Unix)
            }
        }
    }

    /// Accept one connection, returning the stream and a displayable
    /// peer description for logging.
    pub async fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            MuxListener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Stream::Tcp(stream), peer.to_string()))
            }
            MuxListener::Unix(l) => {
                let (stream, peer) = l.accept().await?;
                let peer = peer
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unix".to_string());
                Ok((Stream::Unix(stream), peer))
            }
        }
    }

    /// Local TCP address, for TCP listeners bound to an ephemeral port.
    pub fn local_tcp_addr(&self) -> io::Result<Option<SocketAddr>> {
        match self {
            MuxListener::Tcp(l) => l.local_addr().map(Some),
            MuxListener::Unix(_) => Ok(None),
        }
    }
}
