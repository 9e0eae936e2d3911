//! Local stream sockets and connection establishment.
//!
//! [`StreamSocket`] unifies the two local transports the engine uses, Unix
//! domain sockets and loopback TCP, behind one concrete type so the
//! connection layer never branches on the transport. [`connect_with_retry`]
//! establishes a socket with bounded retries and an optional timeout budget.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ConnectionError, ConnectionResult};

/// Default delay between connect attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// A connected local stream socket.
///
/// Either transport provides an ordered, reliable byte stream with
/// non-blocking I/O; the connection layer treats them identically except for
/// remote addressing (TCP peers are addressable, Unix peers usually are not).
#[derive(Debug)]
pub enum StreamSocket {
    /// Unix domain socket.
    Unix(UnixStream),
    /// TCP socket (loopback in practice).
    Tcp(TcpStream),
}

impl StreamSocket {
    /// Best-effort human-readable remote address.
    ///
    /// Returns an empty string when the transport has no addressable remote,
    /// the common case for Unix sockets whose peer is an unnamed client
    /// socket. Used for diagnostics and for the cookie-mismatch escalation
    /// decision.
    #[must_use]
    pub fn remote_endpoint_info(&self) -> String {
        match self {
            Self::Unix(stream) => stream
                .peer_addr()
                .ok()
                .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_default(),
            Self::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_default(),
        }
    }

    /// Raw file descriptor, used for the disconnect peek and eager shutdown.
    #[cfg(unix)]
    #[must_use]
    pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        match self {
            Self::Unix(stream) => stream.as_raw_fd(),
            Self::Tcp(stream) => stream.as_raw_fd(),
        }
    }
}

impl AsyncRead for StreamSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for StreamSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// A parsed connect target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Filesystem path of a Unix domain socket.
    Unix(PathBuf),
    /// TCP socket address.
    Tcp(std::net::SocketAddr),
}

impl Endpoint {
    /// Parse an endpoint string.
    ///
    /// Accepted forms: `ip:port` (or `tcp://ip:port`) for TCP, anything else
    /// is a Unix socket path (optionally prefixed with `unix://`). An empty
    /// string is invalid.
    pub fn parse(endpoint: &str) -> ConnectionResult<Self> {
        let invalid = || ConnectionError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
        };

        if let Some(rest) = endpoint.strip_prefix("tcp://") {
            return rest.parse().map(Self::Tcp).map_err(|_| invalid());
        }
        if let Some(rest) = endpoint.strip_prefix("unix://") {
            if rest.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::Unix(PathBuf::from(rest)));
        }
        if let Ok(addr) = endpoint.parse() {
            return Ok(Self::Tcp(addr));
        }
        if endpoint.is_empty() {
            return Err(invalid());
        }
        Ok(Self::Unix(PathBuf::from(endpoint)))
    }

    /// Attempt one connection to this endpoint.
    async fn connect(&self) -> io::Result<StreamSocket> {
        match self {
            Self::Unix(path) => UnixStream::connect(path).await.map(StreamSocket::Unix),
            Self::Tcp(addr) => TcpStream::connect(addr).await.map(StreamSocket::Tcp),
        }
    }
}

/// Retry policy for [`connect_with_retry`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Maximum number of retries after the first attempt; `None` retries
    /// without bound.
    pub num_retries: Option<u32>,
    /// Total time budget; `None` imposes no deadline.
    pub timeout: Option<Duration>,
    /// Delay between attempts.
    pub retry_interval: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            num_retries: None,
            timeout: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl ConnectOptions {
    /// Limit the number of retries after the first attempt.
    #[must_use]
    pub const fn with_num_retries(mut self, num_retries: u32) -> Self {
        self.num_retries = Some(num_retries);
        self
    }

    /// Set the total time budget for connection establishment.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the delay between attempts.
    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// Connect to `endpoint`, retrying transient failures.
///
/// Makes up to `num_retries + 1` attempts (unbounded when unset), sleeping
/// [`ConnectOptions::retry_interval`] between attempts. If a timeout budget
/// is configured, gives up once it has elapsed even when retries remain.
///
/// # Errors
///
/// - [`ConnectionError::InvalidEndpoint`] if the endpoint cannot be parsed.
/// - [`ConnectionError::ConnectFailed`] when retries are exhausted; carries
///   the last transport error.
/// - [`ConnectionError::Timeout`] when the budget elapses first.
pub async fn connect_with_retry(
    endpoint: &str,
    options: ConnectOptions,
) -> ConnectionResult<StreamSocket> {
    let target = Endpoint::parse(endpoint)?;
    let start = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        // Each attempt is bounded by the remaining budget so a hanging
        // connect cannot overrun the timeout.
        let outcome = match options.timeout {
            Some(budget) => {
                let remaining = budget.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    return Err(ConnectionError::Timeout {
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    });
                }
                match tokio::time::timeout(remaining, target.connect()).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(ConnectionError::Timeout {
                            elapsed_ms: start.elapsed().as_millis() as u64,
                        });
                    }
                }
            }
            None => target.connect().await,
        };
        match outcome {
            Ok(socket) => {
                debug!(endpoint, attempts, "connected");
                return Ok(socket);
            }
            Err(err) => {
                warn!(endpoint, attempts, error = %err, "connect attempt failed");
                if let Some(num_retries) = options.num_retries {
                    if attempts > num_retries {
                        return Err(ConnectionError::ConnectFailed {
                            attempts,
                            source: err,
                        });
                    }
                }
                if let Some(timeout) = options.timeout {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        return Err(ConnectionError::Timeout {
                            elapsed_ms: elapsed.as_millis() as u64,
                        });
                    }
                }
            }
        }
        tokio::time::sleep(options.retry_interval).await;
    }
}

/// Non-blocking peek on a raw descriptor to detect peer closure.
///
/// Returns `true` only when the peer has closed its end (orderly EOF or a
/// hard reset). Consumes no bytes. On platforms without a non-blocking peek
/// this degrades to always reporting `false`.
#[cfg(unix)]
pub(crate) fn peek_disconnected(fd: std::os::unix::io::RawFd) -> bool {
    use nix::errno::Errno;
    use nix::sys::socket::{recv, MsgFlags};

    let mut probe = [0u8; 1];
    match recv(fd, &mut probe, MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT) {
        Ok(0) => true,
        Ok(_) => false,
        // EINTR is a transient interruption, not a verdict; the next scan
        // will probe again.
        Err(Errno::EAGAIN | Errno::EINTR) => false,
        Err(_) => true,
    }
}
