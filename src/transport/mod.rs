//! Transport layer - raw byte-stream sockets under the tunnel
//!
//! The pool never opens sockets itself; it asks a [`Dialer`] for a fresh
//! duplex stream, which keeps the pool independent of TCP in tests.

mod tcp;

pub use tcp::TcpDialer;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection to {0} failed: {1}")]
    ConnectionFailed(String, io::Error),

    #[error("Connecting to {0} timed out")]
    Timeout(String),
}

/// Opens raw duplex streams to the remote tunnel endpoint
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Stream type produced by this dialer
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new stream
    async fn dial(&self) -> Result<Self::Stream, TransportError>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm on tunnel sockets
    pub nodelay: bool,
    /// Idle time before TCP keepalive probes start, `None` leaves SO_KEEPALIVE off
    pub keepalive: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
            keepalive: Some(Duration::from_secs(60)),
        }
    }
}

/// Apply TCP_NODELAY and SO_KEEPALIVE to a tunnel socket
pub fn tune_socket(stream: &TcpStream, config: &TransportConfig) -> io::Result<()> {
    let socket = SockRef::from(stream);
    socket.set_nodelay(config.nodelay)?;
    match config.keepalive {
        Some(idle) => socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle)),
        None => socket.set_keepalive(false),
    }
}
