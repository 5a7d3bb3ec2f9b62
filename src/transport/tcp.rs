//! TCP dialer for the client-to-server tunnel

use super::{tune_socket, Dialer, TransportConfig, TransportError};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Dials the tunnel server over TCP
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
    config: TransportConfig,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
        }
    }

    /// Create with default configuration
    pub fn new_default(addr: impl Into<String>) -> Self {
        Self::new(addr, TransportConfig::default())
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self) -> Result<TcpStream, TransportError> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout(self.addr.clone()))?
            .map_err(|e| TransportError::ConnectionFailed(self.addr.clone(), e))?;

        if let Err(e) = tune_socket(&stream, &self.config) {
            debug!("Failed to tune socket to {}: {}", self.addr, e);
        }

        trace!("dialed tunnel server {}", self.addr);
        Ok(stream)
    }
}
