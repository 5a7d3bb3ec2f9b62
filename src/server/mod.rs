//! Server side: accept physical tunnel connections and serve logical
//! sessions on each of them in place
//!
//! There is no idle set here. One task per physical connection loops:
//! bring-up (or reset), read the target descriptor, connect to the target,
//! relay, and back to reset for the next session.

use crate::crypto::Key;
use crate::proxy::TargetAddr;
use crate::relay::{relay, Completion};
use crate::transport::{tune_socket, TransportConfig};
use crate::tunnel::{ServerConnection, TunnelError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

/// Default cap on concurrently served physical connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Tunnel server
pub struct TunnelServer {
    listener: TcpListener,
    key: Key,
    limit: Arc<Semaphore>,
    transport: TransportConfig,
}

impl TunnelServer {
    /// Bind the tunnel listener
    pub async fn bind(addr: &str, key: Key, max_connections: usize) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Tunnel server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            key,
            limit: Arc::new(Semaphore::new(max_connections.max(1))),
            transport: TransportConfig::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept tunnel connections forever
    pub async fn run(&self) -> Result<(), TunnelError> {
        loop {
            let permit = match self.limit.clone().acquire_owned().await {
                Ok(permit) => permit,
                // The semaphore is never closed
                Err(_) => return Ok(()),
            };

            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept tunnel connection: {}", e);
                    continue;
                }
            };
            if let Err(e) = tune_socket(&stream, &self.transport) {
                debug!("Failed to tune socket for {}: {}", peer, e);
            }
            debug!("New tunnel connection from {}", peer);

            let key = self.key;
            tokio::spawn(async move {
                match serve_connection(stream, key).await {
                    Ok(sessions) => debug!(%peer, sessions, "tunnel connection finished"),
                    Err(e) if e.is_protocol() => {
                        debug!(%peer, error = %e, "tunnel connection ended")
                    }
                    Err(e) => warn!(%peer, error = %e, "tunnel connection failed"),
                }
                drop(permit);
            });
        }
    }
}

/// Serve logical sessions on one physical connection until it ends
///
/// Returns the number of sessions that completed cleanly. A clean end is
/// the peer closing the connection between sessions.
pub async fn serve_connection<S>(stream: S, key: Key) -> Result<u64, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut conn = ServerConnection::establish(stream, key).await?;
    let mut sessions = 0u64;

    loop {
        let target = match read_target(&mut conn).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                conn.close().await;
                return Ok(sessions);
            }
            Err(e) => {
                conn.close().await;
                // Peer hung up while the connection sat idle in its pool
                if sessions > 0 && matches!(e, TunnelError::UnexpectedEof) {
                    return Ok(sessions);
                }
                return Err(e);
            }
        };

        let upstream = match connect_target(&target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                debug!(%target, error = %e, "failed to connect to target");
                conn.close().await;
                return Err(e.into());
            }
        };
        trace!(%target, "session started");

        conn = match relay(upstream, conn).await {
            Completion::Clean(conn) => conn,
            Completion::Dirty => {
                debug!(%target, "session ended dirty, dropping tunnel connection");
                return Ok(sessions);
            }
        };
        sessions += 1;

        match conn.reset().await {
            Ok(()) => {}
            // Client closed the connection instead of reusing it
            Err(TunnelError::UnexpectedEof) => return Ok(sessions),
            Err(e) => return Err(e),
        }
    }
}

/// Read and decode the target descriptor opening a logical session
///
/// `Ok(None)` when the peer sent "fin" without a descriptor.
async fn read_target<S>(conn: &mut ServerConnection<S>) -> Result<Option<TargetAddr>, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(payload) = conn.read().await? else {
        return Ok(None);
    };

    TargetAddr::decode(&payload)
        .map(Some)
        .map_err(|e| TunnelError::InvalidFrame(format!("bad target descriptor: {}", e)))
}

/// Open the outbound connection for a session
pub async fn connect_target(target: &TargetAddr) -> std::io::Result<TcpStream> {
    let stream = match target {
        TargetAddr::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await?,
        other => match other.socket_addr() {
            Some(addr) => TcpStream::connect(addr).await?,
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "target has no socket address",
                ))
            }
        },
    };

    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::send_target;
    use crate::tunnel::ClientConnection;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    const KEY: Key = [5u8; 32];

    async fn echo_target() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                    let _ = w.shutdown().await;
                });
            }
        });
        addr
    }

    fn target_of(addr: SocketAddr) -> TargetAddr {
        match addr {
            SocketAddr::V4(v4) => TargetAddr::Ipv4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => TargetAddr::Ipv6(*v6.ip(), v6.port()),
        }
    }

    async fn echo_session(conn: &mut ClientConnection<DuplexStream>, target: &TargetAddr, msg: &[u8]) {
        send_target(conn, target).await.unwrap();
        conn.write(msg).await.unwrap();
        conn.shutdown_output().await.unwrap();

        let mut echoed = Vec::new();
        while let Some(chunk) = conn.read().await.unwrap() {
            echoed.extend_from_slice(&chunk);
        }
        assert_eq!(echoed, msg);
    }

    #[tokio::test]
    async fn test_sessions_reuse_one_connection() {
        let target = target_of(echo_target().await);
        let (a, b) = duplex(256 * 1024);

        let server = tokio::spawn(serve_connection(b, KEY));
        let mut conn = ClientConnection::establish(a, KEY).await.unwrap();
        let first_iv = *conn.encrypt_iv();

        echo_session(&mut conn, &target, b"first session").await;
        conn.reset().await.unwrap();
        assert_ne!(conn.encrypt_iv(), &first_iv);

        echo_session(&mut conn, &target, b"second session").await;

        conn.close().await;
        let sessions = tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .expect("server loop should end")
            .unwrap()
            .unwrap();
        assert_eq!(sessions, 2);
    }

    #[tokio::test]
    async fn test_bad_descriptor_closes_connection() {
        let (a, b) = duplex(64 * 1024);

        let server = tokio::spawn(serve_connection(b, KEY));
        let mut conn = ClientConnection::establish(a, KEY).await.unwrap();

        conn.write(&[0x07, 1, 2]).await.unwrap();

        let result = server.await.unwrap();
        assert!(matches!(result, Err(TunnelError::InvalidFrame(_))));
        assert!(conn.read().await.is_err());
    }

    #[tokio::test]
    async fn test_immediate_fin_closes_connection() {
        let (a, b) = duplex(64 * 1024);

        let server = tokio::spawn(serve_connection(b, KEY));
        let mut conn = ClientConnection::establish(a, KEY).await.unwrap();

        conn.shutdown_output().await.unwrap();

        assert_eq!(server.await.unwrap().unwrap(), 0);
        assert!(conn.read().await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_target_closes_connection() {
        // Grab a free port and release it so nothing listens there
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = target_of(listener.local_addr().unwrap());
        drop(listener);

        let (a, b) = duplex(64 * 1024);
        let server = tokio::spawn(serve_connection(b, KEY));
        let mut conn = ClientConnection::establish(a, KEY).await.unwrap();

        send_target(&mut conn, &target).await.unwrap();

        assert!(matches!(server.await.unwrap(), Err(TunnelError::Io(_))));
        assert!(conn.read().await.is_err());
    }

    #[tokio::test]
    async fn test_tunnel_server_accepts() {
        let target = target_of(echo_target().await);
        let server = TunnelServer::bind("127.0.0.1:0", KEY, 4).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move { server.run().await });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = ClientConnection::establish(stream, KEY).await.unwrap();
        send_target(&mut conn, &target).await.unwrap();
        conn.write(b"ping").await.unwrap();

        let reply = conn.read().await.unwrap().unwrap();
        assert_eq!(&reply[..], b"ping");
    }
}
