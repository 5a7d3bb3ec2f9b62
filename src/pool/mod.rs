//! Client-side connection pool
//!
//! Keeps physical tunnel connections that finished a logical session cleanly
//! and hands them out again after an in-place reset. Idle-set mutation and
//! the reuse counter sit behind one async mutex that is only held while the
//! set is touched, never across a reset or a dial.

use crate::crypto::Key;
use crate::transport::{Dialer, TransportError};
use crate::tunnel::{ClientConnection, TunnelError};
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Default number of idle connections kept
pub const DEFAULT_CAPACITY: usize = 16;

/// Pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Dial failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Bring-up failed: {0}")]
    Tunnel(#[from] TunnelError),
}

struct IdleSet<S> {
    conns: VecDeque<ClientConnection<S>>,
    /// Successful reuses of an idle connection since the pool was created
    reuse_count: u64,
}

/// Idle set of client tunnel connections
pub struct ConnectionPool<D: Dialer> {
    dialer: D,
    key: Key,
    capacity: usize,
    idle: Mutex<IdleSet<D::Stream>>,
}

impl<D: Dialer> ConnectionPool<D> {
    pub fn new(dialer: D, key: Key, capacity: usize) -> Self {
        Self {
            dialer,
            key,
            capacity,
            idle: Mutex::new(IdleSet {
                conns: VecDeque::with_capacity(capacity),
                reuse_count: 0,
            }),
        }
    }

    /// Get a connection ready for a new logical session
    ///
    /// Idle connections are reset before being returned. One whose reset
    /// fails is discarded and the next is tried; when none are left a new
    /// connection is dialed and brought up.
    pub async fn get_conn(&self) -> Result<ClientConnection<D::Stream>, PoolError> {
        loop {
            let candidate = self.idle.lock().await.conns.pop_back();
            let Some(mut conn) = candidate else {
                break;
            };

            match conn.reset().await {
                Ok(()) => {
                    let mut idle = self.idle.lock().await;
                    idle.reuse_count += 1;
                    trace!(reuse_count = idle.reuse_count, "reusing idle tunnel connection");
                    return Ok(conn);
                }
                Err(e) => {
                    // reset() has already closed it
                    debug!(error = %e, "discarding dead idle connection");
                }
            }
        }

        let stream = self.dialer.dial().await?;
        let conn = ClientConnection::establish(stream, self.key).await?;
        debug!("opened new tunnel connection");
        Ok(conn)
    }

    /// Return a cleanly finished connection to the idle set
    ///
    /// Connections beyond capacity are closed instead of being kept.
    pub async fn put_conn(&self, mut conn: ClientConnection<D::Stream>) {
        {
            let mut idle = self.idle.lock().await;
            if idle.conns.len() < self.capacity {
                idle.conns.push_back(conn);
                trace!(idle = idle.conns.len(), "tunnel connection returned to pool");
                return;
            }
        }

        debug!(capacity = self.capacity, "pool full, closing tunnel connection");
        conn.close().await;
    }

    /// Number of idle connections currently held
    pub async fn idle_len(&self) -> usize {
        self.idle.lock().await.conns.len()
    }

    /// Number of times an idle connection was successfully reused
    pub async fn reuse_count(&self) -> u64 {
        self.idle.lock().await.reuse_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::ServerConnection;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};
    use tokio::sync::mpsc;

    const KEY: Key = [3u8; 32];

    /// Dials in-memory pipes; the server ends are handed to the test
    struct PipeDialer {
        peers: mpsc::UnboundedSender<ServerConnection<DuplexStream>>,
    }

    #[async_trait]
    impl Dialer for PipeDialer {
        type Stream = DuplexStream;

        async fn dial(&self) -> Result<DuplexStream, TransportError> {
            let (client, server) = duplex(64 * 1024);
            let peers = self.peers.clone();
            tokio::spawn(async move {
                if let Ok(conn) = ServerConnection::establish(server, KEY).await {
                    let _ = peers.send(conn);
                }
            });
            Ok(client)
        }
    }

    fn pool(capacity: usize) -> (
        ConnectionPool<PipeDialer>,
        mpsc::UnboundedReceiver<ServerConnection<DuplexStream>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionPool::new(PipeDialer { peers: tx }, KEY, capacity), rx)
    }

    #[tokio::test]
    async fn test_get_conn_dials_when_empty() {
        let (pool, mut peers) = pool(2);

        let mut conn = pool.get_conn().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        conn.write(b"hello").await.unwrap();
        assert_eq!(peer.read().await.unwrap().unwrap(), &b"hello"[..]);
        assert_eq!(pool.reuse_count().await, 0);
    }

    #[tokio::test]
    async fn test_put_conn_beyond_capacity_closes() {
        const CAPACITY: usize = 2;
        let (pool, mut peers) = pool(CAPACITY);

        let mut conns = Vec::new();
        let mut servers = Vec::new();
        for _ in 0..=CAPACITY {
            conns.push(pool.get_conn().await.unwrap());
            servers.push(peers.recv().await.unwrap());
        }

        for conn in conns {
            pool.put_conn(conn).await;
            assert!(pool.idle_len().await <= CAPACITY);
        }
        assert_eq!(pool.idle_len().await, CAPACITY);

        // The last one returned was closed: its peer sees the stream end
        let mut last = servers.pop().unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), last.read())
            .await
            .expect("closed connection should be observed");
        assert!(result.is_err());

        // The retained ones are still open
        for mut server in servers {
            let pending = tokio::time::timeout(Duration::from_millis(50), server.read()).await;
            assert!(pending.is_err());
        }
    }

    #[tokio::test]
    async fn test_get_conn_resets_idle_connection() {
        let (pool, mut peers) = pool(2);

        let mut conn = pool.get_conn().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let first_iv = *conn.encrypt_iv();

        // Finish one logical session on both sides
        conn.shutdown_output().await.unwrap();
        assert!(peer.read().await.unwrap().is_none());
        peer.shutdown_output().await.unwrap();
        assert!(conn.read().await.unwrap().is_none());
        pool.put_conn(conn).await;

        let (reused, peer_reset) = tokio::join!(pool.get_conn(), peer.reset());
        let mut reused = reused.unwrap();
        peer_reset.unwrap();

        assert_ne!(reused.encrypt_iv(), &first_iv);
        assert_eq!(reused.encrypt_iv(), peer.decrypt_iv());
        assert_eq!(pool.reuse_count().await, 1);
        assert_eq!(pool.idle_len().await, 0);

        reused.write(b"second session").await.unwrap();
        assert_eq!(peer.read().await.unwrap().unwrap(), &b"second session"[..]);
    }

    #[tokio::test]
    async fn test_get_conn_skips_dead_idle_connection() {
        let (pool, mut peers) = pool(2);

        let mut conn = pool.get_conn().await.unwrap();
        let peer = peers.recv().await.unwrap();
        conn.shutdown_output().await.unwrap();
        pool.put_conn(conn).await;

        // Peer goes away before the connection is reused
        drop(peer);

        let mut fresh = pool.get_conn().await.unwrap();
        let mut fresh_peer = peers.recv().await.unwrap();
        assert_eq!(pool.reuse_count().await, 0);
        assert_eq!(pool.idle_len().await, 0);

        fresh.write(b"fresh").await.unwrap();
        assert_eq!(fresh_peer.read().await.unwrap().unwrap(), &b"fresh"[..]);
    }
}
