//! Client side: SOCKS5 front-end feeding logical sessions into pooled
//! tunnel connections

use crate::pool::ConnectionPool;
use crate::proxy::{ProxyError, Socks5Server, TargetAddr};
use crate::relay::{relay, send_target, Completion};
use crate::transport::Dialer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Local SOCKS5 proxy forwarding through a connection pool
pub struct TunnelClient<D: Dialer> {
    socks: Socks5Server,
    pool: Arc<ConnectionPool<D>>,
}

impl<D: Dialer> TunnelClient<D> {
    /// Bind the local SOCKS5 listener
    pub async fn bind(listen: &str, pool: Arc<ConnectionPool<D>>) -> Result<Self, ProxyError> {
        let socks = Socks5Server::bind(listen).await?;
        Ok(Self { socks, pool })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        self.socks.local_addr()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<D>> {
        &self.pool
    }

    /// Serve SOCKS5 clients forever
    pub async fn run(&self) -> Result<(), ProxyError> {
        let pool = self.pool.clone();
        self.socks
            .run(move |stream, target| {
                let pool = pool.clone();
                async move { serve_session(&pool, stream, target).await }
            })
            .await
    }
}

/// Carry one local session over a pooled tunnel connection
///
/// Failures are not reported to the local peer beyond closing its stream.
pub async fn serve_session<D, L>(pool: &ConnectionPool<D>, local: L, target: TargetAddr)
where
    D: Dialer,
    L: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut conn = match pool.get_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(%target, error = %e, "no tunnel connection available");
            return;
        }
    };

    if let Err(e) = send_target(&mut conn, &target).await {
        debug!(%target, error = %e, "failed to send target descriptor");
        return;
    }

    match relay(local, conn).await {
        Completion::Clean(conn) => pool.put_conn(conn).await,
        Completion::Dirty => debug!(%target, "session ended dirty, tunnel connection dropped"),
    }
}

/// Answer every connection on `listener` with the pool's reuse count
pub async fn serve_stats<D: Dialer>(listener: TcpListener, pool: Arc<ConnectionPool<D>>) {
    if let Ok(addr) = listener.local_addr() {
        info!("Reuse counter listening on {}", addr);
    }

    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept stats connection: {}", e);
                continue;
            }
        };

        let line = format!("reuse: {}\n", pool.reuse_count().await);
        tokio::spawn(async move {
            if let Err(e) = stream.write_all(line.as_bytes()).await {
                debug!(%peer, error = %e, "failed to write stats");
            }
            let _ = stream.shutdown().await;
        });
    }
}
