//! Relay engine
//!
//! Pumps one logical session between a local raw stream and a tunnel
//! connection. Each direction runs in its own task and exclusively owns one
//! path of the tunnel connection, so the tunnel's read and write cursors are
//! never shared. The connection is handed back only when both directions
//! finished with an orderly half-close.

use crate::proxy::{ProxyError, TargetAddr};
use crate::tunnel::{Role, TunnelConnection, TunnelError, TunnelReader, TunnelWriter};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace};

/// Chunk size for local reads
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Failure to open a logical session
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Cannot encode target: {0}")]
    Target(#[from] ProxyError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

/// How one forwarding direction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Orderly half-close
    Clean,
    /// Anything else
    Dirty,
}

/// How a whole logical session ended
pub enum Completion<S, R> {
    /// Both directions half-closed in order; the connection may be reset and reused
    Clean(TunnelConnection<S, R>),
    /// The connection has been closed
    Dirty,
}

impl<S, R> Completion<S, R> {
    pub fn is_clean(&self) -> bool {
        matches!(self, Completion::Clean(_))
    }
}

impl<S, R> std::fmt::Debug for Completion<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Clean(_) => f.write_str("Clean"),
            Completion::Dirty => f.write_str("Dirty"),
        }
    }
}

/// Send the target descriptor that opens a logical session
///
/// On failure the connection is closed and must be dropped.
pub async fn send_target<S, R>(
    conn: &mut TunnelConnection<S, R>,
    target: &TargetAddr,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: Role,
{
    let descriptor = match target.encode() {
        Ok(descriptor) => descriptor,
        Err(e) => {
            conn.close().await;
            return Err(e.into());
        }
    };

    if let Err(e) = conn.write(&descriptor).await {
        conn.close().await;
        return Err(e.into());
    }
    Ok(())
}

/// Relay a logical session until both directions have finished
pub async fn relay<L, S, R>(local: L, conn: TunnelConnection<S, R>) -> Completion<S, R>
where
    L: AsyncRead + AsyncWrite + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    R: Role,
{
    let (local_read, local_write) = tokio::io::split(local);
    let (reader, writer, key) = conn.split();

    let upstream = tokio::spawn(local_to_tunnel(local_read, writer));
    let downstream = tokio::spawn(tunnel_to_local(reader, local_write));

    let (upstream, downstream) = tokio::join!(upstream, downstream);

    let (writer, up) = match upstream {
        Ok((writer, outcome)) => (Some(writer), outcome),
        Err(e) => {
            debug!(error = %e, "local-to-tunnel task failed");
            (None, Outcome::Dirty)
        }
    };
    let (reader, down) = match downstream {
        Ok((reader, outcome)) => (Some(reader), outcome),
        Err(e) => {
            debug!(error = %e, "tunnel-to-local task failed");
            (None, Outcome::Dirty)
        }
    };

    trace!(role = R::NAME, ?up, ?down, "relay finished");

    match (reader, writer) {
        (Some(reader), Some(writer)) if up == Outcome::Clean && down == Outcome::Clean => {
            match TunnelConnection::reunite(reader, writer, key) {
                Ok(conn) => Completion::Clean(conn),
                Err(e) => {
                    debug!(error = %e, "could not reunite tunnel connection");
                    Completion::Dirty
                }
            }
        }
        (reader, writer) => {
            if let Some(mut reader) = reader {
                reader.close();
            }
            if let Some(mut writer) = writer {
                writer.close().await;
            }
            Completion::Dirty
        }
    }
}

async fn local_to_tunnel<L, S, R>(
    mut local: ReadHalf<L>,
    mut writer: TunnelWriter<S, R>,
) -> (TunnelWriter<S, R>, Outcome)
where
    L: AsyncRead + AsyncWrite,
    S: AsyncRead + AsyncWrite + Unpin,
    R: Role,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            biased;
            _ = writer.closed() => {
                trace!(role = R::NAME, "tunnel closed while reading local stream");
                return (writer, Outcome::Dirty);
            }
            read = local.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                // Local input ends here; the half is dropped with the task
                let outcome = match writer.shutdown_output().await {
                    Ok(()) => Outcome::Clean,
                    Err(e) => {
                        debug!(role = R::NAME, error = %e, "sending fin failed");
                        Outcome::Dirty
                    }
                };
                return (writer, outcome);
            }
            Ok(n) => {
                if let Err(e) = writer.write(&buf[..n]).await {
                    debug!(role = R::NAME, error = %e, "tunnel write failed");
                    return (writer, Outcome::Dirty);
                }
            }
            Err(e) => {
                debug!(role = R::NAME, error = %e, "local read failed");
                writer.close().await;
                return (writer, Outcome::Dirty);
            }
        }
    }
}

async fn tunnel_to_local<L, S, R>(
    mut reader: TunnelReader<S, R>,
    mut local: WriteHalf<L>,
) -> (TunnelReader<S, R>, Outcome)
where
    L: AsyncRead + AsyncWrite,
    S: AsyncRead + AsyncWrite + Unpin,
    R: Role,
{
    loop {
        match reader.read().await {
            Ok(Some(data)) => {
                if let Err(e) = local.write_all(&data).await {
                    debug!(role = R::NAME, error = %e, "local write failed");
                    reader.shutdown_input();
                    return (reader, Outcome::Dirty);
                }
            }
            Ok(None) => {
                let _ = local.shutdown().await;
                reader.shutdown_input();
                return (reader, Outcome::Clean);
            }
            Err(e) => {
                if e.is_state() {
                    trace!(role = R::NAME, error = %e, "tunnel read stopped");
                } else {
                    debug!(role = R::NAME, error = %e, "tunnel read failed");
                }
                let _ = local.shutdown().await;
                reader.close();
                return (reader, Outcome::Dirty);
            }
        }
    }
}
