//! SOCKS5 front-end (RFC 1928), no authentication, CONNECT only

use super::{ProxyError, TargetAddr, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Method: no authentication required
const METHOD_NO_AUTH: u8 = 0x00;
/// Method: no acceptable methods
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Command: CONNECT
const CMD_CONNECT: u8 = 0x01;

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Reply message with a zero IPv4 bind address
    fn encode(self) -> [u8; 10] {
        [SOCKS_VERSION, self as u8, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
    }
}

/// SOCKS5 listener
pub struct Socks5Server {
    listener: TcpListener,
}

impl Socks5Server {
    /// Bind a SOCKS5 listener
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one client; the caller runs [`handshake`] on it
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ProxyError> {
        let (stream, peer) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        Ok((stream, peer))
    }

    /// Accept clients forever, handing each negotiated stream to `handler`
    pub async fn run<F, Fut>(&self, handler: F) -> Result<(), ProxyError>
    where
        F: Fn(TcpStream, TargetAddr) -> Fut + Clone + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        loop {
            let (mut stream, peer) = self.accept().await?;
            debug!("New SOCKS5 connection from {}", peer);

            let handler = handler.clone();
            tokio::spawn(async move {
                match handshake(&mut stream).await {
                    Ok(target) => handler(stream, target).await,
                    Err(e) => warn!("SOCKS5 handshake with {} failed: {}", peer, e),
                }
            });
        }
    }
}

/// Run the server side of a SOCKS5 handshake
///
/// On success the CONNECT target is returned and the success reply has
/// already been written; the stream then carries raw application data.
pub async fn handshake<S>(stream: &mut S) -> Result<TargetAddr, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting
    let mut buf = [0u8; 255];
    stream.read_exact(&mut buf[..2]).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;

    if !buf[..nmethods].contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE]).await?;
        return Err(ProxyError::NoAcceptableMethod);
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(header[0]));
    }

    if header[1] != CMD_CONNECT {
        stream.write_all(&Reply::CommandNotSupported.encode()).await?;
        return Err(ProxyError::UnsupportedCommand(header[1]));
    }

    let target = match header[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            TargetAddr::Ipv4(Ipv4Addr::from(ip), stream.read_u16().await?)
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            TargetAddr::Ipv6(Ipv6Addr::from(ip), stream.read_u16().await?)
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            stream.read_exact(&mut buf[..len]).await?;
            let port = stream.read_u16().await?;

            match std::str::from_utf8(&buf[..len]) {
                Ok(domain) if !domain.is_empty() => TargetAddr::Domain(domain.to_string(), port),
                _ => {
                    stream.write_all(&Reply::GeneralFailure.encode()).await?;
                    return Err(ProxyError::InvalidAddress("bad domain name".to_string()));
                }
            }
        }
        other => {
            stream.write_all(&Reply::AddressTypeNotSupported.encode()).await?;
            return Err(ProxyError::UnsupportedAddressType(other));
        }
    };

    debug!("SOCKS5 CONNECT to {}", target);

    // The tunnel is set up after this reply; failures there close the stream
    stream.write_all(&Reply::Succeeded.encode()).await?;

    Ok(target)
}
