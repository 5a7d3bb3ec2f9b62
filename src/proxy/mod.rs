//! Proxy front-end and target descriptors
//!
//! Provides:
//! - `TargetAddr`, the `[atyp][addr][port]` target descriptor carried as the
//!   first data frame of every logical session
//! - SOCKS5 CONNECT front-end (no authentication)

#[cfg(feature = "socks5")]
mod socks5;

#[cfg(feature = "socks5")]
pub use socks5::{handshake, Reply, Socks5Server};

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Address type: IPv4
pub const ATYP_IPV4: u8 = 0x01;
/// Address type: length-prefixed domain name
pub const ATYP_DOMAIN: u8 = 0x03;
/// Address type: IPv6
pub const ATYP_IPV6: u8 = 0x04;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// IPv4 address and port
    Ipv4(Ipv4Addr, u16),
    /// IPv6 address and port
    Ipv6(Ipv6Addr, u16),
    /// Domain name and port
    Domain(String, u16),
}

impl TargetAddr {
    /// Resolved socket address, if this is not a domain name
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            TargetAddr::Ipv4(ip, port) => Some(SocketAddr::from((*ip, *port))),
            TargetAddr::Ipv6(ip, port) => Some(SocketAddr::from((*ip, *port))),
            TargetAddr::Domain(..) => None,
        }
    }

    /// Encode as a target descriptor
    pub fn encode(&self) -> Result<Vec<u8>, ProxyError> {
        let mut buf = Vec::with_capacity(1 + 1 + 255 + 2);

        match self {
            TargetAddr::Ipv4(ip, port) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            TargetAddr::Ipv6(ip, port) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            TargetAddr::Domain(domain, port) => {
                let len = u8::try_from(domain.len()).map_err(|_| {
                    ProxyError::InvalidAddress(format!("domain too long: {} bytes", domain.len()))
                })?;
                if len == 0 {
                    return Err(ProxyError::InvalidAddress("empty domain".to_string()));
                }
                buf.push(ATYP_DOMAIN);
                buf.push(len);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }

        Ok(buf)
    }

    /// Decode a target descriptor; trailing bytes are rejected
    pub fn decode(buf: &[u8]) -> Result<Self, ProxyError> {
        let (&atyp, rest) = buf
            .split_first()
            .ok_or_else(|| ProxyError::InvalidAddress("empty descriptor".to_string()))?;

        let (addr, port_bytes) = match atyp {
            ATYP_IPV4 => {
                let (ip, port) = split_exact(rest, 4)?;
                let mut octets = [0u8; 4];
                octets.copy_from_slice(ip);
                (TargetAddr::Ipv4(Ipv4Addr::from(octets), 0), port)
            }
            ATYP_IPV6 => {
                let (ip, port) = split_exact(rest, 16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(ip);
                (TargetAddr::Ipv6(Ipv6Addr::from(octets), 0), port)
            }
            ATYP_DOMAIN => {
                let (&len, rest) = rest
                    .split_first()
                    .ok_or_else(|| ProxyError::InvalidAddress("missing domain length".to_string()))?;
                let (name, port) = split_exact(rest, len as usize)?;
                let domain = std::str::from_utf8(name)
                    .map_err(|_| ProxyError::InvalidAddress("domain is not UTF-8".to_string()))?;
                if domain.is_empty() {
                    return Err(ProxyError::InvalidAddress("empty domain".to_string()));
                }
                (TargetAddr::Domain(domain.to_string(), 0), port)
            }
            other => return Err(ProxyError::UnsupportedAddressType(other)),
        };

        let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

        Ok(match addr {
            TargetAddr::Ipv4(ip, _) => TargetAddr::Ipv4(ip, port),
            TargetAddr::Ipv6(ip, _) => TargetAddr::Ipv6(ip, port),
            TargetAddr::Domain(domain, _) => TargetAddr::Domain(domain, port),
        })
    }
}

/// Split `len` address bytes off `buf`, requiring exactly two port bytes after
fn split_exact(buf: &[u8], len: usize) -> Result<(&[u8], &[u8]), ProxyError> {
    if buf.len() != len + 2 {
        return Err(ProxyError::InvalidAddress(format!(
            "expected {} address bytes and a port, got {} bytes",
            len,
            buf.len()
        )));
    }
    Ok(buf.split_at(len))
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            TargetAddr::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_descriptor() {
        let addr = TargetAddr::Ipv4(Ipv4Addr::new(192, 0, 2, 1), 80);
        let encoded = addr.encode().unwrap();

        assert_eq!(encoded, vec![0x01, 192, 0, 2, 1, 0x00, 0x50]);
        assert_eq!(TargetAddr::decode(&encoded).unwrap(), addr);
        assert_eq!(addr.to_string(), "192.0.2.1:80");
    }

    #[test]
    fn test_domain_descriptor() {
        let mut payload = vec![0x03, 11];
        payload.extend_from_slice(b"example.com");
        payload.extend_from_slice(&443u16.to_be_bytes());

        let addr = TargetAddr::decode(&payload).unwrap();
        assert_eq!(addr, TargetAddr::Domain("example.com".to_string(), 443));
        assert_eq!(addr.encode().unwrap(), payload);
        assert!(addr.socket_addr().is_none());
    }

    #[test]
    fn test_ipv6_descriptor() {
        let addr = TargetAddr::Ipv6(Ipv6Addr::LOCALHOST, 8080);
        let encoded = addr.encode().unwrap();

        assert_eq!(encoded.len(), 1 + 16 + 2);
        assert_eq!(TargetAddr::decode(&encoded).unwrap(), addr);
        assert_eq!(addr.to_string(), "[::1]:8080");
    }

    #[test]
    fn test_malformed_descriptors() {
        assert!(TargetAddr::decode(&[]).is_err());
        assert!(TargetAddr::decode(&[0x01, 1, 2, 3]).is_err());
        assert!(TargetAddr::decode(&[0x01, 1, 2, 3, 4, 0, 80, 9]).is_err());
        assert!(TargetAddr::decode(&[0x03, 5, b'a', 0, 80]).is_err());
        assert!(matches!(
            TargetAddr::decode(&[0x02, 0, 0]),
            Err(ProxyError::UnsupportedAddressType(0x02))
        ));
    }

    #[test]
    fn test_domain_too_long() {
        let addr = TargetAddr::Domain("a".repeat(256), 80);
        assert!(addr.encode().is_err());
    }
}
