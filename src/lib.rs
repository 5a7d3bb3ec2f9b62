//! # tunpool
//!
//! An encrypted TCP tunnel that carries SOCKS5 sessions from a local client
//! daemon to a remote server daemon, reusing each physical connection for
//! many logical sessions.
//!
//! ## Features
//!
//! - **WebSocket-style framing** with client-side masking
//! - **AES-256-CTR** with a fresh IV pair for every logical session
//! - **Independent half-close** in both directions via an in-band "fin"
//! - **Connection pooling** on the client, in-place reuse on the server
//! - **SOCKS5 CONNECT** front-end
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │               Client / Server daemons                │
//! │        (SOCKS5 front-end, target dialing)           │
//! ├─────────────────────────────────────────────────────┤
//! │             Connection Pool / Reuse loop             │
//! │        (idle set, reset before every session)        │
//! ├─────────────────────────────────────────────────────┤
//! │                    Relay Engine                      │
//! │     (two directions, clean/dirty completion)         │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Layer                       │
//! │   (IV exchange, encryption, framing, half-close)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │                       (TCP)                          │
//! └─────────────────────────────────────────────────────┘
//! ```

#[cfg(feature = "socks5")]
pub mod client;
pub mod config;
pub mod crypto;
pub mod pool;
pub mod proxy;
pub mod relay;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Pool error: {0}")]
    Pool(#[from] pool::PoolError),

    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
