//! Tunnel layer - encrypted, framed duplex channel
//!
//! Provides:
//! - Frame encoding/decoding
//! - Cipher bring-up (IV exchange)
//! - Independent half-close in both directions
//! - In-place reset for reuse by the next logical session

mod connection;
mod frame;
mod state;

pub use connection::{
    Client, ClientConnection, Role, Server, ServerConnection, TunnelConnection, TunnelReader,
    TunnelWriter,
};
pub use frame::{mask, read_frame, ContentType, Frame, FrameType, MASK_KEY_LEN, MAX_PAYLOAD_SIZE};
pub use state::{CloseSignal, ConnectionState, StateError};

use thiserror::Error;

/// Decrypted payload of the half-close control frame
pub const FIN_MARKER: &[u8] = b"fin";

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(u64, usize),

    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

impl TunnelError {
    /// Frame alignment was lost; the connection cannot be trusted again
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            TunnelError::InvalidFrame(_) | TunnelError::FrameTooLarge(..) | TunnelError::UnexpectedEof
        )
    }

    /// Operation against a half- or fully-closed connection
    pub fn is_state(&self) -> bool {
        matches!(self, TunnelError::State(_))
    }
}
