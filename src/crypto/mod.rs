//! Cryptographic primitives for the tunnel
//!
//! This module provides:
//! - AES-256-CTR stream ciphers, one per direction of a tunnel connection
//! - HKDF-SHA256 derivation of the shared key from the configured password
//! - Secure random IV generation

mod kdf;
mod stream;

pub use kdf::{derive_key, Hkdf};
pub use stream::StreamCipher;

use thiserror::Error;

/// Length of the shared symmetric key in bytes (AES-256)
pub const KEY_LEN: usize = 32;

/// Length of the per-direction IV in bytes
pub const IV_LEN: usize = 16;

/// Shared tunnel key, derived once per process from the password
pub type Key = [u8; KEY_LEN];

/// Stream cipher initialization vector
pub type Iv = [u8; IV_LEN];

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid IV length: {0}")]
    InvalidIvLength(usize),

    #[error("System random source failed")]
    Random,
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Random)
}

/// Generate a fresh random IV
pub fn generate_iv() -> Result<Iv, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    random_bytes(&mut iv)?;
    Ok(iv)
}
