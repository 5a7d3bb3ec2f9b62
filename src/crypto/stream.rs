//! AES-256-CTR stream cipher
//!
//! Each direction of a tunnel connection owns one `StreamCipher`. The
//! keystream position advances with every byte processed, so both peers
//! must process exactly the same frames in the same order.

use super::{generate_iv, CryptoError, Iv, Key, IV_LEN};
use ctr::cipher::{KeyIvInit, StreamCipher as _};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// One direction of a cipher session
pub struct StreamCipher {
    inner: Aes256Ctr,
    iv: Iv,
}

impl StreamCipher {
    /// Create a cipher with a freshly generated random IV (sending side)
    pub fn generate(key: &Key) -> Result<Self, CryptoError> {
        let iv = generate_iv()?;
        Self::new(key, &iv)
    }

    /// Create a cipher from a known IV (receiving side)
    pub fn new(key: &Key, iv: &[u8]) -> Result<Self, CryptoError> {
        if iv.len() != IV_LEN {
            return Err(CryptoError::InvalidIvLength(iv.len()));
        }

        let inner = Aes256Ctr::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength)?;
        let mut stored = [0u8; IV_LEN];
        stored.copy_from_slice(iv);

        Ok(Self { inner, iv: stored })
    }

    /// IV this cipher was initialized with
    pub fn iv(&self) -> &Iv {
        &self.iv
    }

    /// Encrypt or decrypt `buf` in place
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.inner.apply_keystream(buf);
    }

    /// Encrypt or decrypt into a new buffer
    pub fn process(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply(&mut out);
        out
    }
}

impl std::fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCipher").field("iv", &self.iv).finish_non_exhaustive()
    }
}
