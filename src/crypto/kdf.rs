//! Key derivation
//!
//! The tunnel key is derived once from the configured password with
//! HKDF-SHA256 and shared by every connection of the process.

use super::{CryptoError, Key, KEY_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};

/// Salt mixed into every password-derived key
const PASSWORD_SALT: &[u8] = b"tunpool password salt v1";

/// Info label for the AES-256-CTR tunnel key
const TUNNEL_KEY_INFO: &[u8] = b"tunpool aes-256-ctr key";

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from a salt and input keying material
    pub fn new(salt: &[u8], ikm: &[u8]) -> Self {
        Self {
            prk: Salt::new(HKDF_SHA256, salt).extract(ikm),
        }
    }

    /// Expand the PRK into `output`
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(output.len()))
            .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".to_string()))?;

        okm.fill(output)
            .map_err(|_| CryptoError::KeyDerivation("HKDF fill failed".to_string()))
    }

    /// Derive a 32-byte key
    pub fn expand_key(&self, info: &[u8]) -> Result<Key, CryptoError> {
        let mut key = [0u8; KEY_LEN];
        self.expand(info, &mut key)?;
        Ok(key)
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Derive the process-wide tunnel key from a password
pub fn derive_key(password: &str) -> Result<Key, CryptoError> {
    if password.is_empty() {
        return Err(CryptoError::KeyDerivation("empty password".to_string()));
    }

    Hkdf::new(PASSWORD_SALT, password.as_bytes()).expand_key(TUNNEL_KEY_INFO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_labels() {
        let hkdf = Hkdf::new(b"salt", b"input keying material");

        let key1 = hkdf.expand_key(b"label1").unwrap();
        let key2 = hkdf.expand_key(b"label2").unwrap();
        assert_ne!(key1, key2);

        let key1_again = hkdf.expand_key(b"label1").unwrap();
        assert_eq!(key1, key1_again);
    }

    #[test]
    fn test_password_key_is_deterministic() {
        let a = derive_key("correct horse").unwrap();
        let b = derive_key("correct horse").unwrap();
        let c = derive_key("battery staple").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), KEY_LEN);
    }

    #[test]
    fn test_empty_password_rejected() {
        assert!(derive_key("").is_err());
    }
}
