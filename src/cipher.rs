//! File Cipher Module
//!
//! Encryption is supplied externally; the coordination engine only needs an
//! `encrypt(plaintext) -> (ciphertext, key)` capability and its inverse. The
//! passthrough implementation keeps the data unchanged while still issuing
//! per-file keys, so the mapping shape matches a deployment with a real
//! cipher installed.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Opaque per-file key material, stored with the file mapping.
pub type CipherKey = String;

pub trait FileCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> (Vec<u8>, CipherKey);
    fn decrypt(&self, ciphertext: &[u8], key: &CipherKey) -> Result<Vec<u8>, CipherError>;
}

/// Identity transform with a random key token.
#[derive(Debug, Default)]
pub struct PassthroughCipher;

impl FileCipher for PassthroughCipher {
    fn encrypt(&self, plaintext: &[u8]) -> (Vec<u8>, CipherKey) {
        (plaintext.to_vec(), Uuid::new_v4().simple().to_string())
    }

    fn decrypt(&self, ciphertext: &[u8], _key: &CipherKey) -> Result<Vec<u8>, CipherError> {
        Ok(ciphertext.to_vec())
    }
}

/// Generate a fresh masked file name.
pub fn masked_name() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_roundtrip() {
        let cipher = PassthroughCipher;
        let (ciphertext, key) = cipher.encrypt(b"secret payload");
        let plaintext = cipher.decrypt(&ciphertext, &key).unwrap();
        assert_eq!(plaintext, b"secret payload");
    }

    #[test]
    fn test_masked_names_are_unique() {
        assert_ne!(masked_name(), masked_name());
    }
}
