// Token sealing for the integrations table
//
// OAuth access/refresh tokens are sealed with AES-256-GCM before they are
// written. Wire format: base64(nonce || ciphertext), fresh random nonce per
// seal.

use aes_gcm::aead::{rand_core::RngCore, Aead, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::{engine::general_purpose, Engine as _};
use thiserror::Error;
use tracing::warn;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
// Exactly KEY_LEN bytes; real deployments set ENCRYPTION_KEY.
const DEV_KEY: &str = "CHANGE_THIS_IN_PRODUCTION_32_BYT";

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("encryption key must be exactly 32 bytes")]
    BadKeyLength,
    #[error("cipher failure: {0}")]
    Cipher(String),
    #[error("stored token is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("stored token is too short to carry a nonce")]
    Truncated,
    #[error("decrypted token is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::string::FromUtf8Error),
}

#[derive(Clone)]
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Build the cipher from `ENCRYPTION_KEY`, falling back to a fixed
    /// development key when unset.
    pub fn new() -> Result<Self, EncryptionError> {
        match std::env::var("ENCRYPTION_KEY") {
            Ok(key) => Self::with_key(key.as_bytes()),
            Err(_) => {
                warn!("ENCRYPTION_KEY not set, using default key for development only");
                Self::with_key(DEV_KEY.as_bytes())
            }
        }
    }

    pub fn with_key(key: &[u8]) -> Result<Self, EncryptionError> {
        if key.len() != KEY_LEN {
            return Err(EncryptionError::BadKeyLength);
        }
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        })
    }

    /// Seal a token for storage.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, EncryptionError> {
        let mut sealed = vec![0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut sealed[..NONCE_LEN]);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&sealed[..NONCE_LEN]), plaintext.as_bytes())
            .map_err(|e| EncryptionError::Cipher(e.to_string()))?;
        sealed.extend_from_slice(&ciphertext);

        Ok(general_purpose::STANDARD.encode(sealed))
    }

    /// Open a stored token.
    pub fn decrypt(&self, stored: &str) -> Result<String, EncryptionError> {
        let sealed = general_purpose::STANDARD.decode(stored)?;
        if sealed.len() < NONCE_LEN {
            return Err(EncryptionError::Truncated);
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| EncryptionError::Cipher(e.to_string()))?;

        Ok(String::from_utf8(plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &[u8] = b"test_key_32_bytes_long_exactly!!";

    #[test]
    fn dev_key_is_a_valid_aes256_key() {
        // The fallback must actually boot; a wrong-length literal would
        // fail every development start.
        assert_eq!(DEV_KEY.len(), KEY_LEN);
        assert!(EncryptionService::with_key(DEV_KEY.as_bytes()).is_ok());
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        assert!(matches!(
            EncryptionService::with_key(b"short"),
            Err(EncryptionError::BadKeyLength)
        ));
    }

    #[test]
    fn round_trip() {
        let service = EncryptionService::with_key(TEST_KEY).unwrap();

        let original = "ya29.a0AfH6SMB-token-material";
        let sealed = service.encrypt(original).unwrap();
        assert_ne!(sealed, original);
        assert_eq!(service.decrypt(&sealed).unwrap(), original);
    }

    #[test]
    fn nonces_differ_between_calls() {
        let service = EncryptionService::with_key(TEST_KEY).unwrap();
        let a = service.encrypt("same").unwrap();
        let b = service.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn garbage_input_errors_cleanly() {
        let service = EncryptionService::with_key(TEST_KEY).unwrap();
        assert!(matches!(
            service.decrypt("!!!not base64!!!"),
            Err(EncryptionError::Encoding(_))
        ));
        assert!(matches!(
            service.decrypt("AAAA"),
            Err(EncryptionError::Truncated)
        ));
    }
}
