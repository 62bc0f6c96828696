//! At-rest encoding of device secrets.
//!
//! The rotation engine never persists a secret directly; every read and
//! write goes through a [`SecretCodec`] so the encryption scheme can be
//! swapped without touching the rotation logic.

use crate::errors::ApsisError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64ct::{Base64, Encoding};
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

pub trait SecretCodec: Send + Sync {
    fn encrypt_secret(&self, plaintext: &str) -> Result<String, ApsisError>;
    fn decrypt_secret(&self, stored: &str) -> Result<String, ApsisError>;
}

/// Stores secrets as-is. Used when no passphrase is configured and in tests.
pub struct PlainCodec;

impl SecretCodec for PlainCodec {
    fn encrypt_secret(&self, plaintext: &str) -> Result<String, ApsisError> {
        Ok(plaintext.to_string())
    }

    fn decrypt_secret(&self, stored: &str) -> Result<String, ApsisError> {
        Ok(stored.to_string())
    }
}

/// AES-256-GCM with a key derived from a configured passphrase.
///
/// Stored form: base64(nonce || ciphertext). The nonce is random per
/// encryption, so encrypting the same secret twice yields different rows.
pub struct AesGcmCodec {
    cipher: Aes256Gcm,
}

impl AesGcmCodec {
    pub fn new(passphrase: &str) -> Result<Self, ApsisError> {
        let key = Sha256::digest(passphrase.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| ApsisError::SecretCodec(format!("bad key length: {}", e)))?;
        Ok(Self { cipher })
    }
}

impl SecretCodec for AesGcmCodec {
    fn encrypt_secret(&self, plaintext: &str) -> Result<String, ApsisError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| ApsisError::SecretCodec(format!("encryption failed: {}", e)))?;

        let mut buf = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        buf.extend_from_slice(&nonce_bytes);
        buf.extend_from_slice(&ciphertext);
        Ok(Base64::encode_string(&buf))
    }

    fn decrypt_secret(&self, stored: &str) -> Result<String, ApsisError> {
        let buf = Base64::decode_vec(stored)
            .map_err(|e| ApsisError::SecretCodec(format!("invalid base64: {}", e)))?;
        if buf.len() <= NONCE_LEN {
            return Err(ApsisError::SecretCodec("stored secret too short".into()));
        }

        let (nonce_bytes, ciphertext) = buf.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| ApsisError::SecretCodec(format!("decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| ApsisError::SecretCodec(format!("invalid utf-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_codec_round_trip() {
        let codec = PlainCodec;
        let stored = codec.encrypt_secret("s3cret").unwrap();
        assert_eq!(stored, "s3cret");
        assert_eq!(codec.decrypt_secret(&stored).unwrap(), "s3cret");
    }

    #[test]
    fn test_aes_codec_round_trip() {
        let codec = AesGcmCodec::new("passphrase").unwrap();
        let stored = codec.encrypt_secret("s3cret").unwrap();
        assert_ne!(stored, "s3cret");
        assert_eq!(codec.decrypt_secret(&stored).unwrap(), "s3cret");
    }

    #[test]
    fn test_aes_codec_fresh_nonce_per_encryption() {
        let codec = AesGcmCodec::new("passphrase").unwrap();
        let a = codec.encrypt_secret("s3cret").unwrap();
        let b = codec.encrypt_secret("s3cret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_aes_codec_rejects_tampered_ciphertext() {
        let codec = AesGcmCodec::new("passphrase").unwrap();
        let stored = codec.encrypt_secret("s3cret").unwrap();

        let mut buf = Base64::decode_vec(&stored).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        let tampered = Base64::encode_string(&buf);

        assert!(codec.decrypt_secret(&tampered).is_err());
    }

    #[test]
    fn test_aes_codec_rejects_wrong_passphrase() {
        let codec = AesGcmCodec::new("passphrase").unwrap();
        let other = AesGcmCodec::new("different").unwrap();
        let stored = codec.encrypt_secret("s3cret").unwrap();

        assert!(other.decrypt_secret(&stored).is_err());
    }
}
