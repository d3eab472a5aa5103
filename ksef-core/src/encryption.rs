//! Session-scoped symmetric encryption for invoice uploads.
//!
//! Every upload session gets a fresh AES-256 key and 16-byte IV. Invoices are
//! sealed with AES-256-GCM. The nonce of invoice `n` is the session IV with the
//! big-endian ordinal `n` XORed into its last four bytes, so no two invoices of
//! a session share a nonce.
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use base64ct::{Base64, Encoding};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

type SessionCipher = AesGcm<Aes256, U16>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("invoice ordinal must start at 1")]
    InvalidOrdinal,
    #[error("invoice ordinals of this session key are exhausted")]
    OrdinalsExhausted,
    #[error("invoice encryption failed")]
    Seal,
    #[error("invoice decryption failed: ciphertext or tag does not authenticate")]
    Open,
}

/// Symmetric key material of one upload session. Wiped from memory on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey([redacted])")
    }
}

impl SessionKey {
    /// Fresh key and IV from the operating system CSPRNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    pub fn from_parts(key: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        Self { key, iv }
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    fn nonce_for(&self, ordinal: u32) -> Result<[u8; IV_LEN], EncryptionError> {
        if ordinal == 0 {
            return Err(EncryptionError::InvalidOrdinal);
        }
        let mut nonce = self.iv;
        for (byte, mask) in nonce[IV_LEN - 4..].iter_mut().zip(ordinal.to_be_bytes()) {
            *byte ^= mask;
        }
        Ok(nonce)
    }

    fn cipher(&self) -> SessionCipher {
        SessionCipher::new(&self.key.into())
    }

    /// Seal invoice `ordinal` (1-based) of this session. Output is ciphertext
    /// followed by the 16-byte tag.
    pub fn encrypt(&self, ordinal: u32, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = self.nonce_for(ordinal)?;
        self.cipher()
            .encrypt(Nonce::<U16>::from_slice(&nonce), plaintext)
            .map_err(|_| EncryptionError::Seal)
    }

    pub fn decrypt(&self, ordinal: u32, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = self.nonce_for(ordinal)?;
        self.cipher()
            .decrypt(Nonce::<U16>::from_slice(&nonce), ciphertext)
            .map_err(|_| EncryptionError::Open)
    }
}

/// Base64 SHA-256 digest, the form the Registry uses for invoice hashes.
pub fn sha256_base64(data: &[u8]) -> String {
    Base64::encode_string(&Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_per_ordinal() {
        let key = SessionKey::generate();
        let invoice = b"<Faktura>1</Faktura>";
        let sealed = key.encrypt(1, invoice).unwrap();
        assert_eq!(sealed.len(), invoice.len() + 16);
        assert_eq!(key.decrypt(1, &sealed).unwrap(), invoice);
        assert_eq!(key.decrypt(2, &sealed), Err(EncryptionError::Open));
    }

    #[test]
    fn ordinals_never_share_a_nonce() {
        let key = SessionKey::from_parts([7u8; KEY_LEN], [0xAB; IV_LEN]);
        let first = key.nonce_for(1).unwrap();
        let second = key.nonce_for(2).unwrap();
        assert_ne!(first, second);
        assert_eq!(first[..12], key.iv()[..12]);
        assert_eq!(key.nonce_for(0), Err(EncryptionError::InvalidOrdinal));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = SessionKey::generate();
        let mut sealed = key.encrypt(3, b"invoice").unwrap();
        sealed[0] ^= 0x01;
        assert_eq!(key.decrypt(3, &sealed), Err(EncryptionError::Open));
    }

    #[test]
    fn generated_keys_differ() {
        let a = SessionKey::generate();
        let b = SessionKey::generate();
        assert_ne!(a.key(), b.key());
        assert_ne!(a.iv(), b.iv());
    }

    #[test]
    fn hash_is_base64_sha256() {
        assert_eq!(
            sha256_base64(b"abc"),
            "ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0="
        );
    }
}
