//! Symmetric confidentiality for message bodies in transit.
//!
//! The key is a single static pre-shared value scoped to the whole
//! deployment, not per conversation or per user. That gives confidentiality
//! against passive eavesdroppers on an otherwise trusted channel; it does not
//! authenticate senders. Decryption failure is never an error condition: a
//! mis-encrypted or legacy-plaintext body degrades to being displayed as-is.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("shared key is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("shared key must be {KEY_LEN} bytes, got {0}")]
    Length(usize),
}

#[derive(Clone)]
pub struct BodyCodec {
    key: [u8; KEY_LEN],
}

impl BodyCodec {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let raw = STANDARD.decode(encoded.trim())?;
        let key: [u8; KEY_LEN] = raw
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::Length(raw.len()))?;
        Ok(Self::new(key))
    }

    /// Fresh random nonce per call; wire format is base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> String {
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        match cipher.encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes()) {
            Ok(ciphertext) => {
                let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                wire.extend_from_slice(&nonce);
                wire.extend_from_slice(&ciphertext);
                STANDARD.encode(wire)
            }
            // The AEAD only fails on pathological input lengths; mirror the
            // decrypt side and pass the body through unchanged.
            Err(_) => plaintext.to_string(),
        }
    }

    /// Returns the input unchanged on any failure: malformed base64, short
    /// payload, wrong key, tampering, empty or non-UTF-8 plaintext. Callers
    /// must not treat fallback as an error.
    pub fn decrypt(&self, payload: &str) -> String {
        match self.try_decrypt(payload) {
            Some(plaintext) => plaintext,
            None => payload.to_string(),
        }
    }

    fn try_decrypt(&self, payload: &str) -> Option<String> {
        let wire = STANDARD.decode(payload).ok()?;
        if wire.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = wire.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let plaintext = cipher.decrypt(XNonce::from_slice(nonce), ciphertext).ok()?;
        if plaintext.is_empty() {
            return None;
        }
        String::from_utf8(plaintext).ok()
    }
}
