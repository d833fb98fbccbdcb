//! Sealing of sensitive job fields for transit through the queue.
//!
//! Clone URLs and commit SHAs are encrypted with AES-256-GCM before they
//! are enqueued and opened again inside the executor. The key is derived
//! from the controller's shared secret with scrypt, using a random salt
//! generated per sealing; salt and nonce travel with the ciphertext. GCM
//! authenticates the payload, so any tampering surfaces as a
//! `decrypt-error` when the executor opens it.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Scrypt cost parameters: N = 2^14, r = 8, p = 1.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

#[derive(Debug, Error)]
pub enum SealError {
    #[error("sealing failed: {0}")]
    Seal(String),
    /// Wrong key, truncated fields, or tampered ciphertext.
    #[error("failed to open sealed payload: {0}")]
    Open(String),
}

/// An encrypted field as it travels through the queue.
///
/// All three parts are base64; `ciphertext` carries the GCM auth tag
/// appended to the encrypted bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// Seals and opens sensitive payload fields under a shared secret.
#[derive(Clone)]
pub struct PayloadCipher {
    secret: Vec<u8>,
}

impl PayloadCipher {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn derive_key(&self, salt: &[u8]) -> Result<[u8; KEY_LEN], SealError> {
        let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
            .map_err(|e| SealError::Seal(format!("bad scrypt params: {e}")))?;
        let mut key = [0u8; KEY_LEN];
        scrypt::scrypt(&self.secret, salt, &params, &mut key)
            .map_err(|e| SealError::Seal(format!("scrypt failed: {e}")))?;
        Ok(key)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed, SealError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let key = self.derive_key(&salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| SealError::Seal("AES-GCM encryption failed".to_string()))?;

        Ok(Sealed {
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    pub fn seal_str(&self, plaintext: &str) -> Result<Sealed, SealError> {
        self.seal(plaintext.as_bytes())
    }

    pub fn open(&self, sealed: &Sealed) -> Result<Vec<u8>, SealError> {
        let salt = BASE64
            .decode(&sealed.salt)
            .map_err(|e| SealError::Open(format!("bad salt encoding: {e}")))?;
        let nonce = BASE64
            .decode(&sealed.nonce)
            .map_err(|e| SealError::Open(format!("bad nonce encoding: {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(SealError::Open(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .map_err(|e| SealError::Open(format!("bad ciphertext encoding: {e}")))?;

        let key = self.derive_key(&salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| SealError::Open("integrity check failed".to_string()))
    }

    pub fn open_str(&self, sealed: &Sealed) -> Result<String, SealError> {
        let bytes = self.open(sealed)?;
        String::from_utf8(bytes).map_err(|e| SealError::Open(format!("not valid UTF-8: {e}")))
    }
}
