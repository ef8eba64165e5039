//! Symmetric encryption using ChaCha20-Poly1305
//!
//! A `Secret` is either a realm's group key (distributed through the ledger
//! and used for headers and bodies of group realm files) or a one-off content
//! key sealed to a single recipient.

use std::ops::Deref;

use chacha20poly1305::Key;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use serde::{Deserialize, Serialize};

/// Size of ChaCha20-Poly1305 nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of ChaCha20-Poly1305 key in bytes (256 bits)
pub const SECRET_SIZE: usize = 32;
/// Size of BLAKE3 hash in bytes (256 bits)
pub const BLAKE3_HASH_SIZE: usize = 32;
/// Size of the Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Errors that can occur during encryption/decryption
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret error: {0}")]
    Default(#[from] anyhow::Error),
}

/// A 256-bit symmetric encryption key
///
/// [`Secret::encrypt`] produces `nonce (12) || encrypted(hash(32) || plaintext) || tag (16)`
/// with a random nonce and is used for small payloads (headers, sealed data).
/// [`Secret::encrypt_with_nonce`] produces `encrypted(plaintext) || tag (16)` under
/// a caller supplied nonce and is used for file bodies, whose nonce is derived
/// from where the body lives rather than stored next to it.
#[derive(PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Secret([u8; SECRET_SIZE]);

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}

impl Deref for Secret {
    type Target = [u8; SECRET_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; SECRET_SIZE]> for Secret {
    fn from(bytes: [u8; SECRET_SIZE]) -> Self {
        Secret(bytes)
    }
}

impl Secret {
    /// Generate a new random secret using a cryptographically secure RNG
    pub fn generate() -> Self {
        let mut buff = [0; SECRET_SIZE];
        getrandom::getrandom(&mut buff).expect("failed to generate random bytes");
        Self(buff)
    }

    /// Create a secret from a byte slice of exactly `SECRET_SIZE` bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self, SecretError> {
        if data.len() != SECRET_SIZE {
            return Err(anyhow::anyhow!(
                "invalid secret size, expected {}, got {}",
                SECRET_SIZE,
                data.len()
            )
            .into());
        }
        let mut buff = [0; SECRET_SIZE];
        buff.copy_from_slice(data);
        Ok(buff.into())
    }

    /// Get a reference to the secret key bytes
    pub fn bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.bytes()))
    }

    /// Encrypt data under a fresh random nonce, with a BLAKE3 hash of the
    /// plaintext prepended for integrity checking on decrypt.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, SecretError> {
        let plaintext_hash = blake3::hash(data);

        let mut data_with_hash = Vec::with_capacity(BLAKE3_HASH_SIZE + data.len());
        data_with_hash.extend_from_slice(plaintext_hash.as_bytes());
        data_with_hash.extend_from_slice(data);

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| anyhow::anyhow!("failed to generate nonce: {}", e))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, data_with_hash.as_ref())
            .map_err(|_| anyhow::anyhow!("encrypt error"))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(nonce.as_ref());
        out.extend_from_slice(ciphertext.as_ref());

        Ok(out)
    }

    /// Decrypt the output of [`Secret::encrypt`].
    ///
    /// Fails when the input is truncated, the tag does not authenticate
    /// (tampering or wrong key), or the embedded hash does not match.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, SecretError> {
        if data.len() < NONCE_SIZE {
            return Err(anyhow::anyhow!("data too short for nonce").into());
        }

        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
        let decrypted = self
            .cipher()
            .decrypt(nonce, &data[NONCE_SIZE..])
            .map_err(|_| anyhow::anyhow!("decrypt error"))?;

        if decrypted.len() < BLAKE3_HASH_SIZE {
            return Err(anyhow::anyhow!("decrypted data too short for hash header").into());
        }

        let stored_hash = &decrypted[..BLAKE3_HASH_SIZE];
        let plaintext = &decrypted[BLAKE3_HASH_SIZE..];

        let computed_hash = blake3::hash(plaintext);
        if stored_hash != computed_hash.as_bytes() {
            return Err(anyhow::anyhow!("hash verification failed - data corrupted").into());
        }

        Ok(plaintext.to_vec())
    }

    /// Encrypt data under a deterministic nonce. The nonce is not part of the output.
    pub fn encrypt_with_nonce(
        &self,
        nonce: &[u8; NONCE_SIZE],
        data: &[u8],
    ) -> Result<Vec<u8>, SecretError> {
        self.cipher()
            .encrypt(Nonce::from_slice(nonce), data)
            .map_err(|_| anyhow::anyhow!("encrypt error").into())
    }

    /// Decrypt the output of [`Secret::encrypt_with_nonce`].
    pub fn decrypt_with_nonce(
        &self,
        nonce: &[u8; NONCE_SIZE],
        data: &[u8],
    ) -> Result<Vec<u8>, SecretError> {
        if data.len() < TAG_SIZE {
            return Err(anyhow::anyhow!("data too short for tag").into());
        }
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), data)
            .map_err(|_| anyhow::anyhow!("decrypt error").into())
    }
}

/// Derive a nonce from an ordered list of context values.
///
/// Each part is length prefixed so that different splits of the same bytes
/// never collide.
pub fn derive_nonce(parts: &[&[u8]]) -> [u8; NONCE_SIZE] {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&hasher.finalize().as_bytes()[..NONCE_SIZE]);
    nonce
}
