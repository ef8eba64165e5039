//! Point-to-point encryption to a user's public key
//!
//! Two constructions share the same ECDH step (ephemeral X25519 key against
//! the recipient's key converted from Ed25519):
//!
//! - [`SecretShare`] wraps a 256-bit [`Secret`] with AES-KW. It is how group
//!   keys travel inside `AddKey` and `ActiveKeySet` ledger changes.
//! - [`seal`]/[`open`] encrypt arbitrary data with a fresh content key and
//!   wrap that key into a share. Home realm headers and bodies use it.

use std::convert::TryFrom;

use aes_kw::KekAes256 as Kek;
use serde::{Deserialize, Serialize};

use super::keys::{KeyError, PublicKey, SecretKey, PUBLIC_KEY_SIZE};
use super::secret::{Secret, SecretError, SECRET_SIZE};

/// Size of AES Key Wrap integrity block in bytes
pub const KW_NONCE_SIZE: usize = 8;
/// Total size of a share: ephemeral public key (32) || wrapped secret (40)
pub const SECRET_SHARE_SIZE: usize = PUBLIC_KEY_SIZE + SECRET_SIZE + KW_NONCE_SIZE;

/// Errors that can occur during share creation or recovery
#[derive(Debug, thiserror::Error)]
pub enum SecretShareError {
    #[error("share error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("secret error: {0}")]
    Secret(#[from] SecretError),
}

/// A [`Secret`] wrapped for exactly one recipient
///
/// ```text
/// [ ephemeral_pubkey: 32 bytes ][ wrapped_secret: 40 bytes ]
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SecretShare([u8; SECRET_SHARE_SIZE]);

impl Serialize for SecretShare {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for SecretShare {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        SecretShare::try_from(bytes.as_slice()).map_err(serde::de::Error::custom)
    }
}

impl TryFrom<&[u8]> for SecretShare {
    type Error = SecretShareError;
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != SECRET_SHARE_SIZE {
            return Err(anyhow::anyhow!(
                "invalid share size, expected {}, got {}",
                SECRET_SHARE_SIZE,
                bytes.len()
            )
            .into());
        }
        let mut share = [0u8; SECRET_SHARE_SIZE];
        share.copy_from_slice(bytes);
        Ok(SecretShare(share))
    }
}

impl SecretShare {
    /// Wrap `secret` so that only the holder of `recipient`'s private key can recover it.
    pub fn new(secret: &Secret, recipient: &PublicKey) -> Result<Self, SecretShareError> {
        let ephemeral_private = SecretKey::generate();
        let ephemeral_public = ephemeral_private.public();

        let shared_secret = ephemeral_private
            .to_x25519()
            .diffie_hellman(&recipient.to_x25519()?);

        let kek = Kek::from(*shared_secret.as_bytes());
        let wrapped = kek
            .wrap_vec(secret.bytes())
            .map_err(|_| anyhow::anyhow!("AES-KW wrap error"))?;

        if PUBLIC_KEY_SIZE + wrapped.len() != SECRET_SHARE_SIZE {
            return Err(anyhow::anyhow!("expected share size is incorrect").into());
        };

        let mut share = [0u8; SECRET_SHARE_SIZE];
        share[..PUBLIC_KEY_SIZE].copy_from_slice(&ephemeral_public.to_bytes());
        share[PUBLIC_KEY_SIZE..].copy_from_slice(&wrapped);

        Ok(SecretShare(share))
    }

    /// Recover the wrapped secret. Fails when the share was made for someone else.
    pub fn recover(&self, recipient_secret: &SecretKey) -> Result<Secret, SecretShareError> {
        let ephemeral_public = PublicKey::try_from(&self.0[..PUBLIC_KEY_SIZE])?;

        let shared_secret = recipient_secret
            .to_x25519()
            .diffie_hellman(&ephemeral_public.to_x25519()?);

        let kek = Kek::from(*shared_secret.as_bytes());
        let unwrapped = kek
            .unwrap_vec(&self.0[PUBLIC_KEY_SIZE..])
            .map_err(|_| anyhow::anyhow!("AES-KW unwrap error"))?;

        Ok(Secret::from_slice(&unwrapped)?)
    }

    /// Get a reference to the raw share bytes
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encrypt `data` for `recipient`: `share (72) || Secret::encrypt(data)`.
pub fn seal(recipient: &PublicKey, data: &[u8]) -> Result<Vec<u8>, SecretShareError> {
    let secret = Secret::generate();
    let share = SecretShare::new(&secret, recipient)?;
    let encrypted = secret.encrypt(data)?;

    let mut out = Vec::with_capacity(SECRET_SHARE_SIZE + encrypted.len());
    out.extend_from_slice(share.bytes());
    out.extend_from_slice(&encrypted);
    Ok(out)
}

/// Decrypt the output of [`seal`] with the recipient's private key.
pub fn open(recipient_secret: &SecretKey, data: &[u8]) -> Result<Vec<u8>, SecretShareError> {
    if data.len() < SECRET_SHARE_SIZE {
        return Err(anyhow::anyhow!("sealed data too short").into());
    }
    let share = SecretShare::try_from(&data[..SECRET_SHARE_SIZE])?;
    let secret = share.recover(recipient_secret)?;
    Ok(secret.decrypt(&data[SECRET_SHARE_SIZE..])?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_share_secret() {
        let secret = Secret::from_slice(&[42u8; SECRET_SIZE]).unwrap();
        let private_key = SecretKey::generate();
        let share = SecretShare::new(&secret, &private_key.public()).unwrap();
        assert_eq!(share.recover(&private_key).unwrap(), secret);
    }

    #[test]
    fn test_share_wrong_recipient() {
        let secret = Secret::generate();
        let alice = SecretKey::generate();
        let bob = SecretKey::generate();

        let share = SecretShare::new(&secret, &alice.public()).unwrap();
        assert_eq!(share.recover(&alice).unwrap(), secret);
        assert!(share.recover(&bob).is_err());
    }

    #[test]
    fn test_share_bincode_and_json() {
        let secret = Secret::generate();
        let private_key = SecretKey::generate();
        let share = SecretShare::new(&secret, &private_key.public()).unwrap();

        let binary = bincode::serialize(&share).unwrap();
        let from_binary: SecretShare = bincode::deserialize(&binary).unwrap();
        assert_eq!(from_binary, share);

        let json = serde_json::to_string(&share).unwrap();
        let from_json: SecretShare = serde_json::from_str(&json).unwrap();
        assert_eq!(from_json.recover(&private_key).unwrap(), secret);

        let short = bincode::serialize(&vec![0u8; SECRET_SHARE_SIZE - 1]).unwrap();
        assert!(bincode::deserialize::<SecretShare>(&short).is_err());
    }

    #[test]
    fn test_seal_and_open() {
        let alice = SecretKey::generate();
        let bob = SecretKey::generate();

        let sealed = seal(&alice.public(), b"for alice only").unwrap();
        assert_eq!(open(&alice, &sealed).unwrap(), b"for alice only");
        assert!(open(&bob, &sealed).is_err());
        assert!(open(&alice, &sealed[..10]).is_err());
    }
}
