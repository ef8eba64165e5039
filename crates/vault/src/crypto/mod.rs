//! Cryptographic primitives for the vault
//!
//! - **Identity & signing**: Ed25519 keypairs (`SecretKey`/`PublicKey`). Every
//!   ledger block and every file header is signed by its author.
//! - **Group encryption**: ChaCha20-Poly1305 under a realm `Secret`. Group keys
//!   are minted on the first grant and on every revocation, and are never
//!   written to storage in the clear.
//! - **Point-to-point encryption**: ECDH over X25519 (converted from the
//!   Ed25519 identities) with AES-KW, packaged as a `SecretShare`. Shares carry
//!   group keys to each member through the ledger, and seal home realm files
//!   to their recipient.
//!
//! # Hashing
//!
//! Ledger blocks are hashed with SHA-512. BLAKE3 derives short ids, node
//! hashes and body nonces.

mod keys;
mod secret;
mod secret_share;

pub use ed25519_dalek::Signature;
pub use keys::{KeyError, PublicKey, SecretKey, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
pub use secret::{derive_nonce, Secret, SecretError, BLAKE3_HASH_SIZE, NONCE_SIZE, SECRET_SIZE, TAG_SIZE};
pub use secret_share::{open, seal, SecretShare, SecretShareError, SECRET_SHARE_SIZE};
