//! File header and body encoding
//!
//! Every file version is stored as two objects: a small header carrying
//! the signed metadata and the body carrying the content. How both are
//! protected depends on the realm:
//!
//! - `all`: plaintext, signed
//! - `home`: sealed to the user named by the first path segment
//! - any other realm: encrypted with a group key from the ledger
//!
//! Headers start with an 8 byte routing prefix in the clear, so a reader
//! can tell a header it has no key for from a corrupt one without trying
//! to decrypt it.

mod body;
mod head;

pub use body::{decode_body, encode_body, BodyContext};
pub use head::{decode_head, encode_head, Head, SignedHead, HOME_TAG, PREFIX_SIZE};

use crate::crypto::{KeyError, PublicKey, Secret, SecretError, SecretKey, SecretShareError};
use crate::model::Flags;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("malformed header: {0}")]
    Malformed(String),

    #[error("header signature does not verify")]
    Signature,

    #[error("invalid recipient in name {0}")]
    Recipient(String),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Share(#[from] SecretShareError),
}

/// How a new file version is protected
#[derive(Debug, Clone)]
pub enum Protection {
    Plain,
    Group { key_id: u64, key: Secret },
    Home { recipient: PublicKey },
}

impl Protection {
    /// Key id recorded for the file, also the header routing prefix.
    pub fn key_id(&self) -> u64 {
        match self {
            Protection::Plain => 0,
            Protection::Group { key_id, .. } => *key_id,
            Protection::Home { recipient } => recipient.short_id() | HOME_TAG,
        }
    }

    pub fn flags(&self) -> Flags {
        match self {
            Protection::Plain => Flags::NONE,
            Protection::Group { .. } => Flags::SYMMETRIC,
            Protection::Home { .. } => Flags::EC,
        }
    }
}

/// What a reader holds to open a file version
#[derive(Debug, Clone, Copy)]
pub enum Unlock<'a> {
    Plain,
    Group { key_id: u64, key: &'a Secret },
    Home { identity: &'a SecretKey },
}
