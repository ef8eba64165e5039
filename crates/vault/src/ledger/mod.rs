//! Signed, hash chained ledger of vault governance
//!
//! Every access grant, key rotation, attribute and configuration change is
//! a [`Change`] inside a signed [`Block`]. Blocks are stored under the hash
//! of their parent, so the chain can be walked forward from the zero hash
//! without listing the store, and two writers racing for the same slot are
//! settled by the store's create-if-absent.

mod block;
mod chain;
mod change;

pub use block::{
    block_name, content_hash, decode_block, encode_block, Block, BlockChange, GENESIS_HASH,
    HASH_SIZE,
};
pub use chain::ExportOutcome;
pub use change::{ActiveKeySet, AddAttribute, AddKey, Change, ChangeAccess};

pub(crate) use chain::Ledger;
pub(crate) use change::CONFIG_SETTING;

/// Errors decoding or verifying ledger blocks
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("malformed block: {0}")]
    Malformed(String),

    #[error("invalid signature on block {0}")]
    Signature(u64),

    #[error("broken chain: {0}")]
    Chain(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),
}
