use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use super::LedgerError;
use crate::crypto::{PublicKey, SecretKey, Signature, SIGNATURE_SIZE};

/// Size of a block hash (SHA-512)
pub const HASH_SIZE: usize = 64;

/// Parent hash of the first block of every ledger
pub const GENESIS_HASH: [u8; HASH_SIZE] = [0; HASH_SIZE];

/// A serialized change inside a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChange {
    pub kind: u8,
    pub payload: Vec<u8>,
}

/// A signed ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: u64,
    pub signature: Vec<u8>,
    pub parent_hash: Vec<u8>,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub author: PublicKey,
    pub changes: Vec<BlockChange>,
}

impl Block {
    /// An unsigned block chained after `parent_hash`.
    pub fn new(author: PublicKey, parent_hash: Vec<u8>, changes: Vec<BlockChange>) -> Self {
        Block {
            id: next_block_id(),
            signature: Vec::new(),
            parent_hash,
            timestamp: chrono::Utc::now().timestamp_millis(),
            author,
            changes,
        }
    }

    /// The value the author signs.
    fn sign_hash(&self) -> [u8; HASH_SIZE] {
        let mut hasher = Sha512::new();
        for change in &self.changes {
            hasher.update(&change.payload);
        }
        hasher.update(self.author.to_bytes());
        hasher.update(&self.parent_hash);
        hasher.update(self.id.to_string().as_bytes());
        hasher.update(self.id.to_be_bytes());
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&hasher.finalize());
        hash
    }
}

/// Sign, serialize and compress a block. The block's author must be `identity`.
pub fn encode_block(identity: &SecretKey, block: &mut Block) -> Result<Vec<u8>, LedgerError> {
    if block.author != identity.public() {
        return Err(LedgerError::Malformed(
            "block author does not match signing identity".into(),
        ));
    }
    let hash = block.sign_hash();
    block.signature = identity.sign(&hash).to_bytes().to_vec();

    let data = bincode::serialize(block)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&data)?;
    Ok(encoder.finish()?)
}

/// Decompress, deserialize and verify a block.
pub fn decode_block(data: &[u8]) -> Result<Block, LedgerError> {
    let mut decoder = GzDecoder::new(data);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;

    let block: Block = bincode::deserialize(&raw)?;
    if block.signature.len() != SIGNATURE_SIZE {
        return Err(LedgerError::Malformed(format!(
            "signature must be {} bytes, got {}",
            SIGNATURE_SIZE,
            block.signature.len()
        )));
    }

    let mut signature = [0u8; SIGNATURE_SIZE];
    signature.copy_from_slice(&block.signature);
    let signature = Signature::from_bytes(&signature);
    block
        .author
        .verify(&block.sign_hash(), &signature)
        .map_err(|_| LedgerError::Signature(block.id))?;

    Ok(block)
}

/// Hash of the stored bytes of a block; the parent hash of its successor.
pub fn content_hash(data: &[u8]) -> Vec<u8> {
    Sha512::digest(data).to_vec()
}

/// Object name of the block that follows `parent_hash`.
pub fn block_name(parent_hash: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(parent_hash)
}

/// Snowflake style id: milliseconds, then a node hash, then a sequence.
/// Strictly increasing within the process.
fn next_block_id() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);

    let ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let candidate = (ms << 22) | ((crate::vault::node_hash() as u64) << 12);
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = candidate.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(identity: &SecretKey) -> Block {
        Block::new(
            identity.public(),
            GENESIS_HASH.to_vec(),
            vec![
                BlockChange {
                    kind: 2,
                    payload: b"grant".to_vec(),
                },
                BlockChange {
                    kind: 4,
                    payload: b"attribute".to_vec(),
                },
            ],
        )
    }

    #[test]
    fn test_encode_decode() {
        let identity = SecretKey::generate();
        let mut block = sample(&identity);
        let data = encode_block(&identity, &mut block).unwrap();

        let decoded = decode_block(&data).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.signature.len(), SIGNATURE_SIZE);
    }

    #[test]
    fn test_tampered_block_fails() {
        let identity = SecretKey::generate();
        let mut block = sample(&identity);
        encode_block(&identity, &mut block).unwrap();

        let mut tampered = block.clone();
        tampered.changes[1].payload[0] ^= 1;
        let data = gzip(&bincode::serialize(&tampered).unwrap());
        assert!(matches!(decode_block(&data), Err(LedgerError::Signature(_))));

        let mut tampered = block.clone();
        tampered.parent_hash[5] = 1;
        let data = gzip(&bincode::serialize(&tampered).unwrap());
        assert!(decode_block(&data).is_err());

        let mut tampered = block.clone();
        tampered.author = SecretKey::generate().public();
        let data = gzip(&bincode::serialize(&tampered).unwrap());
        assert!(decode_block(&data).is_err());

        let mut tampered = block;
        tampered.signature.truncate(63);
        let data = gzip(&bincode::serialize(&tampered).unwrap());
        assert!(matches!(decode_block(&data), Err(LedgerError::Malformed(_))));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(decode_block(b"not a block").is_err());
        assert!(decode_block(&gzip(b"short")).is_err());
    }

    #[test]
    fn test_wrong_identity_cannot_sign() {
        let identity = SecretKey::generate();
        let mut block = sample(&SecretKey::generate());
        assert!(encode_block(&identity, &mut block).is_err());
    }

    #[test]
    fn test_ids_increase() {
        let a = next_block_id();
        let b = next_block_id();
        assert!(b > a);
    }

    #[test]
    fn test_block_name_is_url_safe() {
        let name = block_name(&[0xff; HASH_SIZE]);
        assert!(!name.contains('/') && !name.contains('+') && !name.contains('='));
        assert_eq!(block_name(&GENESIS_HASH), "A".repeat(86));
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }
}
