//! Hashing for mining
//!
//! Blake2s-256 is used for transaction hashes, the block hashing blob and
//! the auxiliary header hash committed into merge-mined parent blocks.

use crate::extra::write_varint;
use crate::{Block, Difficulty, Hash};
use blake2::{Blake2s256, Digest};

/// Hash arbitrary data
pub fn fast_hash(data: &[u8]) -> Hash {
    Hash(Blake2s256::digest(data).into())
}

/// Merkle-style root over transaction hashes
pub fn tree_hash(hashes: &[Hash]) -> Hash {
    match hashes.len() {
        0 => Hash::ZERO,
        1 => hashes[0],
        _ => {
            let mut level: Vec<Hash> = hashes.to_vec();
            while level.len() > 1 {
                level = level
                    .chunks(2)
                    .map(|pair| {
                        let mut hasher = Blake2s256::new();
                        hasher.update(pair[0].as_bytes());
                        hasher.update(pair.get(1).unwrap_or(&pair[0]).as_bytes());
                        Hash(hasher.finalize().into())
                    })
                    .collect();
            }
            level[0]
        }
    }
}

/// Blob hashed by proof-of-work, excluding the parent block
fn header_hashing_blob(block: &Block) -> Vec<u8> {
    let mut tx_hashes = Vec::with_capacity(block.transaction_hashes.len() + 1);
    tx_hashes.push(fast_hash(&block.base_transaction.to_blob()));
    tx_hashes.extend_from_slice(&block.transaction_hashes);

    let mut blob = Vec::with_capacity(128);
    block.header.write_blob(&mut blob);
    blob.extend_from_slice(tree_hash(&tx_hashes).as_bytes());
    write_varint(&mut blob, tx_hashes.len() as u64);
    blob
}

/// Header hash committed into the parent block's merge-mining tag
///
/// Computed with the nonce zeroed so every nonce shares one commitment.
pub fn aux_header_hash(block: &Block) -> Hash {
    let mut header_only = block.clone();
    header_only.header.nonce = 0;
    fast_hash(&header_hashing_blob(&header_only))
}

/// Proof-of-work hash of a block
///
/// For merge-mined versions the parent block is part of the hashed data, so
/// the merge-mining tag written into it is covered.
pub fn pow_hash(block: &Block, merge_mined: bool) -> Hash {
    let mut blob = header_hashing_blob(block);
    if merge_mined {
        block.parent_block.write_blob(&mut blob);
    }
    fast_hash(&blob)
}

/// Check `hash * difficulty < 2^256`, reading the hash as a little-endian number
pub fn check_hash(hash: &Hash, difficulty: Difficulty) -> bool {
    if difficulty == 0 {
        return false;
    }

    let bytes = hash.as_bytes();
    let mut carry: u128 = 0;
    for limb in 0..4 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[limb * 8..(limb + 1) * 8]);
        let product = u128::from(u64::from_le_bytes(word)) * u128::from(difficulty) + carry;
        carry = product >> 64;
    }
    carry == 0
}
