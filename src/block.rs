//! Block and header structures, hashing, and chain-continuity verification
//!
//! A block hash is SHA-256 over the record string
//! `"{id}-{prev_hash_hex}-{merkle_root_hex}-{timestamp}-{nonce}"`. Headers
//! hash identically, which is what makes cheap headers-first sync possible.

use crate::error::{ChainError, Result};
use crate::transaction::{now_millis, Transaction};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type Hash = [u8; 32];

/// Leading zero hex characters required of a valid non-genesis block hash.
pub const DEFAULT_DIFFICULTY: usize = 5;

/// Fixed genesis timestamp. Every node derives the identical genesis block,
/// so chains bootstrapped independently can still sync block-for-block.
pub const GENESIS_TIMESTAMP: i64 = 1_704_067_200_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: i64,
    #[serde(with = "hex::serde")]
    pub prev_hash: Hash,
    #[serde(with = "hex::serde")]
    pub hash: Hash,
    #[serde(with = "hex::serde")]
    pub merkle_root: Hash,
    pub timestamp: i64,
    pub nonce: u64,
    pub transactions: Vec<Transaction>,
}

/// Projection of a block without its transactions; enough to verify chain
/// continuity and proof of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub id: i64,
    #[serde(with = "hex::serde")]
    pub prev_hash: Hash,
    #[serde(with = "hex::serde")]
    pub hash: Hash,
    #[serde(with = "hex::serde")]
    pub merkle_root: Hash,
    pub timestamp: i64,
    pub nonce: u64,
}

fn record_hash(id: i64, prev_hash: &Hash, merkle_root: &Hash, timestamp: i64, nonce: u64) -> Hash {
    let record = format!(
        "{}-{}-{}-{}-{}",
        id,
        hex::encode(prev_hash),
        hex::encode(merkle_root),
        timestamp,
        nonce
    );
    Sha256::digest(record.as_bytes()).into()
}

fn meets_difficulty(hash: &Hash, difficulty: usize) -> bool {
    hex::encode(hash).starts_with(&"0".repeat(difficulty))
}

impl Block {
    /// Builds an unmined block: Merkle root computed, hash of nonce 0 filled
    /// in, ready for the nonce search.
    pub fn new(id: i64, prev_hash: Hash, transactions: Vec<Transaction>) -> Self {
        let merkle_root = Self::compute_merkle_root(&transactions);
        let timestamp = now_millis();
        let mut block = Block {
            id,
            prev_hash,
            hash: [0u8; 32],
            merkle_root,
            timestamp,
            nonce: 0,
            transactions,
        };
        block.hash = block.compute_hash();
        block
    }

    /// The first block: empty transaction list, all-zero previous hash, and
    /// the fixed genesis timestamp. Genesis is exempt from the difficulty
    /// check.
    pub fn genesis() -> Self {
        let mut block = Block {
            id: 0,
            prev_hash: [0u8; 32],
            hash: [0u8; 32],
            merkle_root: Self::compute_merkle_root(&[]),
            timestamp: GENESIS_TIMESTAMP,
            nonce: 0,
            transactions: Vec::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    pub fn compute_hash(&self) -> Hash {
        record_hash(
            self.id,
            &self.prev_hash,
            &self.merkle_root,
            self.timestamp,
            self.nonce,
        )
    }

    pub fn is_valid_hash(&self, difficulty: usize) -> bool {
        meets_difficulty(&self.hash, difficulty)
    }

    /// Merkle root over per-transaction leaf strings. Coinbase leaves commit
    /// to the timestamp, other leaves to the signature; an odd level
    /// duplicates its last leaf.
    pub fn compute_merkle_root(transactions: &[Transaction]) -> Hash {
        if transactions.is_empty() {
            return Sha256::digest([]).into();
        }

        let mut level: Vec<Hash> = transactions
            .iter()
            .map(|tx| {
                let leaf = if tx.is_coinbase {
                    format!(
                        "{}-{}-{}-{}-{}",
                        tx.from, tx.to, tx.amount, tx.timestamp, tx.is_coinbase
                    )
                } else {
                    format!(
                        "{}-{}-{}-{}-{}-{}",
                        tx.from,
                        tx.to,
                        tx.amount,
                        hex::encode(&tx.signature),
                        tx.timestamp,
                        tx.is_coinbase
                    )
                };
                Sha256::digest(leaf.as_bytes()).into()
            })
            .collect();

        while level.len() > 1 {
            if level.len() % 2 == 1 {
                level.push(*level.last().expect("level is non-empty"));
            }

            level = level
                .chunks(2)
                .map(|pair| {
                    let mut hasher = Sha256::new();
                    hasher.update(pair[0]);
                    hasher.update(pair[1]);
                    hasher.finalize().into()
                })
                .collect();
        }

        level[0]
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            id: self.id,
            prev_hash: self.prev_hash,
            hash: self.hash,
            merkle_root: self.merkle_root,
            timestamp: self.timestamp,
            nonce: self.nonce,
        }
    }
}

impl BlockHeader {
    pub fn compute_hash(&self) -> Hash {
        record_hash(
            self.id,
            &self.prev_hash,
            &self.merkle_root,
            self.timestamp,
            self.nonce,
        )
    }

    pub fn is_valid_hash(&self, difficulty: usize) -> bool {
        meets_difficulty(&self.hash, difficulty)
    }
}

/// Verifies a full header chain as received from a peer: genesis anchoring,
/// per-header hash integrity, difficulty, and prev-hash linkage.
pub fn verify_header_chain(headers: &[BlockHeader], difficulty: usize) -> Result<()> {
    for (idx, header) in headers.iter().enumerate() {
        if header.id != idx as i64 {
            return Err(ChainError::InvalidBlock(format!(
                "Header id {} does not match position {}",
                header.id, idx
            )));
        }

        if header.compute_hash() != header.hash {
            return Err(ChainError::InvalidBlock(format!(
                "Header {} hash does not match its contents",
                header.id
            )));
        }

        if header.timestamp <= 0 {
            return Err(ChainError::InvalidBlock(format!(
                "Header {} has a non-positive timestamp",
                header.id
            )));
        }

        if header.id == 0 {
            if header.prev_hash != [0u8; 32] {
                return Err(ChainError::InvalidBlock(
                    "Genesis header must have an all-zero previous hash".to_string(),
                ));
            }
            continue;
        }

        if !header.is_valid_hash(difficulty) {
            return Err(ChainError::InvalidProofOfWork);
        }

        if header.prev_hash != headers[idx - 1].hash {
            return Err(ChainError::InvalidBlockLinkage);
        }
    }

    Ok(())
}
