//! Chain management: the append-only block sequence and account balances
//!
//! The [`Chain`] mirrors the persisted block prefix in memory. Writes go
//! through the state store first, inside a caller-provided transaction;
//! only after a successful commit does a block become visible in memory.

use crate::block::{Block, BlockHeader, Hash, DEFAULT_DIFFICULTY};
use crate::error::{ChainError, Result};
use crate::mempool::Mempool;
use crate::persistence::Database;
use crate::transaction::Transaction;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

pub struct Chain {
    store: Arc<Database>,
    mempool: Arc<Mempool>,
    blocks: RwLock<Vec<Block>>,
    difficulty: usize,
}

impl Chain {
    pub fn new(store: Arc<Database>, mempool: Arc<Mempool>, difficulty: usize) -> Self {
        Chain {
            store,
            mempool,
            blocks: RwLock::new(Vec::new()),
            difficulty: if difficulty == 0 { DEFAULT_DIFFICULTY } else { difficulty },
        }
    }

    pub fn store(&self) -> &Arc<Database> {
        &self.store
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    /// Loads and verifies the persisted chain into memory. An empty store
    /// gets a fresh genesis; a store that fails verification is wiped and
    /// restarted empty with a new genesis.
    pub fn load_from_store(&self) -> Result<()> {
        if self.store.count_blocks()? == 0 {
            return self.create_genesis();
        }

        let blocks = self.store.list_blocks()?;
        match self.verify_sequence(&blocks) {
            Ok(()) => {
                info!(height = blocks.len(), "loaded chain from store");
                let mut mem = self.blocks.write().expect("chain lock poisoned");
                *mem = blocks;
                Ok(())
            }
            Err(e) => {
                warn!("stored chain failed verification ({}); wiping and starting fresh", e);
                self.store.clear_all()?;
                {
                    let mut mem = self.blocks.write().expect("chain lock poisoned");
                    mem.clear();
                }
                self.create_genesis()
            }
        }
    }

    fn create_genesis(&self) -> Result<()> {
        let genesis = Block::genesis();
        self.store.with_tx(|tx| self.add_block(tx, &genesis))?;
        self.add_block_to_memory(genesis);
        info!("created genesis block");
        Ok(())
    }

    /// Administrative wipe: clears the store and in-memory state, then
    /// recreates genesis so the node stays usable.
    pub fn reset(&self) -> Result<()> {
        self.store.clear_all()?;
        {
            let mut mem = self.blocks.write().expect("chain lock poisoned");
            mem.clear();
        }
        self.mempool.clear();
        self.create_genesis()
    }

    fn verify_sequence(&self, blocks: &[Block]) -> Result<()> {
        for (idx, block) in blocks.iter().enumerate() {
            if block.id != idx as i64 {
                return Err(ChainError::InvalidBlock(format!(
                    "Block id {} at position {}",
                    block.id, idx
                )));
            }

            if block.compute_hash() != block.hash {
                return Err(ChainError::InvalidBlock(format!(
                    "Block {} hash does not match its contents",
                    block.id
                )));
            }

            if Block::compute_merkle_root(&block.transactions) != block.merkle_root {
                return Err(ChainError::InvalidMerkleRoot);
            }

            if block.id == 0 {
                if block.prev_hash != [0u8; 32] {
                    return Err(ChainError::InvalidBlockLinkage);
                }
                continue;
            }

            if !block.is_valid_hash(self.difficulty) {
                return Err(ChainError::InvalidProofOfWork);
            }

            if block.prev_hash != blocks[idx - 1].hash {
                return Err(ChainError::InvalidBlockLinkage);
            }
        }
        Ok(())
    }

    /// Effective balance: store-confirmed balance minus pending outgoing
    /// (amount + fee) still sitting in the mempool, floored at zero.
    pub fn get_balance(&self, address: &str) -> Result<u64> {
        let confirmed = self.store.get_confirmed_balance(address)?;

        let pending_out: u64 = self
            .mempool
            .snapshot()
            .values()
            .filter(|tx| !tx.is_coinbase && tx.from == address)
            .map(|tx| tx.amount + tx.fee)
            .sum();

        Ok(confirmed.saturating_sub(pending_out))
    }

    /// Coinbase transactions are always valid; everything else must be
    /// covered by the sender's effective balance.
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<bool> {
        if tx.is_coinbase {
            return Ok(true);
        }
        Ok(self.get_balance(&tx.from)? >= tx.amount + tx.fee)
    }

    /// Applies a block's balance effects inside the given store transaction:
    /// each coinbase collects the block's fees on top of its amount, each
    /// transfer debits sender by amount + fee and credits the recipient.
    pub fn apply_block_balances(
        &self,
        sql_tx: &rusqlite::Transaction,
        txs: &[Transaction],
    ) -> Result<()> {
        let total_fees: u64 = txs.iter().filter(|t| !t.is_coinbase).map(|t| t.fee).sum();

        for tx in txs {
            if tx.is_coinbase {
                self.store
                    .increase_balance(sql_tx, &tx.to, tx.amount + total_fees)?;
            } else {
                self.store.decrease_balance(sql_tx, &tx.from, tx.amount + tx.fee)?;
                if !tx.to.is_empty() {
                    self.store.increase_balance(sql_tx, &tx.to, tx.amount)?;
                }
            }
        }

        Ok(())
    }

    /// Persists block + transactions + balance effects inside the caller's
    /// store transaction. The in-memory append happens separately, after
    /// the caller commits.
    pub fn add_block(&self, sql_tx: &rusqlite::Transaction, block: &Block) -> Result<()> {
        let rowid = self.store.insert_block(sql_tx, block)?;
        for tx in &block.transactions {
            self.store.insert_tx(sql_tx, rowid, tx)?;
        }
        self.apply_block_balances(sql_tx, &block.transactions)
    }

    /// Appends to the in-memory sequence; refuses duplicates by id.
    /// Returns whether the block was appended.
    pub fn add_block_to_memory(&self, block: Block) -> bool {
        let mut mem = self.blocks.write().expect("chain lock poisoned");
        if mem.iter().any(|b| b.id == block.id) {
            return false;
        }
        mem.push(block);
        true
    }

    /// Whether the block is acceptable relative to the committed chain:
    /// hash integrity, Merkle root, difficulty (genesis exempt), timestamp,
    /// and prev-hash continuity against the stored predecessor.
    pub fn verify_block(&self, block: &Block) -> Result<()> {
        if block.compute_hash() != block.hash {
            return Err(ChainError::InvalidBlock(
                "Hash does not match block contents".to_string(),
            ));
        }

        if Block::compute_merkle_root(&block.transactions) != block.merkle_root {
            return Err(ChainError::InvalidMerkleRoot);
        }

        if block.timestamp <= 0 {
            return Err(ChainError::InvalidBlock(
                "Non-positive timestamp".to_string(),
            ));
        }

        if block.id == 0 {
            return Ok(());
        }

        if !block.is_valid_hash(self.difficulty) {
            return Err(ChainError::InvalidProofOfWork);
        }

        let prev = self
            .store
            .get_block_by_id(block.id - 1)?
            .ok_or(ChainError::BlockNotFound(block.id - 1))?;

        if prev.hash != block.prev_hash {
            return Err(ChainError::InvalidBlockLinkage);
        }

        Ok(())
    }

    pub fn get_block_by_id(&self, id: i64) -> Result<Option<Block>> {
        self.store.get_block_by_id(id)
    }

    /// Snapshot of the in-memory chain.
    pub fn blocks(&self) -> Vec<Block> {
        self.blocks.read().expect("chain lock poisoned").clone()
    }

    pub fn headers(&self) -> Vec<BlockHeader> {
        self.blocks
            .read()
            .expect("chain lock poisoned")
            .iter()
            .map(|b| b.header())
            .collect()
    }

    pub fn height(&self) -> usize {
        self.blocks.read().expect("chain lock poisoned").len()
    }

    /// Current tip id and hash. The chain always holds at least genesis
    /// after `load_from_store`.
    pub fn tip(&self) -> Option<(i64, Hash)> {
        let mem = self.blocks.read().expect("chain lock poisoned");
        mem.last().map(|b| (b.id, b.hash))
    }

    /// Ids present in memory, for computing what a header set is missing.
    pub fn known_ids(&self) -> Vec<i64> {
        self.blocks
            .read()
            .expect("chain lock poisoned")
            .iter()
            .map(|b| b.id)
            .collect()
    }
}
