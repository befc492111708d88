//! Proof-of-work mining
//!
//! A single cancellable mining round: assemble a candidate from the mempool
//! and the current tip, search for a nonce, then commit. The cancel channel
//! is polled on every hash iteration, so cancellation latency is bounded by
//! one hash. Signals coalesce; draining a stale signal is harmless.

use crate::block::Block;
use crate::blockchain::Chain;
use crate::error::{ChainError, Result};
use crate::transaction::Transaction;
use tokio::sync::mpsc;
use tracing::info;

/// Amount minted by every block's coinbase.
pub const MINING_REWARD: u64 = 50;

/// Iterations between cooperative yields back to the runtime.
const YIELD_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum MineOutcome {
    /// A block was found and committed; the caller broadcasts it and
    /// signals cancel-mining to peers.
    Mined(Block),
    /// A cancellation signal drained the round before a nonce was found.
    Cancelled,
    /// Someone else's block took the tip first; the candidate was discarded.
    Stale,
}

/// Runs one mining round against the current tip.
pub async fn mine_one(
    chain: &Chain,
    miner_address: &str,
    cancel: &mut mpsc::Receiver<bool>,
) -> Result<MineOutcome> {
    let mut transactions = vec![Transaction::coinbase(miner_address, MINING_REWARD)];
    transactions.extend(chain.mempool().transactions_by_fee());

    let (tip_id, tip_hash) = chain
        .tip()
        .ok_or_else(|| ChainError::InvalidBlock("Cannot mine on an empty chain".to_string()))?;

    let mut block = Block::new(tip_id + 1, tip_hash, transactions);

    let mut iterations: u64 = 0;
    loop {
        if cancel.try_recv().is_ok() {
            info!("mining cancelled at nonce {}", block.nonce);
            return Ok(MineOutcome::Cancelled);
        }

        block.merkle_root = Block::compute_merkle_root(&block.transactions);
        block.hash = block.compute_hash();
        if block.is_valid_hash(chain.difficulty()) {
            break;
        }
        block.nonce += 1;

        iterations += 1;
        if iterations % YIELD_INTERVAL == 0 {
            tokio::task::yield_now().await;
        }
    }

    // The tip may have moved while we searched; a diverged tip means the
    // candidate links to a block that is no longer the end of the chain.
    let (_, latest_hash) = chain
        .tip()
        .ok_or_else(|| ChainError::InvalidBlock("Chain emptied during mining".to_string()))?;
    if latest_hash != block.prev_hash {
        info!("discarding candidate block {}: tip moved during mining", block.id);
        return Ok(MineOutcome::Stale);
    }

    match chain.store().with_tx(|sql_tx| chain.add_block(sql_tx, &block)) {
        Ok(()) => {}
        Err(ChainError::BlockAlreadyExists) => return Ok(MineOutcome::Stale),
        Err(e) => return Err(e),
    }

    chain.add_block_to_memory(block.clone());
    chain.mempool().delete_mined(&block.transactions);

    info!(id = block.id, hash = %hex::encode(block.hash), "mined a block");
    Ok(MineOutcome::Mined(block))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::mempool::Mempool;
    use crate::persistence::Database;
    use crate::transaction::now_millis;
    use std::sync::Arc;

    fn test_chain() -> Chain {
        let store = Arc::new(Database::open(":memory:").unwrap());
        let chain = Chain::new(store, Arc::new(Mempool::new(0)), 1);
        chain.load_from_store().unwrap();
        chain
    }

    #[tokio::test]
    async fn test_mine_with_empty_mempool() {
        let chain = test_chain();
        let (_cancel_tx, mut cancel_rx) = mpsc::channel(1);

        let outcome = mine_one(&chain, "miner", &mut cancel_rx).await.unwrap();

        let block = match outcome {
            MineOutcome::Mined(block) => block,
            other => panic!("expected a mined block, got {:?}", other),
        };

        assert_eq!(block.id, 1);
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_coinbase);
        assert!(block.is_valid_hash(chain.difficulty()));
        assert!(chain.verify_block(&block).is_ok());

        assert_eq!(chain.height(), 2);
        assert_eq!(chain.store().count_blocks().unwrap(), 2);
        assert_eq!(
            chain.store().get_confirmed_balance("miner").unwrap(),
            MINING_REWARD
        );
    }

    #[tokio::test]
    async fn test_mined_block_drains_mempool_and_pays_fees() {
        let chain = test_chain();

        let keypair = KeyPair::generate();
        let addr = keypair.address();
        chain
            .store()
            .with_tx(|tx| chain.store().increase_balance(tx, &addr, 1000))
            .unwrap();

        let mut transfer = Transaction::new(&addr, "bob", 200, now_millis());
        transfer.fee = 5;
        transfer.sign(&keypair);
        chain.mempool().add_transaction(transfer.clone());

        let (_cancel_tx, mut cancel_rx) = mpsc::channel(1);
        let outcome = mine_one(&chain, "miner", &mut cancel_rx).await.unwrap();

        let block = match outcome {
            MineOutcome::Mined(block) => block,
            other => panic!("expected a mined block, got {:?}", other),
        };

        assert_eq!(block.transactions.len(), 2);
        assert!(block.transactions[0].is_coinbase);
        assert_eq!(block.transactions[1].hash(), transfer.hash());

        assert!(chain.mempool().is_empty());
        assert_eq!(
            chain.store().get_confirmed_balance("miner").unwrap(),
            MINING_REWARD + 5
        );
        assert_eq!(chain.store().get_confirmed_balance("bob").unwrap(), 200);
        assert_eq!(chain.store().get_confirmed_balance(&addr).unwrap(), 795);
    }

    #[tokio::test]
    async fn test_pre_signalled_cancel_drains_round() {
        let chain = test_chain();
        let (cancel_tx, mut cancel_rx) = mpsc::channel(1);

        cancel_tx.send(true).await.unwrap();
        let outcome = mine_one(&chain, "miner", &mut cancel_rx).await.unwrap();

        assert_eq!(outcome, MineOutcome::Cancelled);
        assert_eq!(chain.height(), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let chain = test_chain();
        let (cancel_tx, mut cancel_rx) = mpsc::channel(4);

        // Coalesced signals: the first drains a round, the rest drain later
        // rounds harmlessly.
        cancel_tx.send(true).await.unwrap();
        cancel_tx.send(true).await.unwrap();

        assert_eq!(
            mine_one(&chain, "miner", &mut cancel_rx).await.unwrap(),
            MineOutcome::Cancelled
        );
        assert_eq!(
            mine_one(&chain, "miner", &mut cancel_rx).await.unwrap(),
            MineOutcome::Cancelled
        );

        // Channel drained; the next round mines normally
        let outcome = mine_one(&chain, "miner", &mut cancel_rx).await.unwrap();
        assert!(matches!(outcome, MineOutcome::Mined(_)));
    }

    #[tokio::test]
    async fn test_duplicate_commit_reports_stale() {
        let chain = test_chain();
        let (_cancel_tx, mut cancel_rx) = mpsc::channel(1);

        let outcome = mine_one(&chain, "miner", &mut cancel_rx).await.unwrap();
        let block = match outcome {
            MineOutcome::Mined(block) => block,
            other => panic!("expected a mined block, got {:?}", other),
        };

        // A racing miner committing the same id hits the UNIQUE constraint
        let err = chain
            .store()
            .with_tx(|sql_tx| chain.add_block(sql_tx, &block))
            .unwrap_err();
        assert!(matches!(err, ChainError::BlockAlreadyExists));
    }
}
