//! Transaction mempool
//!
//! A capacity-bounded pool of pending transactions keyed by canonical hash.
//! Capacity is advisory: callers consult `will_exceed_capacity` before
//! inserting, while the P2P merge path intentionally skips the check so a
//! received pool can over-fill temporarily instead of being evicted.

use crate::transaction::Transaction;
use std::collections::HashMap;
use std::sync::RwLock;

/// Default capacity in bytes (1 MiB).
pub const DEFAULT_MAX_CAPACITY: usize = 1_048_576;

/// Baseline fee per transaction byte at low congestion.
pub const BASE_FEE: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Congestion {
    Low,
    Medium,
    High,
}

impl Congestion {
    pub fn multiplier(&self) -> u64 {
        match self {
            Congestion::Low => 1,
            Congestion::Medium => 2,
            Congestion::High => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Congestion::Low => "low",
            Congestion::Medium => "medium",
            Congestion::High => "high",
        }
    }
}

#[derive(Debug)]
pub struct Mempool {
    transactions: RwLock<HashMap<String, Transaction>>,
    max_capacity: usize,
}

impl Mempool {
    /// A zero capacity falls back to the 1 MiB default.
    pub fn new(max_capacity: usize) -> Self {
        let max_capacity = if max_capacity == 0 {
            DEFAULT_MAX_CAPACITY
        } else {
            max_capacity
        };
        Mempool {
            transactions: RwLock::new(HashMap::new()),
            max_capacity,
        }
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Keyed by canonical hash; re-inserting an existing transaction is a
    /// no-op, so duplicates arriving over P2P are harmless.
    pub fn add_transaction(&self, tx: Transaction) {
        let mut pool = self.transactions.write().expect("mempool lock poisoned");
        pool.entry(tx.hash_hex()).or_insert(tx);
    }

    pub fn remove_transaction(&self, hash: &str) {
        let mut pool = self.transactions.write().expect("mempool lock poisoned");
        pool.remove(hash);
    }

    /// Drops every non-coinbase entry of a mined block from the pool.
    /// Coinbases never enter the mempool, so they are skipped.
    pub fn delete_mined(&self, block_txs: &[Transaction]) {
        let mut pool = self.transactions.write().expect("mempool lock poisoned");
        for tx in block_txs {
            if tx.is_coinbase {
                continue;
            }
            pool.remove(&tx.hash_hex());
        }
    }

    pub fn get(&self, hash: &str) -> Option<Transaction> {
        let pool = self.transactions.read().expect("mempool lock poisoned");
        pool.get(hash).cloned()
    }

    /// Deep-copy snapshot of the pool.
    pub fn snapshot(&self) -> HashMap<String, Transaction> {
        let pool = self.transactions.read().expect("mempool lock poisoned");
        pool.clone()
    }

    /// Transactions sorted by fee descending; ties break on the hash key so
    /// the order is stable within a call.
    pub fn transactions_by_fee(&self) -> Vec<Transaction> {
        let pool = self.transactions.read().expect("mempool lock poisoned");
        let mut entries: Vec<(&String, &Transaction)> = pool.iter().collect();
        entries.sort_by(|(ha, a), (hb, b)| b.fee.cmp(&a.fee).then_with(|| ha.cmp(hb)));
        entries.into_iter().map(|(_, tx)| tx.clone()).collect()
    }

    pub fn current_size(&self) -> usize {
        let pool = self.transactions.read().expect("mempool lock poisoned");
        pool.values().map(|tx| tx.size()).sum()
    }

    /// True iff inserting `tx` would push the pool past its capacity.
    /// Already-present transactions never exceed (insertion is a no-op).
    pub fn will_exceed_capacity(&self, tx: &Transaction) -> bool {
        let pool = self.transactions.read().expect("mempool lock poisoned");
        if pool.contains_key(&tx.hash_hex()) {
            return false;
        }
        let current: usize = pool.values().map(|t| t.size()).sum();
        current + tx.size() > self.max_capacity
    }

    pub fn congestion_level(&self) -> Congestion {
        let ratio = self.current_size() as f64 / self.max_capacity as f64;
        if ratio < 0.25 {
            Congestion::Low
        } else if ratio < 0.75 {
            Congestion::Medium
        } else {
            Congestion::High
        }
    }

    /// Fee per byte at the current congestion level.
    pub fn fee_rate(&self) -> u64 {
        BASE_FEE * self.congestion_level().multiplier()
    }

    /// Congestion-priced fee for a transaction of `size` bytes, floored at 1.
    pub fn fee_for_size(&self, size: usize) -> u64 {
        (self.fee_rate() * size as u64).max(1)
    }

    /// Merges a peer's mempool snapshot. An empty snapshot means the peer
    /// emptied its pool after mining, so ours is cleared to match; otherwise
    /// only hashes we do not already hold are inserted.
    pub fn merge(&self, other: HashMap<String, Transaction>) {
        let mut pool = self.transactions.write().expect("mempool lock poisoned");
        if other.is_empty() {
            pool.clear();
            return;
        }
        for (hash, tx) in other {
            pool.entry(hash).or_insert(tx);
        }
    }

    pub fn clear(&self) {
        let mut pool = self.transactions.write().expect("mempool lock poisoned");
        pool.clear();
    }

    pub fn len(&self) -> usize {
        let pool = self.transactions.read().expect("mempool lock poisoned");
        pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::now_millis;

    fn tx(from: &str, to: &str, amount: u64, fee: u64) -> Transaction {
        let mut t = Transaction::new(from, to, amount, now_millis());
        t.fee = fee;
        t
    }

    #[test]
    fn test_add_and_get() {
        let mempool = Mempool::new(0);
        let t = tx("alice", "bob", 100, 2);
        let hash = t.hash_hex();

        mempool.add_transaction(t.clone());

        assert_eq!(mempool.len(), 1);
        assert_eq!(mempool.get(&hash), Some(t));
        assert_eq!(mempool.max_capacity(), DEFAULT_MAX_CAPACITY);
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mempool = Mempool::new(0);
        let t = tx("alice", "bob", 100, 2);

        mempool.add_transaction(t.clone());
        mempool.add_transaction(t);

        assert_eq!(mempool.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mempool = Mempool::new(0);
        let t = tx("alice", "bob", 100, 2);
        let hash = t.hash_hex();

        mempool.add_transaction(t);
        mempool.remove_transaction(&hash);

        assert!(mempool.is_empty());
    }

    #[test]
    fn test_delete_mined_skips_coinbase() {
        let mempool = Mempool::new(0);
        let t1 = tx("alice", "bob", 100, 2);
        let t2 = tx("bob", "carol", 50, 1);
        mempool.add_transaction(t1.clone());
        mempool.add_transaction(t2.clone());

        let coinbase = Transaction::coinbase("miner", 50);
        mempool.delete_mined(&[coinbase, t1, t2]);

        assert!(mempool.is_empty());
    }

    #[test]
    fn test_capacity_predicate() {
        let t1 = tx("alice", "bob", 100, 2);
        let t2 = tx("bob", "carol", 50, 1);
        let t3 = tx("carol", "dave", 25, 1);

        let mempool = Mempool::new(t1.size() + t2.size() + 5);

        assert!(!mempool.will_exceed_capacity(&t1));
        mempool.add_transaction(t1.clone());
        assert!(!mempool.will_exceed_capacity(&t2));
        mempool.add_transaction(t2);

        assert!(mempool.will_exceed_capacity(&t3));
        // Already-present transactions never report exceeding
        assert!(!mempool.will_exceed_capacity(&t1));
        assert!(mempool.current_size() <= mempool.max_capacity());
    }

    #[test]
    fn test_congestion_levels() {
        let t = tx("alice", "bob", 100, 1);
        let size = t.size();

        let low = Mempool::new(size * 10);
        low.add_transaction(t.clone());
        assert_eq!(low.congestion_level(), Congestion::Low);
        assert_eq!(low.fee_rate(), BASE_FEE);

        let medium = Mempool::new(size * 2);
        medium.add_transaction(t.clone());
        assert_eq!(medium.congestion_level(), Congestion::Medium);
        assert_eq!(medium.fee_rate(), BASE_FEE * 2);

        let high = Mempool::new(size + 1);
        high.add_transaction(t);
        assert_eq!(high.congestion_level(), Congestion::High);
        assert_eq!(high.fee_rate(), BASE_FEE * 4);
    }

    #[test]
    fn test_fee_floor() {
        let mempool = Mempool::new(0);
        assert_eq!(mempool.fee_for_size(0), 1);
        assert!(mempool.fee_for_size(250) >= 250);
    }

    #[test]
    fn test_selection_sorted_by_fee_descending() {
        let mempool = Mempool::new(0);
        mempool.add_transaction(tx("alice", "bob", 100, 1));
        mempool.add_transaction(tx("bob", "carol", 100, 9));
        mempool.add_transaction(tx("carol", "dave", 100, 4));

        let fees: Vec<u64> = mempool
            .transactions_by_fee()
            .iter()
            .map(|t| t.fee)
            .collect();
        assert_eq!(fees, vec![9, 4, 1]);
    }

    #[test]
    fn test_merge_inserts_missing_only() {
        let mempool = Mempool::new(0);
        let t1 = tx("alice", "bob", 100, 2);
        mempool.add_transaction(t1.clone());

        let other = Mempool::new(0);
        other.add_transaction(t1);
        other.add_transaction(tx("bob", "carol", 50, 1));

        mempool.merge(other.snapshot());
        assert_eq!(mempool.len(), 2);
    }

    #[test]
    fn test_merge_empty_clears() {
        let mempool = Mempool::new(0);
        mempool.add_transaction(tx("alice", "bob", 100, 2));

        mempool.merge(HashMap::new());
        assert!(mempool.is_empty());
    }

    #[test]
    fn test_snapshot_is_deep_copy() {
        let mempool = Mempool::new(0);
        mempool.add_transaction(tx("alice", "bob", 100, 2));

        let snapshot = mempool.snapshot();
        mempool.clear();

        assert_eq!(snapshot.len(), 1);
        assert!(mempool.is_empty());
    }
}
