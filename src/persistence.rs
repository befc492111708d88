//! SQLite persistence layer
//!
//! The state store owns four tables: `blocks`, `transactions`, `balances`,
//! and `peers`. `blocks.block_height` carries the chain-visible block id and
//! is UNIQUE; the row primary key is a surrogate. All mutations run inside
//! short-lived transactions obtained through [`Database::with_tx`], which
//! rolls back on any early return.

use crate::block::{Block, Hash};
use crate::error::{ChainError, Result};
use crate::transaction::{Transaction, TxStatus};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

pub struct Database {
    conn: Mutex<Connection>,
}

fn decode_hash(hex_str: &str) -> Result<Hash> {
    let bytes = hex::decode(hex_str)?;
    bytes
        .try_into()
        .map_err(|_| ChainError::DatabaseError("Stored hash is not 32 bytes".to_string()))
}

fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<(Transaction, String)> {
    let sender: Option<String> = row.get(0)?;
    let to: String = row.get(1)?;
    let amount: i64 = row.get(2)?;
    let fee: i64 = row.get(3)?;
    let timestamp: i64 = row.get(4)?;
    let public_key: Option<String> = row.get(5)?;
    let signature: Option<String> = row.get(6)?;
    let status: String = row.get(7)?;
    let is_coinbase: bool = row.get(8)?;

    let tx = Transaction {
        from: sender.unwrap_or_default(),
        to,
        amount: amount as u64,
        fee: fee as u64,
        timestamp,
        public_key: public_key.unwrap_or_default(),
        signature: Vec::new(),
        status: if status == "confirmed" {
            TxStatus::Confirmed
        } else {
            TxStatus::Pending
        },
        is_coinbase,
    };

    Ok((tx, signature.unwrap_or_default()))
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blocks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                prev_hash TEXT NOT NULL,
                hash TEXT NOT NULL,
                merkle_root TEXT NOT NULL,
                nonce INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                block_height INTEGER NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                block_id INTEGER NOT NULL REFERENCES blocks(id),
                sender TEXT,
                recipient TEXT NOT NULL,
                amount INTEGER NOT NULL,
                fee INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                public_key TEXT,
                signature TEXT,
                status TEXT NOT NULL,
                is_coinbase INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS balances (
                address TEXT PRIMARY KEY,
                balance INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS peers (
                tcp_address TEXT PRIMARY KEY
            );",
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to run migrations: {}", e)))?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    pub fn version(&self) -> Result<String> {
        let conn = self.lock()?;
        let version: String = conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
        Ok(version)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }

    /// Runs `f` inside a store transaction. Commit happens only when `f`
    /// returns Ok; any error path rolls the transaction back on drop.
    pub fn with_tx<T>(&self, f: impl FnOnce(&rusqlite::Transaction) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Inserts the block row and returns its surrogate rowid. A UNIQUE
    /// violation on `block_height` surfaces as `BlockAlreadyExists`.
    pub fn insert_block(&self, tx: &rusqlite::Transaction, block: &Block) -> Result<i64> {
        tx.execute(
            "INSERT INTO blocks(prev_hash, hash, merkle_root, nonce, timestamp, block_height)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                hex::encode(block.prev_hash),
                hex::encode(block.hash),
                hex::encode(block.merkle_root),
                block.nonce as i64,
                block.timestamp,
                block.id,
            ],
        )?;
        Ok(tx.last_insert_rowid())
    }

    /// Inserts one transaction row bound to a block's surrogate rowid.
    /// Empty sender/public key/signature are stored as NULL.
    pub fn insert_tx(
        &self,
        tx: &rusqlite::Transaction,
        block_rowid: i64,
        t: &Transaction,
    ) -> Result<()> {
        let sender = if t.from.is_empty() { None } else { Some(t.from.as_str()) };
        let public_key = if t.public_key.is_empty() {
            None
        } else {
            Some(t.public_key.as_str())
        };
        let signature = if t.signature.is_empty() {
            None
        } else {
            Some(hex::encode(&t.signature))
        };

        tx.execute(
            "INSERT INTO transactions(block_id, sender, recipient, amount, fee, timestamp,
                                      public_key, signature, status, is_coinbase)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                block_rowid,
                sender,
                t.to,
                t.amount as i64,
                t.fee as i64,
                t.timestamp,
                public_key,
                signature,
                t.status.as_str(),
                t.is_coinbase,
            ],
        )?;
        Ok(())
    }

    fn load_txs_for_rowid(&self, conn: &Connection, block_rowid: i64) -> Result<Vec<Transaction>> {
        let mut stmt = conn.prepare(
            "SELECT sender, recipient, amount, fee, timestamp, public_key, signature, status,
                    is_coinbase
             FROM transactions WHERE block_id = ?1 ORDER BY id",
        )?;

        let rows = stmt.query_map([block_rowid], row_to_transaction)?;

        let mut txs = Vec::new();
        for row in rows {
            let (mut tx, signature_hex) = row?;
            if !signature_hex.is_empty() {
                tx.signature = hex::decode(&signature_hex)?;
            }
            txs.push(tx);
        }
        Ok(txs)
    }

    fn block_from_row(row: &rusqlite::Row) -> rusqlite::Result<(i64, String, String, String, i64, i64, i64)> {
        Ok((
            row.get(0)?, // rowid
            row.get(1)?, // prev_hash
            row.get(2)?, // hash
            row.get(3)?, // merkle_root
            row.get(4)?, // nonce
            row.get(5)?, // timestamp
            row.get(6)?, // block_height
        ))
    }

    fn assemble_block(
        &self,
        conn: &Connection,
        parts: (i64, String, String, String, i64, i64, i64),
    ) -> Result<Block> {
        let (rowid, prev_hash, hash, merkle_root, nonce, timestamp, height) = parts;
        Ok(Block {
            id: height,
            prev_hash: decode_hash(&prev_hash)?,
            hash: decode_hash(&hash)?,
            merkle_root: decode_hash(&merkle_root)?,
            timestamp,
            nonce: nonce as u64,
            transactions: self.load_txs_for_rowid(conn, rowid)?,
        })
    }

    /// All blocks with their transactions, ordered by height ascending.
    pub fn list_blocks(&self) -> Result<Vec<Block>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, prev_hash, hash, merkle_root, nonce, timestamp, block_height
             FROM blocks ORDER BY block_height",
        )?;

        let rows: Vec<_> = stmt
            .query_map([], Self::block_from_row)?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        rows.into_iter()
            .map(|parts| self.assemble_block(&conn, parts))
            .collect()
    }

    /// One block by chain id, `None` when absent.
    pub fn get_block_by_id(&self, block_id: i64) -> Result<Option<Block>> {
        let conn = self.lock()?;
        let parts = conn
            .query_row(
                "SELECT id, prev_hash, hash, merkle_root, nonce, timestamp, block_height
                 FROM blocks WHERE block_height = ?1",
                [block_id],
                Self::block_from_row,
            )
            .optional()?;

        match parts {
            Some(parts) => Ok(Some(self.assemble_block(&conn, parts)?)),
            None => Ok(None),
        }
    }

    pub fn count_blocks(&self) -> Result<i64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Zero for unknown addresses.
    pub fn get_confirmed_balance(&self, address: &str) -> Result<u64> {
        let conn = self.lock()?;
        let balance: Option<i64> = conn
            .query_row(
                "SELECT balance FROM balances WHERE address = ?1",
                [address],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance.unwrap_or(0) as u64)
    }

    /// Upsert: balance := balance + amount.
    pub fn increase_balance(
        &self,
        tx: &rusqlite::Transaction,
        address: &str,
        amount: u64,
    ) -> Result<()> {
        tx.execute(
            "INSERT INTO balances(address, balance) VALUES (?1, ?2)
             ON CONFLICT (address) DO UPDATE SET balance = balance + excluded.balance",
            params![address, amount as i64],
        )?;
        Ok(())
    }

    /// Fails fast when the stored balance is absent or below `amount`,
    /// aborting the enclosing store transaction.
    pub fn decrease_balance(
        &self,
        tx: &rusqlite::Transaction,
        address: &str,
        amount: u64,
    ) -> Result<()> {
        let current: Option<i64> = tx
            .query_row(
                "SELECT balance FROM balances WHERE address = ?1",
                [address],
                |row| row.get(0),
            )
            .optional()?;

        let current = current.ok_or_else(|| ChainError::InsufficientBalance(address.to_string()))?;
        if (current as u64) < amount {
            return Err(ChainError::InsufficientBalance(address.to_string()));
        }

        tx.execute(
            "UPDATE balances SET balance = balance - ?1 WHERE address = ?2",
            params![amount as i64, address],
        )?;
        Ok(())
    }

    /// Idempotent on duplicates.
    pub fn insert_peer(&self, tx: &rusqlite::Transaction, tcp_address: &str) -> Result<()> {
        tx.execute(
            "INSERT OR IGNORE INTO peers(tcp_address) VALUES (?1)",
            [tcp_address],
        )?;
        Ok(())
    }

    pub fn list_peers(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT tcp_address FROM peers")?;
        let peers = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(peers)
    }

    /// Wipes balances, transactions, and blocks. Peers survive so a node can
    /// rejoin the network it knew after a corrupt-chain recovery.
    pub fn clear_all(&self) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM balances", [])?;
            tx.execute("DELETE FROM transactions", [])?;
            tx.execute("DELETE FROM blocks", [])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::now_millis;

    fn open_memory() -> Database {
        Database::open(":memory:").unwrap()
    }

    #[test]
    fn test_open_and_version() {
        let db = open_memory();
        assert!(!db.version().unwrap().is_empty());
        assert_eq!(db.count_blocks().unwrap(), 0);
    }

    #[test]
    fn test_block_round_trip() {
        let db = open_memory();
        let mut tx1 = Transaction::new("alice", "bob", 100, now_millis());
        tx1.fee = 3;
        tx1.signature = vec![7u8; 64];
        tx1.public_key = "ab".repeat(32);
        let coinbase = Transaction::coinbase("miner", 50);

        let block = Block::new(0, [0u8; 32], vec![coinbase, tx1]);

        db.with_tx(|sql_tx| {
            let rowid = db.insert_block(sql_tx, &block)?;
            for t in &block.transactions {
                db.insert_tx(sql_tx, rowid, t)?;
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(db.count_blocks().unwrap(), 1);

        let loaded = db.get_block_by_id(0).unwrap().unwrap();
        assert_eq!(loaded, block);

        let all = db.list_blocks().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], block);
    }

    #[test]
    fn test_get_block_by_id_not_found() {
        let db = open_memory();
        assert!(db.get_block_by_id(42).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_block_height_is_unique_violation() {
        let db = open_memory();
        let block = Block::genesis();

        db.with_tx(|tx| db.insert_block(tx, &block).map(|_| ())).unwrap();
        let err = db
            .with_tx(|tx| db.insert_block(tx, &block).map(|_| ()))
            .unwrap_err();

        assert!(matches!(err, ChainError::BlockAlreadyExists));
        assert_eq!(db.count_blocks().unwrap(), 1);
    }

    #[test]
    fn test_balance_upsert_and_decrease() {
        let db = open_memory();

        db.with_tx(|tx| db.increase_balance(tx, "alice", 100)).unwrap();
        db.with_tx(|tx| db.increase_balance(tx, "alice", 50)).unwrap();
        assert_eq!(db.get_confirmed_balance("alice").unwrap(), 150);

        db.with_tx(|tx| db.decrease_balance(tx, "alice", 120)).unwrap();
        assert_eq!(db.get_confirmed_balance("alice").unwrap(), 30);
    }

    #[test]
    fn test_decrease_insufficient_fails_and_rolls_back() {
        let db = open_memory();
        db.with_tx(|tx| db.increase_balance(tx, "alice", 10)).unwrap();

        // Both ops run in one transaction; the failing debit must undo the credit.
        let err = db
            .with_tx(|tx| {
                db.increase_balance(tx, "bob", 5)?;
                db.decrease_balance(tx, "alice", 100)
            })
            .unwrap_err();

        assert!(matches!(err, ChainError::InsufficientBalance(_)));
        assert_eq!(db.get_confirmed_balance("alice").unwrap(), 10);
        assert_eq!(db.get_confirmed_balance("bob").unwrap(), 0);
    }

    #[test]
    fn test_decrease_unknown_address_fails() {
        let db = open_memory();
        let err = db
            .with_tx(|tx| db.decrease_balance(tx, "ghost", 1))
            .unwrap_err();
        assert!(matches!(err, ChainError::InsufficientBalance(_)));
    }

    #[test]
    fn test_unknown_balance_is_zero() {
        let db = open_memory();
        assert_eq!(db.get_confirmed_balance("nobody").unwrap(), 0);
    }

    #[test]
    fn test_peers_deduplicated() {
        let db = open_memory();
        db.with_tx(|tx| {
            db.insert_peer(tx, "127.0.0.1:8080")?;
            db.insert_peer(tx, "127.0.0.1:8080")?;
            db.insert_peer(tx, "127.0.0.1:9090")
        })
        .unwrap();

        let mut peers = db.list_peers().unwrap();
        peers.sort();
        assert_eq!(peers, vec!["127.0.0.1:8080", "127.0.0.1:9090"]);
    }

    #[test]
    fn test_clear_all_keeps_peers() {
        let db = open_memory();
        db.with_tx(|tx| {
            db.insert_block(tx, &Block::genesis())?;
            db.increase_balance(tx, "alice", 100)?;
            db.insert_peer(tx, "127.0.0.1:8080")
        })
        .unwrap();

        db.clear_all().unwrap();

        assert_eq!(db.count_blocks().unwrap(), 0);
        assert_eq!(db.get_confirmed_balance("alice").unwrap(), 0);
        assert_eq!(db.list_peers().unwrap().len(), 1);
    }
}
