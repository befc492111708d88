//! Signed value-transfer transactions
//!
//! The canonical hash is SHA-256 over the transaction's canonical JSON with
//! the signature cleared and the public key kept; the same bytes are signed.
//! Field order is fixed by the struct declaration, so the encoding is
//! deterministic across nodes.

use crate::crypto::{self, KeyPair};
use crate::error::{ChainError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fee carried by every coinbase transaction.
pub const COINBASE_TX_FEE: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
        }
    }
}

/// A value transfer. Immutable once signed; the only post-creation state is
/// its presence in the mempool or a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender address; empty for coinbase.
    #[serde(default)]
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub fee: u64,
    /// Milliseconds since epoch, UTC.
    pub timestamp: i64,
    /// Sender's public key, hex-encoded; empty for coinbase.
    #[serde(default)]
    pub public_key: String,
    /// Ed25519 signature; empty until signed, always empty for coinbase.
    #[serde(default, with = "hex::serde")]
    pub signature: Vec<u8>,
    pub status: TxStatus,
    pub is_coinbase: bool,
}

/// Current time in UTC unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Transaction {
    pub fn new(from: &str, to: &str, amount: u64, timestamp: i64) -> Self {
        Transaction {
            from: from.to_string(),
            to: to.to_string(),
            amount,
            fee: 0,
            timestamp,
            public_key: String::new(),
            signature: Vec::new(),
            status: TxStatus::Pending,
            is_coinbase: false,
        }
    }

    /// Mints the block reward for a miner. No sender, no signature, zero fee.
    pub fn coinbase(miner_address: &str, mining_reward: u64) -> Self {
        Transaction {
            from: String::new(),
            to: miner_address.to_string(),
            amount: mining_reward,
            fee: COINBASE_TX_FEE,
            timestamp: now_millis(),
            public_key: String::new(),
            signature: Vec::new(),
            status: TxStatus::Confirmed,
            is_coinbase: true,
        }
    }

    /// Canonical hash: the signature field is cleared, the public key is
    /// kept, everything else is hashed as-is.
    pub fn hash(&self) -> [u8; 32] {
        let mut copy = self.clone();
        copy.signature = Vec::new();

        // Struct-order serde_json output is the pinned canonical encoding.
        let data = serde_json::to_vec(&copy).expect("transaction serialization is infallible");
        Sha256::digest(&data).into()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }

    /// Signs the canonical hash. Sets the public key before hashing so the
    /// signed bytes commit to it.
    pub fn sign(&mut self, keypair: &KeyPair) {
        self.public_key = keypair.public_key_hex();
        let hash = self.hash();
        self.signature = keypair.sign(&hash);
    }

    pub fn sign_with_hex_keys(&mut self, private_hex: &str, public_hex: &str) -> Result<()> {
        let keypair = KeyPair::from_hex(private_hex, public_hex)?;
        self.sign(&keypair);
        Ok(())
    }

    /// True iff the signature and public key are present, the sender address
    /// is derived from the public key, and the signature verifies over the
    /// canonical hash.
    pub fn verify(&self) -> bool {
        if self.signature.is_empty() || self.public_key.is_empty() {
            return false;
        }

        match crypto::derive_address(&self.public_key) {
            Ok(addr) if addr == self.from => {}
            _ => return false,
        }

        let hash = self.hash();
        crypto::verify_signature(&self.public_key, &hash, &self.signature).is_ok()
    }

    /// Byte size used for mempool capacity accounting: length-prefixed
    /// variable fields (4-byte prefix), fixed 8-byte numerics, one byte for
    /// the coinbase flag.
    pub fn size(&self) -> usize {
        const PREFIX: usize = 4;

        PREFIX + self.from.len()
            + PREFIX + self.to.len()
            + PREFIX + self.public_key.len()
            + 8 // amount
            + 8 // timestamp
            + PREFIX + self.signature.len()
            + 8 // fee
            + PREFIX + self.status.as_str().len()
            + 1 // is_coinbase
    }

    /// Rejects structurally invalid transactions at the boundary before any
    /// signature or balance work.
    pub fn check_well_formed(&self) -> Result<()> {
        if self.is_coinbase {
            return Ok(());
        }
        if self.amount == 0 {
            return Err(ChainError::InvalidTransaction(
                "Amount must be greater than zero".to_string(),
            ));
        }
        if self.public_key.is_empty() {
            return Err(ChainError::InvalidTransaction(
                "Missing public key".to_string(),
            ));
        }
        if crypto::derive_address(&self.public_key)? != self.from {
            return Err(ChainError::InvalidTransaction(
                "Sender address does not match the public key".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_transfer(keypair: &KeyPair, to: &str, amount: u64) -> Transaction {
        let mut tx = Transaction::new(&keypair.address(), to, amount, now_millis());
        tx.sign(keypair);
        tx
    }

    #[test]
    fn test_hash_excludes_signature() {
        let keypair = KeyPair::generate();
        let mut tx = Transaction::new(&keypair.address(), "bob", 100, 1_700_000_000_000);
        tx.public_key = keypair.public_key_hex();

        let before = tx.hash();
        tx.signature = keypair.sign(&before);
        let after = tx.hash();

        assert_eq!(before, after);
    }

    #[test]
    fn test_hash_includes_public_key() {
        let keypair = KeyPair::generate();
        let mut tx = Transaction::new(&keypair.address(), "bob", 100, 1_700_000_000_000);

        let without_key = tx.hash();
        tx.public_key = keypair.public_key_hex();
        let with_key = tx.hash();

        assert_ne!(without_key, with_key);
    }

    #[test]
    fn test_sign_then_verify() {
        let keypair = KeyPair::generate();
        let tx = signed_transfer(&keypair, "bob", 200);
        assert!(tx.verify());
    }

    #[test]
    fn test_verify_rejects_wrong_sender() {
        let keypair = KeyPair::generate();
        let mut tx = Transaction::new("somebody-else", "bob", 200, now_millis());
        tx.sign(&keypair);
        assert!(!tx.verify());
    }

    #[test]
    fn test_verify_rejects_unsigned() {
        let keypair = KeyPair::generate();
        let tx = Transaction::new(&keypair.address(), "bob", 200, now_millis());
        assert!(!tx.verify());
    }

    #[test]
    fn test_verify_rejects_tampered_amount() {
        let keypair = KeyPair::generate();
        let mut tx = signed_transfer(&keypair, "bob", 200);
        tx.amount = 9_999;
        assert!(!tx.verify());
    }

    #[test]
    fn test_coinbase_shape() {
        let tx = Transaction::coinbase("miner", 50);
        assert!(tx.is_coinbase);
        assert!(tx.from.is_empty());
        assert!(tx.signature.is_empty());
        assert_eq!(tx.fee, COINBASE_TX_FEE);
        assert_eq!(tx.amount, 50);
        assert_eq!(tx.status, TxStatus::Confirmed);
        assert!(tx.timestamp > 0);
    }

    #[test]
    fn test_size_accounting() {
        let tx = Transaction::new("alice", "bob", 100, now_millis());
        // 4 length prefixes for strings + signature prefix, three 8-byte
        // numerics, status "pending", coinbase flag.
        let expected = (4 + 5) + (4 + 3) + (4 + 0) + 8 + 8 + (4 + 0) + 8 + (4 + 7) + 1;
        assert_eq!(tx.size(), expected);
    }

    #[test]
    fn test_size_grows_with_signature() {
        let keypair = KeyPair::generate();
        let mut tx = Transaction::new(&keypair.address(), "bob", 100, now_millis());
        let unsigned = tx.size();
        tx.sign(&keypair);
        // 64-byte signature + 64-hex-char public key
        assert_eq!(tx.size(), unsigned + 64 + 64);
    }

    #[test]
    fn test_serde_round_trip_preserves_hash() {
        let keypair = KeyPair::generate();
        let tx = signed_transfer(&keypair, "bob", 300);

        let encoded = serde_json::to_string(&tx).unwrap();
        let decoded: Transaction = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.hash(), tx.hash());
        assert!(decoded.verify());
    }

    #[test]
    fn test_check_well_formed_rejects_zero_amount() {
        let keypair = KeyPair::generate();
        let mut tx = Transaction::new(&keypair.address(), "bob", 0, now_millis());
        tx.sign(&keypair);
        assert!(tx.check_well_formed().is_err());
    }
}
