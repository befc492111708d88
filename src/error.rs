//! Error types for Emberchain

use std::fmt;

#[derive(Debug)]
pub enum ChainError {
    InvalidBlock(String),
    InvalidBlockLinkage,
    InvalidProofOfWork,
    InvalidMerkleRoot,
    InvalidTransaction(String),
    InsufficientBalance(String),
    CryptoError(String),
    DatabaseError(String),
    NetworkError(String),
    BlockAlreadyExists,
    BlockNotFound(i64),
    MempoolFull,
    IoError(String),
    SerializationError(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::InvalidBlock(msg) => write!(f, "Invalid block: {}", msg),
            ChainError::InvalidBlockLinkage => write!(f, "Invalid block linkage"),
            ChainError::InvalidProofOfWork => write!(f, "Invalid proof of work"),
            ChainError::InvalidMerkleRoot => write!(f, "Invalid Merkle root"),
            ChainError::InvalidTransaction(msg) => write!(f, "Invalid transaction: {}", msg),
            ChainError::InsufficientBalance(addr) => {
                write!(f, "Insufficient balance for address {}", addr)
            }
            ChainError::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            ChainError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            ChainError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            ChainError::BlockAlreadyExists => write!(f, "Block already exists"),
            ChainError::BlockNotFound(id) => write!(f, "Block {} not found", id),
            ChainError::MempoolFull => write!(f, "Mempool is full"),
            ChainError::IoError(msg) => write!(f, "IO error: {}", msg),
            ChainError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        // A UNIQUE violation on blocks.block_height means the block id is
        // already committed; callers treat that as "already present".
        if let rusqlite::Error::SqliteFailure(e, _) = &err {
            if e.code == rusqlite::ErrorCode::ConstraintViolation {
                return ChainError::BlockAlreadyExists;
            }
        }
        ChainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<hex::FromHexError> for ChainError {
    fn from(err: hex::FromHexError) -> Self {
        ChainError::CryptoError(format!("Invalid hex: {}", err))
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
