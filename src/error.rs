//! Error types for the branch store.

use crate::types::{BlockId, BranchId, Hash};
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parent branch not found: {0}")]
    ParentNotFound(BranchId),

    #[error("Branch not found: {0}")]
    BranchNotFound(BranchId),

    #[error("Branch is protected: {0}")]
    ProtectedBranch(BranchId),

    #[error("Cannot merge branch into itself: {0}")]
    SelfMergeRejected(BranchId),

    #[error("Branch name already in use: {0}")]
    BranchExists(String),

    #[error("Branch is no longer active: {0}")]
    BranchNotActive(BranchId),

    #[error("Block not found: {0}")]
    BlockNotFound(BlockId),

    #[error("Invalid write on table {table}: {reason}")]
    InvalidWrite { table: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Hash mismatch for block {block}: expected {expected}, got {got}")]
    HashMismatch {
        block: BlockId,
        expected: Hash,
        got: Hash,
    },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Store already exists at {0}")]
    AlreadyInitialized(std::path::PathBuf),
}

impl StoreError {
    pub(crate) fn invalid_write(table: &str, reason: impl Into<String>) -> Self {
        StoreError::InvalidWrite {
            table: table.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
