//! Error types for StrandDB

use crate::types::{LogicAddr, Timestamp};
use thiserror::Error;

/// Result type alias for StrandDB operations
pub type Result<T> = std::result::Result<T, StrandError>;

/// StrandDB error types
#[derive(Error, Debug)]
pub enum StrandError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Block missing from the store (never written, or evicted)
    #[error("Block {0} not found")]
    BlockNotFound(LogicAddr),

    /// Timestamp older than the last stored one
    #[error("Out-of-order timestamp: {got} is older than {last}")]
    OutOfOrderTimestamp { last: Timestamp, got: Timestamp },

    /// Write attempted on a closed tree
    #[error("Tree is closed")]
    TreeClosed,

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrandError {
    /// Check if error indicates on-disk corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StrandError::Corruption(_)
                | StrandError::ChecksumMismatch { .. }
                | StrandError::BlockNotFound(_)
        )
    }
}
