//! Error types for the blockindex pipeline.

use thiserror::Error;

/// Errors that can occur while fetching, storing, or indexing blocks.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Storage error: {0}")]
    Storage(String),

    /// A stored or received payload could not be decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid index rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("Invalid index name '{0}': only ASCII letters, digits and '_' are allowed")]
    InvalidIndexName(String),

    #[error("Index '{0}' already exists with a different definition")]
    IndexExists(String),

    /// An index entry does not match the layout its descriptor declares.
    #[error("Corrupt entry in table '{table}': {reason}")]
    Corrupt { table: String, reason: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The block source claims to be caught up with the chain but lacks a block.
    #[error("Chained block not found in store (height = {height}). Re-create the block store.")]
    StoreInconsistent { height: u32 },

    #[error("Block source error: {0}")]
    Source(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if retrying cannot help and the store must be rebuilt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreInconsistent { .. } | Self::Corrupt { .. })
    }

    /// Returns `true` if the error was caused by cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<bitcoin::consensus::encode::Error> for IndexerError {
    fn from(e: bitcoin::consensus::encode::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(IndexerError::StoreInconsistent { height: 7 }.is_fatal());
        assert!(!IndexerError::Cancelled.is_fatal());
        assert!(IndexerError::Cancelled.is_cancelled());
    }

    #[test]
    fn store_inconsistent_names_height() {
        let msg = IndexerError::StoreInconsistent { height: 1234 }.to_string();
        assert!(msg.contains("height = 1234"));
    }
}
