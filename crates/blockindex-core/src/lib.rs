//! Shared foundation of the blockindex store and its chain replay.
//!
//! # Architecture
//!
//! ```text
//! ChainView + Checkpoint ──► BlockFetcher (blockindex-sync)
//!                                 │  BlockInfo { height, hash, block }
//!                                 ▼
//!                          IndexRepository (blockindex-storage)
//!                                 ├── Block / Transaction / Common tables
//!                                 └── Index_<Name> tables (dynamic indexes)
//! ```
//!
//! This crate holds what both sides share: the block model (re-exported from
//! `bitcoin`, see [`block`]), the chain view abstraction, checkpoints and
//! [`IndexerError`].

pub mod block;
pub mod chain;
pub mod checkpoint;
pub mod error;

pub use block::{Block, BlockHash, Network, OutPoint, Transaction, TxIn, TxOut, Txid};
pub use chain::{BlockLocator, ChainView, ChainedHeader, MemoryChain};
pub use checkpoint::{
    Checkpoint, CheckpointRecord, CheckpointStore, MemoryCheckpointStore, StoredCheckpoint,
};
pub use error::IndexerError;
