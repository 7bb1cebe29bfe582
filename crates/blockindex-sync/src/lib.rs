//! Checkpoint-driven block replay for blockindex.
//!
//! [`BlockFetcher`] walks a [`ChainView`](blockindex_core::ChainView) from the
//! fork point of a [`Checkpoint`](blockindex_core::Checkpoint) and pulls full
//! blocks from a [`BlockSource`] in batches.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blockindex_core::{MemoryChain, MemoryCheckpointStore, Network, StoredCheckpoint};
//! use blockindex_sync::{BlockFetcher, FetcherBuilder, MemoryBlockSource};
//!
//! # async fn run() -> Result<(), blockindex_core::IndexerError> {
//! let chain = Arc::new(MemoryChain::for_network(Network::Regtest));
//! let checkpoint = StoredCheckpoint::load(
//!     "blocks",
//!     Box::new(MemoryCheckpointStore::new()),
//!     chain.clone(),
//! )
//! .await?;
//!
//! let mut fetcher = BlockFetcher::new(
//!     Arc::new(checkpoint),
//!     Arc::new(MemoryBlockSource::new()),
//!     chain,
//!     None,
//! )
//! .with_config(FetcherBuilder::new().batch_size(50).build_config());
//!
//! while let Some(info) = fetcher.next_block().await? {
//!     println!("{} {}", info.height, info.block_hash);
//!     fetcher.save_checkpoint().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod fetcher;
pub mod progress;
pub mod source;

pub use config::{FetcherBuilder, FetcherConfig, DEFAULT_NEED_SAVE_INTERVAL};
pub use fetcher::{BlockFetcher, BlockInfo};
pub use progress::{Progress, ProgressLog};
pub use source::{BlockSource, MemoryBlockSource};
