//! Where the fetcher gets full blocks for chain headers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use blockindex_core::{Block, BlockHash, IndexerError};

/// Trait for fetching full blocks from a block store.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch the blocks for `hashes`, in order. Absent blocks are `None`.
    ///
    /// Implementations check `cancel` between batches of work; an in-flight
    /// fetch is never interrupted.
    async fn get_blocks(
        &self,
        hashes: &[BlockHash],
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<Block>>, IndexerError>;

    /// The most recent block the source holds, if any.
    async fn get_store_tip(&self) -> Result<Option<Block>, IndexerError>;
}

// ─── In-memory source (for testing) ───────────────────────────────────────────

/// In-memory block source. The most recently inserted block is the store tip
/// unless [`MemoryBlockSource::set_tip`] says otherwise.
#[derive(Default)]
pub struct MemoryBlockSource {
    blocks: Mutex<HashMap<BlockHash, Block>>,
    tip: Mutex<Option<BlockHash>>,
    calls: AtomicUsize,
}

impl MemoryBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, block: Block) {
        let hash = block.block_hash();
        lock(&self.blocks).insert(hash, block);
        *lock(&self.tip) = Some(hash);
    }

    pub fn set_tip(&self, hash: Option<BlockHash>) {
        *lock(&self.tip) = hash;
    }

    /// Number of `get_blocks` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl BlockSource for MemoryBlockSource {
    async fn get_blocks(
        &self,
        hashes: &[BlockHash],
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<Block>>, IndexerError> {
        if cancel.is_cancelled() {
            return Err(IndexerError::Cancelled);
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        let blocks = lock(&self.blocks);
        Ok(hashes.iter().map(|h| blocks.get(h).cloned()).collect())
    }

    async fn get_store_tip(&self) -> Result<Option<Block>, IndexerError> {
        let tip = *lock(&self.tip);
        Ok(tip.and_then(|h| lock(&self.blocks).get(&h).cloned()))
    }
}
