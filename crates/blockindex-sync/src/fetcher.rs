//! Block fetcher: replays a chain view against a block source.
//!
//! The fetcher resolves the fork point between the checkpoint's locator and
//! the chain view, then walks the headers after it, pulling full blocks from
//! the block source in batches:
//!
//! ```text
//! checkpoint locator ──find_fork──► fork ──enumerate_after──► headers
//!                                                          │ (batched)
//!                                 BlockSource::get_blocks ◄┘
//!                                          │
//!                                          ▼
//!                                  BlockInfo { height, hash, block }
//! ```
//!
//! A missing block ends the replay. If the source's own tip is at least as
//! recent as the missing header the store is corrupt and the fetcher fails;
//! otherwise the store is just behind and the sequence ends cleanly so the
//! caller can resume later from the same checkpoint.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use blockindex_core::{Block, BlockHash, ChainView, ChainedHeader, Checkpoint, IndexerError};

use crate::config::FetcherConfig;
use crate::progress::ProgressLog;
use crate::source::BlockSource;

/// One replayed block.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub height: u32,
    pub block_hash: BlockHash,
    pub block: Block,
}

/// Enumeration state, created on the first `next_block` call.
struct Replay {
    /// Headers not yet requested from the source.
    pending: VecDeque<ChainedHeader>,
    /// Headers whose blocks were fetched but not yet yielded.
    fetched: VecDeque<(ChainedHeader, Option<Block>)>,
    done: bool,
}

/// Checkpoint-aware, pull-based block replay.
///
/// Single consumer: `next_block` and the checkpoint helpers take `&mut self`,
/// so progress state is never observed half-updated.
pub struct BlockFetcher {
    checkpoint: Arc<dyn Checkpoint>,
    source: Arc<dyn BlockSource>,
    chain: Arc<dyn ChainView>,
    config: FetcherConfig,
    cancel: CancellationToken,
    last_processed: Option<ChainedHeader>,
    last_saved: DateTime<Utc>,
    replay: Option<Replay>,
    progress: ProgressLog,
}

impl BlockFetcher {
    pub fn new(
        checkpoint: Arc<dyn Checkpoint>,
        source: Arc<dyn BlockSource>,
        chain: Arc<dyn ChainView>,
        last_processed: Option<ChainedHeader>,
    ) -> Self {
        Self {
            checkpoint,
            source,
            chain,
            config: FetcherConfig::default(),
            cancel: CancellationToken::new(),
            last_processed,
            last_saved: Utc::now(),
            replay: None,
            progress: ProgressLog::default(),
        }
    }

    pub fn with_config(mut self, config: FetcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn checkpoint(&self) -> &Arc<dyn Checkpoint> {
        &self.checkpoint
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Adjust heights or the save interval; takes effect on the next replay.
    pub fn config_mut(&mut self) -> &mut FetcherConfig {
        &mut self.config
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The header of the last block yielded (or skipped to).
    pub fn last_processed(&self) -> Option<&ChainedHeader> {
        self.last_processed.as_ref()
    }

    /// Highest height this replay will reach.
    pub fn target_height(&self) -> u32 {
        self.config.to_height_or_max().min(self.chain.tip().height)
    }

    /// Forget the enumeration so the next call re-resolves the fork point.
    pub fn rewind(&mut self) {
        self.replay = None;
    }

    /// Pull the next block. `Ok(None)` ends the sequence.
    pub async fn next_block(&mut self) -> Result<Option<BlockInfo>, IndexerError> {
        let mut replay = match self.replay.take() {
            Some(replay) => replay,
            None => self.start(),
        };
        let result = self.advance(&mut replay).await;
        if result.is_err() {
            replay.done = true;
        }
        self.replay = Some(replay);
        result
    }

    fn start(&self) -> Replay {
        let fork = self.chain.find_fork(&self.checkpoint.block_locator());
        let from = self.config.from_height;
        let to = self.config.to_height_or_max();
        let mut pending: VecDeque<ChainedHeader> = self
            .chain
            .enumerate_after(&fork)
            .into_iter()
            .filter(|h| h.height >= from)
            .take_while(|h| h.height <= to)
            .collect();

        // Keep numbering contiguous with genesis: replay the fork header too.
        if pending.front().map(|h| h.height) == Some(1) && fork.height >= from {
            pending.push_front(fork);
        }

        debug!(
            checkpoint = %self.checkpoint.name(),
            fork_height = fork.height,
            headers = pending.len(),
            "Replay started"
        );
        Replay {
            pending,
            fetched: VecDeque::new(),
            done: false,
        }
    }

    async fn advance(&mut self, replay: &mut Replay) -> Result<Option<BlockInfo>, IndexerError> {
        if replay.done {
            return Ok(None);
        }

        if replay.fetched.is_empty() {
            if replay.pending.is_empty() {
                replay.done = true;
                return Ok(None);
            }
            if self.cancel.is_cancelled() {
                return Err(IndexerError::Cancelled);
            }
            let n = self.config.batch_size.max(1).min(replay.pending.len());
            let batch: Vec<ChainedHeader> = replay.pending.drain(..n).collect();
            let hashes: Vec<BlockHash> = batch.iter().map(|h| h.hash).collect();
            let mut blocks = self.source.get_blocks(&hashes, &self.cancel).await?.into_iter();
            for header in batch {
                replay.fetched.push_back((header, blocks.next().flatten()));
            }
        }

        let Some((header, block)) = replay.fetched.pop_front() else {
            replay.done = true;
            return Ok(None);
        };

        let Some(block) = block else {
            replay.done = true;
            if let Some(store_tip) = self.source.get_store_tip().await? {
                // Store is caught up with the chain but the block is missing.
                if header.time() <= store_tip.header.time {
                    return Err(IndexerError::StoreInconsistent {
                        height: header.height,
                    });
                }
            }
            warn!(
                height = header.height,
                hash = %header.hash,
                "Block store is behind the chain, stopping replay"
            );
            return Ok(None);
        };

        self.last_processed = Some(header);
        let target = self.target_height();
        self.progress.record(header.height, target);

        Ok(Some(BlockInfo {
            height: header.height,
            block_hash: header.hash,
            block,
        }))
    }

    /// Returns `true` once more than `need_save_interval` passed since the last save.
    pub fn need_save(&self) -> bool {
        let elapsed = (Utc::now() - self.last_saved).to_std().unwrap_or_default();
        elapsed > self.config.need_save_interval
    }

    /// Persist `last_processed` through the checkpoint if a save is due.
    ///
    /// Returns whether the save path ran.
    pub async fn save_checkpoint(&mut self) -> Result<bool, IndexerError> {
        if !self.need_save() {
            return Ok(false);
        }
        if let Some(header) = &self.last_processed {
            self.checkpoint.save_progress(header).await?;
            info!(
                checkpoint = %self.checkpoint.name(),
                height = header.height,
                hash = %header.hash,
                "Checkpoint saved"
            );
        }
        self.last_saved = Utc::now();
        Ok(true)
    }

    /// Mark the chain tip (bounded by `to_height`) as processed without
    /// fetching anything.
    pub fn skip_to_end(&mut self) {
        let height = self.target_height();
        self.last_processed = self.chain.header_at(height);
        info!(height, "Skipped to the end");
    }
}
