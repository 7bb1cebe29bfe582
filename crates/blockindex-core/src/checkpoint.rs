//! Checkpoints: persisted chain positions for crash recovery.
//!
//! A checkpoint stores a block locator for the last processed header. On
//! restart the fetcher resolves the fork point between that locator and the
//! current chain view and resumes right after it, so a reorg while the
//! indexer was down is handled the same way as a clean restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chain::{BlockLocator, ChainView, ChainedHeader};
use crate::error::IndexerError;
use crate::block::BlockHash;

/// A named, persisted chain position.
#[async_trait]
pub trait Checkpoint: Send + Sync {
    /// Unique checkpoint name (e.g. `"blocks"`, `"transactions"`).
    fn name(&self) -> &str;

    /// Locator of the last saved position; empty when nothing was saved yet.
    fn block_locator(&self) -> BlockLocator;

    /// Persist `header` as the new position.
    async fn save_progress(&self, header: &ChainedHeader) -> Result<(), IndexerError>;
}

// ─── Records and stores ───────────────────────────────────────────────────────

/// What a [`CheckpointStore`] persists for one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub name: String,
    /// Height of the last processed header.
    pub height: u32,
    /// Hash of the last processed header.
    pub block_hash: BlockHash,
    pub locator: BlockLocator,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

/// Backend that loads and saves [`CheckpointRecord`]s by name.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<CheckpointRecord>, IndexerError>;

    /// Save (upsert) a record.
    async fn save(&self, record: CheckpointRecord) -> Result<(), IndexerError>;

    /// Delete a record (e.g. when resetting an indexer).
    async fn delete(&self, name: &str) -> Result<(), IndexerError>;
}

// ─── StoredCheckpoint ─────────────────────────────────────────────────────────

/// [`Checkpoint`] backed by a [`CheckpointStore`].
///
/// The chain view is used to compute the locator of each saved header; the
/// most recent locator is cached so `block_locator` stays synchronous.
pub struct StoredCheckpoint {
    name: String,
    store: Box<dyn CheckpointStore>,
    chain: Arc<dyn ChainView>,
    current: Mutex<Option<CheckpointRecord>>,
}

impl StoredCheckpoint {
    /// Load checkpoint `name` from `store` (a missing record starts at genesis).
    pub async fn load(
        name: impl Into<String>,
        store: Box<dyn CheckpointStore>,
        chain: Arc<dyn ChainView>,
    ) -> Result<Self, IndexerError> {
        let name = name.into();
        let current = store.load(&name).await?;
        if let Some(record) = &current {
            debug!(checkpoint = %name, height = record.height, "checkpoint loaded");
        }
        Ok(Self {
            name,
            store,
            chain,
            current: Mutex::new(current),
        })
    }

    /// The last saved record, if any.
    pub fn record(&self) -> Option<CheckpointRecord> {
        self.lock().clone()
    }

    /// Forget the saved position so the next run starts from genesis.
    pub async fn reset(&self) -> Result<(), IndexerError> {
        self.store.delete(&self.name).await?;
        *self.lock() = None;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<CheckpointRecord>> {
        // A poisoned lock only means another thread panicked mid-assignment
        // of a plain value; the data is still usable.
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Checkpoint for StoredCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_locator(&self) -> BlockLocator {
        self.lock()
            .as_ref()
            .map(|r| r.locator.clone())
            .unwrap_or_default()
    }

    async fn save_progress(&self, header: &ChainedHeader) -> Result<(), IndexerError> {
        let record = CheckpointRecord {
            name: self.name.clone(),
            height: header.height,
            block_hash: header.hash,
            locator: self.chain.locator(header),
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.store.save(record.clone()).await?;
        debug!(checkpoint = %self.name, height = header.height, "checkpoint saved");
        *self.lock() = Some(record);
        Ok(())
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory checkpoint store for tests and ephemeral indexers.
#[derive(Default, Clone)]
pub struct MemoryCheckpointStore {
    data: Arc<Mutex<HashMap<String, CheckpointRecord>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> std::sync::MutexGuard<'_, HashMap<String, CheckpointRecord>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, name: &str) -> Result<Option<CheckpointRecord>, IndexerError> {
        Ok(self.data().get(name).cloned())
    }

    async fn save(&self, record: CheckpointRecord) -> Result<(), IndexerError> {
        self.data().insert(record.name.clone(), record);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), IndexerError> {
        self.data().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{build_block, Network};
    use crate::chain::MemoryChain;

    fn chain_of(len: u32) -> Arc<MemoryChain> {
        let mut chain = MemoryChain::for_network(Network::Regtest);
        for i in 0..len {
            let tip = chain.tip();
            chain
                .push(build_block(tip.hash, tip.time() + 600, i, vec![]).header)
                .unwrap();
        }
        Arc::new(chain)
    }

    #[tokio::test]
    async fn fresh_checkpoint_has_empty_locator() {
        let cp = StoredCheckpoint::load("blocks", Box::new(MemoryCheckpointStore::new()), chain_of(3))
            .await
            .unwrap();
        assert!(cp.block_locator().is_empty());
        assert!(cp.record().is_none());
        assert_eq!(cp.name(), "blocks");
    }

    #[tokio::test]
    async fn save_then_reload() {
        let store = MemoryCheckpointStore::new();
        let chain = chain_of(5);
        let cp = StoredCheckpoint::load("blocks", Box::new(store.clone()), chain.clone())
            .await
            .unwrap();

        let header = chain.header_at(4).unwrap();
        cp.save_progress(&header).await.unwrap();
        assert_eq!(cp.block_locator().hashes()[0], header.hash);

        // A second instance over the same store sees the saved position.
        let reloaded = StoredCheckpoint::load("blocks", Box::new(store), chain.clone())
            .await
            .unwrap();
        let record = reloaded.record().unwrap();
        assert_eq!(record.height, 4);
        assert_eq!(record.block_hash, header.hash);
        assert_eq!(chain.find_fork(&reloaded.block_locator()).height, 4);
    }

    #[tokio::test]
    async fn reset_forgets_position() {
        let store = MemoryCheckpointStore::new();
        let chain = chain_of(2);
        let cp = StoredCheckpoint::load("blocks", Box::new(store.clone()), chain.clone())
            .await
            .unwrap();
        cp.save_progress(&chain.tip()).await.unwrap();
        cp.reset().await.unwrap();
        assert!(cp.block_locator().is_empty());
        assert!(store.load("blocks").await.unwrap().is_none());
    }
}
