//! Checkpoints persisted next to the indexed data.
//!
//! [`SqliteCheckpointStore`] keeps one row per checkpoint name in the
//! `checkpoints` table of `index.db`, so a restarted indexer resumes from
//! the same database it writes blocks to.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::debug;

use blockindex_core::{BlockHash, BlockLocator, CheckpointRecord, CheckpointStore, IndexerError};

fn storage(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// SQLite-backed [`CheckpointStore`].
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Wrap `pool` and create the `checkpoints` table if it is missing.
    pub async fn new(pool: SqlitePool) -> Result<Self, IndexerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                name       TEXT    PRIMARY KEY,
                height     INTEGER NOT NULL,
                block_hash TEXT    NOT NULL,
                locator    TEXT    NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(storage)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, name: &str) -> Result<Option<CheckpointRecord>, IndexerError> {
        let row = sqlx::query(
            "SELECT name, height, block_hash, locator, updated_at
             FROM checkpoints WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let height: i64 = row.try_get("height").map_err(storage)?;
        let block_hash: String = row.try_get("block_hash").map_err(storage)?;
        let locator: String = row.try_get("locator").map_err(storage)?;
        Ok(Some(CheckpointRecord {
            name: row.try_get("name").map_err(storage)?,
            height: u32::try_from(height).map_err(|_| {
                IndexerError::Checkpoint(format!("checkpoint '{name}' has height {height}"))
            })?,
            block_hash: block_hash.parse::<BlockHash>().map_err(|e| {
                IndexerError::Checkpoint(format!("checkpoint '{name}' has bad hash: {e}"))
            })?,
            locator: serde_json::from_str::<BlockLocator>(&locator)?,
            updated_at: row.try_get("updated_at").map_err(storage)?,
        }))
    }

    async fn save(&self, record: CheckpointRecord) -> Result<(), IndexerError> {
        let locator = serde_json::to_string(&record.locator)?;
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints
             (name, height, block_hash, locator, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.name)
        .bind(record.height as i64)
        .bind(record.block_hash.to_string())
        .bind(locator)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        debug!(checkpoint = %record.name, height = record.height, "checkpoint row written");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM checkpoints WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::repository::{IndexRepository, RepositoryConfig};
    use blockindex_core::block::build_block;
    use blockindex_core::{ChainView, Checkpoint, MemoryChain, Network, StoredCheckpoint};

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

    async fn open(dir: &std::path::Path) -> IndexRepository {
        IndexRepository::open(RepositoryConfig {
            data_dir: dir.join("store"),
            network: Network::Regtest,
            ..RepositoryConfig::default()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open(dir.path()).await;
        let store = repo.checkpoint_store().await.unwrap();
        assert!(store.load("blocks").await.unwrap().is_none());
        store.delete("blocks").await.unwrap();
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open(dir.path()).await;
        let chain = chain_of(4);
        let cp = StoredCheckpoint::load(
            "blocks",
            Box::new(repo.checkpoint_store().await.unwrap()),
            chain.clone(),
        )
        .await
        .unwrap();
        cp.save_progress(&chain.header_at(2).unwrap()).await.unwrap();
        cp.save_progress(&chain.header_at(4).unwrap()).await.unwrap();

        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM checkpoints")
            .fetch_one(repo.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("cnt"), 1);

        cp.reset().await.unwrap();
        let store = repo.checkpoint_store().await.unwrap();
        assert!(store.load("blocks").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn survives_reopen_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain_of(6);
        let saved = chain.header_at(3).unwrap();

        let repo = open(dir.path()).await;
        let cp = StoredCheckpoint::load(
            "blocks",
            Box::new(repo.checkpoint_store().await.unwrap()),
            chain.clone(),
        )
        .await
        .unwrap();
        cp.save_progress(&saved).await.unwrap();
        repo.close().await;

        let reopened = open(dir.path()).await;
        let cp = StoredCheckpoint::load(
            "blocks",
            Box::new(reopened.checkpoint_store().await.unwrap()),
            chain.clone(),
        )
        .await
        .unwrap();
        let record = cp.record().unwrap();
        assert_eq!(record.height, 3);
        assert_eq!(record.block_hash, saved.hash);
        assert_eq!(record.locator, chain.locator(&saved));
        assert_eq!(chain.find_fork(&cp.block_locator()).hash, saved.hash);
    }
}
