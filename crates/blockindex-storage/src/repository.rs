//! SQLite-backed block, transaction and index store.
//!
//! One database file (`index.db`) per data directory, opened through an
//! `sqlx` pool in WAL mode. Every logical table is a plain key/value table:
//!
//! ```text
//! Block         block hash  → consensus-encoded block
//! Transaction   txid        → containing block hash      (tx-index only)
//! Common        [0x00]      → tip hash
//!               [0x01]      → tx-index flag
//!               "Index_<N>" → index descriptor JSON
//! Index_<N>     packed key  → packed value(s)
//! ```
//!
//! Writes (`put`, `delete`, `create_index`, `drop_index`) each run in a
//! single SQLite transaction. Callers must not issue them concurrently.
//!
//! # Usage
//! ```rust,no_run
//! use blockindex_storage::{IndexRepository, RepositoryConfig};
//!
//! # async fn example() -> Result<(), blockindex_core::IndexerError> {
//! let repo = IndexRepository::open(RepositoryConfig {
//!     data_dir: "./data".into(),
//!     ..RepositoryConfig::default()
//! })
//! .await?;
//! repo.initialize().await?;
//! repo.create_index("Script", true, "outputs: out.destination -> (tx.hash, out.index)")
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::Row;
use tracing::{debug, info};

use blockindex_core::block::{decode_block, encode_block, genesis_block, hash_from_slice, Hash};
use blockindex_core::{Block, BlockHash, IndexerError, Network, Transaction, Txid};

use crate::checkpoint::SqliteCheckpointStore;
use crate::index::{
    decode_values, index_table_name, is_identifier, validate_index_name, Index, IndexDescriptor,
    INDEX_TABLE_PREFIX,
};

pub const BLOCK_TABLE: &str = "Block";
pub const TRANSACTION_TABLE: &str = "Transaction";
pub const COMMON_TABLE: &str = "Common";

/// Database file inside the data directory.
pub const DB_FILE: &str = "index.db";

const TIP_KEY: [u8; 1] = [0x00];
const TX_INDEX_KEY: [u8; 1] = [0x01];

fn storage(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Directory holding `index.db`; created if missing.
    pub data_dir: PathBuf,
    pub network: Network,
    /// Upper bound of the connection pool.
    pub max_connections: u32,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            network: Network::Bitcoin,
            max_connections: 5,
        }
    }
}

// ─── TxLookup ─────────────────────────────────────────────────────────────────

/// Result of a transaction lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxLookup<T> {
    /// The transaction index is turned off.
    Disabled,
    NotFound,
    Found(T),
}

impl<T> TxLookup<T> {
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }

    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TxLookup<U> {
        match self {
            Self::Disabled => TxLookup::Disabled,
            Self::NotFound => TxLookup::NotFound,
            Self::Found(v) => TxLookup::Found(f(v)),
        }
    }
}

// ─── IndexRepository ──────────────────────────────────────────────────────────

pub struct IndexRepository {
    pool: SqlitePool,
    network: Network,
    data_dir: PathBuf,
}

impl IndexRepository {
    /// Open (or create) the store in `config.data_dir` and create the base tables.
    pub async fn open(config: RepositoryConfig) -> Result<Self, IndexerError> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|e| {
                IndexerError::Storage(format!("cannot create {}: {e}", config.data_dir.display()))
            })?;

        let options = SqliteConnectOptions::new()
            .filename(config.data_dir.join(DB_FILE))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(storage)?;

        let repo = Self {
            pool,
            network: config.network,
            data_dir: config.data_dir,
        };
        repo.init_schema().await?;
        debug!(dir = %repo.data_dir.display(), network = %repo.network, "repository opened");
        Ok(repo)
    }

    async fn init_schema(&self) -> Result<(), IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        for table in [BLOCK_TABLE, TRANSACTION_TABLE, COMMON_TABLE] {
            create_table(&mut conn, table).await?;
        }
        Ok(())
    }

    /// Seed the tip with the genesis hash and enable the tx index, unless
    /// either value is already present.
    pub async fn initialize(&self) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let sql = r#"INSERT OR IGNORE INTO "Common" (key, value) VALUES (?, ?)"#;
        sqlx::query(sql)
            .bind(&TIP_KEY[..])
            .bind(genesis_block(self.network).block_hash().to_byte_array().to_vec())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        sqlx::query(sql)
            .bind(&TX_INDEX_KEY[..])
            .bind(&[1u8][..])
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    // ─── Metadata ───────────────────────────────────────────────────────────────

    /// Overwrite the tip pointer.
    pub async fn set_block_hash(&self, hash: BlockHash) -> Result<(), IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        write(&mut conn, COMMON_TABLE, &TIP_KEY, hash.as_byte_array()).await
    }

    /// The tip pointer; `None` before `initialize`.
    pub async fn block_hash(&self) -> Result<Option<BlockHash>, IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        read(&mut conn, COMMON_TABLE, &TIP_KEY)
            .await?
            .map(|bytes| hash_from_slice(&bytes))
            .transpose()
    }

    /// Turn the tx index on or off. Existing refs are neither built nor removed.
    pub async fn set_tx_index(&self, enabled: bool) -> Result<(), IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        write(&mut conn, COMMON_TABLE, &TX_INDEX_KEY, &[enabled as u8]).await
    }

    pub async fn tx_index(&self) -> Result<bool, IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        tx_index_enabled(&mut conn).await
    }

    // ─── Blocks ─────────────────────────────────────────────────────────────────

    /// Store `blocks`, their tx refs (if enabled) and every active index's
    /// entries, then move the tip to `next_tip`. All or nothing.
    pub async fn put(&self, next_tip: BlockHash, blocks: &[Block]) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let tx_index = tx_index_enabled(&mut tx).await?;
        let indexes = load_indexes(&mut tx).await?;

        for block in blocks {
            let hash = block.block_hash();
            write(&mut tx, BLOCK_TABLE, hash.as_byte_array(), &encode_block(block)).await?;
            if tx_index {
                for t in &block.txdata {
                    let txid = t.compute_txid();
                    write(&mut tx, TRANSACTION_TABLE, txid.as_byte_array(), hash.as_byte_array())
                        .await?;
                }
            }
            for index in &indexes {
                apply_index(&mut tx, index, block, hash, self.network).await?;
            }
        }

        write(&mut tx, COMMON_TABLE, &TIP_KEY, next_tip.as_byte_array()).await?;
        tx.commit().await.map_err(storage)?;

        debug!(blocks = blocks.len(), indexes = indexes.len(), tip = %next_tip, "blocks stored");
        Ok(())
    }

    /// Remove `hashes` and the tx refs of their transactions, then move the
    /// tip to `new_tip`. Index entries derived from the blocks are kept.
    pub async fn delete(&self, new_tip: BlockHash, hashes: &[BlockHash]) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let mut removed = 0usize;
        for hash in hashes {
            let Some(bytes) = read(&mut tx, BLOCK_TABLE, hash.as_byte_array()).await? else {
                continue;
            };
            let block = decode_block(&bytes)?;
            for t in &block.txdata {
                remove(&mut tx, TRANSACTION_TABLE, t.compute_txid().as_byte_array()).await?;
            }
            remove(&mut tx, BLOCK_TABLE, hash.as_byte_array()).await?;
            removed += 1;
        }
        write(&mut tx, COMMON_TABLE, &TIP_KEY, new_tip.as_byte_array()).await?;
        tx.commit().await.map_err(storage)?;

        debug!(requested = hashes.len(), removed, tip = %new_tip, "blocks deleted");
        Ok(())
    }

    pub async fn get(&self, hash: &BlockHash) -> Result<Option<Block>, IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        read(&mut conn, BLOCK_TABLE, hash.as_byte_array())
            .await?
            .map(|bytes| decode_block(&bytes))
            .transpose()
    }

    pub async fn exists(&self, hash: &BlockHash) -> Result<bool, IndexerError> {
        let row = sqlx::query(r#"SELECT 1 FROM "Block" WHERE key = ?"#)
            .bind(hash.to_byte_array().to_vec())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.is_some())
    }

    // ─── Transactions ───────────────────────────────────────────────────────────

    /// Look up a transaction through its ref row and containing block.
    pub async fn get_trx(&self, txid: &Txid) -> Result<TxLookup<Transaction>, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let block_hash = match containing_block(&mut tx, txid).await? {
            TxLookup::Found(hash) => hash,
            TxLookup::Disabled => return Ok(TxLookup::Disabled),
            TxLookup::NotFound => return Ok(TxLookup::NotFound),
        };
        let Some(bytes) = read(&mut tx, BLOCK_TABLE, block_hash.as_byte_array()).await? else {
            return Ok(TxLookup::NotFound);
        };
        let block = decode_block(&bytes)?;
        Ok(block
            .txdata
            .into_iter()
            .find(|t| t.compute_txid() == *txid)
            .map_or(TxLookup::NotFound, TxLookup::Found))
    }

    /// Hash of the block containing `txid`.
    pub async fn get_trx_block_id(&self, txid: &Txid) -> Result<TxLookup<BlockHash>, IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        containing_block(&mut conn, txid).await
    }

    // ─── Indexes ────────────────────────────────────────────────────────────────

    /// Create index `name` and backfill it from every stored block.
    ///
    /// The name and rule are checked before touching the database.
    /// Re-creating an index with the same definition is a no-op.
    pub async fn create_index(
        &self,
        name: &str,
        multi_value: bool,
        builder: &str,
    ) -> Result<(), IndexerError> {
        let index = Index::new(name, multi_value, builder)?;
        let json = index.descriptor().to_json()?;

        let mut tx = self.pool.begin().await.map_err(storage)?;
        if let Some(existing) = read(&mut tx, COMMON_TABLE, index.table().as_bytes()).await? {
            if IndexDescriptor::from_json(&existing)? == *index.descriptor() {
                debug!(index = name, "index already exists");
                return Ok(());
            }
            return Err(IndexerError::IndexExists(name.to_string()));
        }

        write(&mut tx, COMMON_TABLE, index.table().as_bytes(), json.as_bytes()).await?;
        drop_table(&mut tx, index.table()).await?;
        create_table(&mut tx, index.table()).await?;

        let keys: Vec<Vec<u8>> = sqlx::query(r#"SELECT key FROM "Block" ORDER BY rowid"#)
            .fetch_all(&mut *tx)
            .await
            .map_err(storage)?
            .iter()
            .map(|row| row.try_get::<Vec<u8>, _>("key"))
            .collect::<Result<_, _>>()
            .map_err(storage)?;

        let mut entries = 0usize;
        for key in &keys {
            let Some(bytes) = read(&mut tx, BLOCK_TABLE, key).await? else {
                continue;
            };
            let block = decode_block(&bytes)?;
            let hash = hash_from_slice(key)?;
            entries += apply_index(&mut tx, &index, &block, hash, self.network).await?;
        }
        tx.commit().await.map_err(storage)?;

        info!(
            index = name,
            table = index.table(),
            rule = index.builder(),
            blocks = keys.len(),
            entries,
            "index created"
        );
        Ok(())
    }

    /// All index descriptors, sorted by name.
    pub async fn list_indexes(&self) -> Result<Vec<IndexDescriptor>, IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        load_catalog(&mut conn).await
    }

    pub async fn list_indexes_where<F>(&self, predicate: F) -> Result<Vec<IndexDescriptor>, IndexerError>
    where
        F: Fn(&IndexDescriptor) -> bool,
    {
        let mut all = self.list_indexes().await?;
        all.retain(|d| predicate(d));
        Ok(all)
    }

    /// Remove index `name` and its table. Returns whether it was in the catalog.
    pub async fn drop_index(&self, name: &str) -> Result<bool, IndexerError> {
        validate_index_name(name)?;
        let table = index_table_name(name);

        let mut tx = self.pool.begin().await.map_err(storage)?;
        let existed = remove(&mut tx, COMMON_TABLE, table.as_bytes()).await?;
        drop_table(&mut tx, &table).await?;
        tx.commit().await.map_err(storage)?;

        info!(index = name, existed, "index dropped");
        Ok(existed)
    }

    /// Drop a physical index table together with the catalog row that
    /// points at it, so later `put`s stop feeding it.
    pub async fn delete_index_table(&self, table: &str) -> Result<(), IndexerError> {
        if !table.starts_with(INDEX_TABLE_PREFIX) {
            return Err(IndexerError::InvalidOperation(format!(
                "'{table}' is not an index table (missing '{INDEX_TABLE_PREFIX}' prefix)"
            )));
        }
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let cataloged = remove(&mut tx, COMMON_TABLE, table.as_bytes()).await?;
        drop_table(&mut tx, table).await?;
        tx.commit().await.map_err(storage)?;

        debug!(table, cataloged, "index table deleted");
        Ok(())
    }

    /// Physical tables whose name starts with `Index_`.
    pub async fn index_tables(&self) -> Result<Vec<String>, IndexerError> {
        let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        let mut tables = Vec::new();
        for row in rows {
            let name: String = row.try_get("name").map_err(storage)?;
            if name.starts_with(INDEX_TABLE_PREFIX) {
                tables.push(name);
            }
        }
        Ok(tables)
    }

    pub fn index_table_name(name: &str) -> String {
        index_table_name(name)
    }

    /// The values stored under `key` in index `name`: one element for a
    /// single-value index, one per slot for a multi-value index.
    pub async fn lookup(&self, name: &str, key: &[u8]) -> Result<Option<Vec<Vec<u8>>>, IndexerError> {
        validate_index_name(name)?;
        let table = index_table_name(name);
        let mut conn = self.pool.acquire().await.map_err(storage)?;

        let descriptor = read(&mut conn, COMMON_TABLE, table.as_bytes())
            .await?
            .ok_or_else(|| IndexerError::InvalidOperation(format!("no index named '{name}'")))?;
        let descriptor = IndexDescriptor::from_json(&descriptor)?;

        let Some(entry) = read(&mut conn, &table, key).await? else {
            return Ok(None);
        };
        if descriptor.multi_value {
            decode_values(&table, &entry).map(Some)
        } else {
            Ok(Some(vec![entry]))
        }
    }

    // ─── Handles ────────────────────────────────────────────────────────────────

    /// Checkpoint store sharing this repository's database.
    pub async fn checkpoint_store(&self) -> Result<SqliteCheckpointStore, IndexerError> {
        SqliteCheckpointStore::new(self.pool.clone()).await
    }

    /// Raw pool for tooling that needs direct SQL access.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ─── Table helpers ────────────────────────────────────────────────────────────

fn quoted(table: &str) -> Result<String, IndexerError> {
    if is_identifier(table) {
        Ok(format!("\"{table}\""))
    } else {
        Err(IndexerError::InvalidOperation(format!("invalid table name '{table}'")))
    }
}

async fn create_table(conn: &mut SqliteConnection, table: &str) -> Result<(), IndexerError> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (key BLOB PRIMARY KEY, value BLOB NOT NULL)",
        quoted(table)?
    );
    sqlx::query(&sql).execute(&mut *conn).await.map_err(storage)?;
    Ok(())
}

async fn drop_table(conn: &mut SqliteConnection, table: &str) -> Result<(), IndexerError> {
    let sql = format!("DROP TABLE IF EXISTS {}", quoted(table)?);
    sqlx::query(&sql).execute(&mut *conn).await.map_err(storage)?;
    Ok(())
}

async fn read(
    conn: &mut SqliteConnection,
    table: &str,
    key: &[u8],
) -> Result<Option<Vec<u8>>, IndexerError> {
    let sql = format!("SELECT value FROM {} WHERE key = ?", quoted(table)?);
    let row = sqlx::query(&sql)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage)?;
    row.map(|r| r.try_get::<Vec<u8>, _>("value"))
        .transpose()
        .map_err(storage)
}

async fn write(
    conn: &mut SqliteConnection,
    table: &str,
    key: &[u8],
    value: &[u8],
) -> Result<(), IndexerError> {
    let sql = format!("INSERT OR REPLACE INTO {} (key, value) VALUES (?, ?)", quoted(table)?);
    sqlx::query(&sql)
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await
        .map_err(storage)?;
    Ok(())
}

async fn remove(conn: &mut SqliteConnection, table: &str, key: &[u8]) -> Result<bool, IndexerError> {
    let sql = format!("DELETE FROM {} WHERE key = ?", quoted(table)?);
    let done = sqlx::query(&sql)
        .bind(key)
        .execute(&mut *conn)
        .await
        .map_err(storage)?;
    Ok(done.rows_affected() > 0)
}

async fn tx_index_enabled(conn: &mut SqliteConnection) -> Result<bool, IndexerError> {
    let flag = read(conn, COMMON_TABLE, &TX_INDEX_KEY).await?;
    Ok(matches!(flag.as_deref(), Some([b, ..]) if *b != 0))
}

async fn containing_block(
    conn: &mut SqliteConnection,
    txid: &Txid,
) -> Result<TxLookup<BlockHash>, IndexerError> {
    if !tx_index_enabled(conn).await? {
        return Ok(TxLookup::Disabled);
    }
    match read(conn, TRANSACTION_TABLE, txid.as_byte_array()).await? {
        Some(bytes) => Ok(TxLookup::Found(hash_from_slice(&bytes)?)),
        None => Ok(TxLookup::NotFound),
    }
}

async fn load_catalog(conn: &mut SqliteConnection) -> Result<Vec<IndexDescriptor>, IndexerError> {
    let rows = sqlx::query(r#"SELECT key, value FROM "Common""#)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage)?;
    let mut descriptors = Vec::new();
    for row in rows {
        let key: Vec<u8> = row.try_get("key").map_err(storage)?;
        if key.starts_with(INDEX_TABLE_PREFIX.as_bytes()) {
            let value: Vec<u8> = row.try_get("value").map_err(storage)?;
            descriptors.push(IndexDescriptor::from_json(&value)?);
        }
    }
    descriptors.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(descriptors)
}

async fn load_indexes(conn: &mut SqliteConnection) -> Result<Vec<Index>, IndexerError> {
    load_catalog(conn)
        .await?
        .into_iter()
        .map(Index::from_descriptor)
        .collect()
}

/// Write `index`'s entries for `block`. Returns how many were written.
async fn apply_index(
    conn: &mut SqliteConnection,
    index: &Index,
    block: &Block,
    block_hash: BlockHash,
    network: Network,
) -> Result<usize, IndexerError> {
    let entries = index.entries(block, block_hash, network);
    for (key, value) in &entries {
        let stored = if index.multi_value() {
            let existing = read(conn, index.table(), key).await?;
            index.merge(existing.as_deref(), value)?
        } else {
            value.clone()
        };
        write(conn, index.table(), key, &stored).await?;
    }
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockindex_core::block::{build_block, coinbase_tx, p2pkh_output, spending};
    use blockindex_core::OutPoint;
    use tempfile::TempDir;

    const SCRIPT_RULE: &str = "outputs: out.destination -> (tx.hash, out.index)";
    const OUTPUT_RULE: &str = "inputs: (in.prev_hash, in.prev_index) -> tx.hash";

    async fn open_repo() -> (TempDir, IndexRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = IndexRepository::open(RepositoryConfig {
            data_dir: dir.path().join("store"),
            ..RepositoryConfig::default()
        })
        .await
        .unwrap();
        repo.initialize().await.unwrap();
        (dir, repo)
    }

    fn block_with(prev: BlockHash, txs: Vec<Transaction>) -> Block {
        build_block(prev, 0, 0, txs)
    }

    fn tx(version: i32) -> Transaction {
        coinbase_tx(version, vec![])
    }

    fn paying(version: i32, dest: [u8; 20]) -> Transaction {
        coinbase_tx(version, vec![p2pkh_output(100, dest)])
    }

    fn hash(n: u8) -> BlockHash {
        BlockHash::from_byte_array([n; 32])
    }

    async fn count(repo: &IndexRepository, table: &str) -> i64 {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS cnt FROM \"{table}\""))
            .fetch_one(repo.pool())
            .await
            .unwrap();
        row.get("cnt")
    }

    #[tokio::test]
    async fn initialize_seeds_genesis_and_tx_index() {
        let (_dir, repo) = open_repo().await;
        assert_eq!(repo.block_hash().await.unwrap(), Some(genesis_block(Network::Bitcoin).block_hash()));
        assert!(repo.tx_index().await.unwrap());
        assert!(repo.data_dir().join(DB_FILE).exists());
    }

    #[tokio::test]
    async fn initialize_never_overwrites() {
        let (dir, repo) = open_repo().await;
        repo.set_block_hash(hash(56)).await.unwrap();
        repo.set_tx_index(false).await.unwrap();
        repo.close().await;

        let reopened = IndexRepository::open(RepositoryConfig {
            data_dir: dir.path().join("store"),
            ..RepositoryConfig::default()
        })
        .await
        .unwrap();
        reopened.initialize().await.unwrap();
        assert_eq!(reopened.block_hash().await.unwrap(), Some(hash(56)));
        assert!(!reopened.tx_index().await.unwrap());
    }

    #[tokio::test]
    async fn put_then_get() {
        let (_dir, repo) = open_repo().await;
        let a = block_with(BlockHash::all_zeros(), vec![tx(1)]);
        let b = block_with(a.block_hash(), vec![tx(2), tx(3)]);
        repo.put(b.block_hash(), &[a.clone(), b.clone()]).await.unwrap();

        for block in [&a, &b] {
            let stored = repo.get(&block.block_hash()).await.unwrap().unwrap();
            assert_eq!(stored.block_hash(), block.block_hash());
            assert!(repo.exists(&block.block_hash()).await.unwrap());
        }
        assert!(repo.get(&hash(9)).await.unwrap().is_none());
        assert!(!repo.exists(&hash(9)).await.unwrap());
        assert_eq!(repo.block_hash().await.unwrap(), Some(b.block_hash()));
    }

    #[tokio::test]
    async fn put_two_blocks_three_transactions() {
        let (_dir, repo) = open_repo().await;
        let a = block_with(BlockHash::all_zeros(), vec![tx(32)]);
        let b = block_with(a.block_hash(), vec![tx(48), tx(15)]);
        repo.put(b.block_hash(), &[a.clone(), b.clone()]).await.unwrap();

        assert_eq!(count(&repo, BLOCK_TABLE).await, 2);
        assert_eq!(count(&repo, TRANSACTION_TABLE).await, 3);
        assert_eq!(repo.block_hash().await.unwrap(), Some(b.block_hash()));

        let id = repo.get_trx_block_id(&b.txdata[1].compute_txid()).await.unwrap();
        assert_eq!(id, TxLookup::Found(b.block_hash()));
    }

    #[tokio::test]
    async fn get_trx_tri_state() {
        let (_dir, repo) = open_repo().await;
        let block = block_with(BlockHash::all_zeros(), vec![tx(125)]);
        let txid = block.txdata[0].compute_txid();
        repo.put(block.block_hash(), &[block.clone()]).await.unwrap();

        let found = repo.get_trx(&txid).await.unwrap().found().unwrap();
        assert_eq!(found.version.0, 125);
        assert_eq!(repo.get_trx(&Txid::from_byte_array([65; 32])).await.unwrap(), TxLookup::NotFound);
        assert_eq!(
            repo.get_trx_block_id(&Txid::from_byte_array([65; 32])).await.unwrap(),
            TxLookup::NotFound
        );

        // The ref row is still there, but the feature is off.
        repo.set_tx_index(false).await.unwrap();
        assert_eq!(count(&repo, TRANSACTION_TABLE).await, 1);
        assert!(repo.get_trx(&txid).await.unwrap().is_disabled());
        assert!(repo.get_trx_block_id(&txid).await.unwrap().is_disabled());
        assert!(repo.get_trx(&Txid::all_zeros()).await.unwrap().is_disabled());
    }

    #[tokio::test]
    async fn tx_index_off_skips_refs() {
        let (_dir, repo) = open_repo().await;
        repo.set_tx_index(false).await.unwrap();
        let block = block_with(BlockHash::all_zeros(), vec![tx(1), tx(2)]);
        repo.put(block.block_hash(), &[block]).await.unwrap();
        assert_eq!(count(&repo, BLOCK_TABLE).await, 1);
        assert_eq!(count(&repo, TRANSACTION_TABLE).await, 0);
    }

    #[tokio::test]
    async fn delete_removes_only_requested_rows() {
        let (_dir, repo) = open_repo().await;
        repo.create_index("Script", true, SCRIPT_RULE).await.unwrap();
        let keep = block_with(BlockHash::all_zeros(), vec![paying(1, [1; 20])]);
        let gone = block_with(keep.block_hash(), vec![paying(2, [2; 20])]);
        repo.put(gone.block_hash(), &[keep.clone(), gone.clone()]).await.unwrap();

        repo.delete(hash(45), &[gone.block_hash()]).await.unwrap();

        assert!(!repo.exists(&gone.block_hash()).await.unwrap());
        assert!(repo.exists(&keep.block_hash()).await.unwrap());
        assert_eq!(repo.get_trx(&gone.txdata[0].compute_txid()).await.unwrap(), TxLookup::NotFound);
        assert!(repo.get_trx(&keep.txdata[0].compute_txid()).await.unwrap().found().is_some());
        assert_eq!(repo.block_hash().await.unwrap(), Some(hash(45)));
        // Index entries survive the delete.
        assert!(repo.lookup("Script", &[2; 20]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn multi_value_index_layout() {
        let (_dir, repo) = open_repo().await;
        let first = block_with(BlockHash::all_zeros(), vec![paying(1, [0x11; 20])]);
        let second = block_with(first.block_hash(), vec![paying(2, [0x22; 20])]);

        // One block before the index exists, one after.
        repo.put(first.block_hash(), &[first.clone()]).await.unwrap();
        repo.create_index("Script", true, SCRIPT_RULE).await.unwrap();
        repo.put(second.block_hash(), &[second.clone()]).await.unwrap();

        let expected_json = Index::new("Script", true, SCRIPT_RULE).unwrap().to_string();
        let mut conn = repo.pool().acquire().await.unwrap();
        let catalog = read(&mut conn, COMMON_TABLE, b"Index_Script").await.unwrap().unwrap();
        assert_eq!(catalog, expected_json.into_bytes());

        for (dest, block) in [([0x11; 20], &first), ([0x22; 20], &second)] {
            let entry = read(&mut conn, "Index_Script", &dest).await.unwrap().unwrap();
            assert_eq!(entry.len(), 42);
            assert_eq!(entry[3], 38);
            assert_eq!(entry[5], 36);
            assert_eq!(&entry[6..38], block.txdata[0].compute_txid().as_byte_array());
            assert_eq!(&entry[38..], &[0, 0, 0, 0]);
        }
        assert_eq!(count(&repo, "Index_Script").await, 2);

        // A later payment to the same destination adds a slot.
        let third = block_with(second.block_hash(), vec![paying(3, [0x11; 20])]);
        repo.put(third.block_hash(), &[third.clone()]).await.unwrap();
        let values = repo.lookup("Script", &[0x11; 20]).await.unwrap().unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(&values[1][..32], third.txdata[0].compute_txid().as_byte_array());
    }

    #[tokio::test]
    async fn single_value_index_last_write_wins() {
        let (_dir, repo) = open_repo().await;
        repo.create_index("Output", false, OUTPUT_RULE).await.unwrap();

        let outpoint = OutPoint::new(Txid::from_byte_array([7; 32]), 1);
        let spend = |version| {
            let mut t = tx(version);
            t.input = vec![spending(outpoint)];
            t
        };
        let a = block_with(BlockHash::all_zeros(), vec![spend(1)]);
        let b = block_with(a.block_hash(), vec![spend(2)]);
        repo.put(a.block_hash(), &[a.clone()]).await.unwrap();
        repo.put(b.block_hash(), &[b.clone()]).await.unwrap();

        let mut key = outpoint.txid.to_byte_array().to_vec();
        key.extend_from_slice(&1u32.to_be_bytes());
        let values = repo.lookup("Output", &key).await.unwrap().unwrap();
        assert_eq!(values, vec![b.txdata[0].compute_txid().to_byte_array().to_vec()]);
        assert_eq!(count(&repo, "Index_Output").await, 1);
    }

    #[tokio::test]
    async fn create_index_validates_before_io() {
        let (_dir, repo) = open_repo().await;
        let err = repo.create_index("Script", true, "outputs: -> tx.hash").await.unwrap_err();
        assert!(matches!(err, IndexerError::InvalidRule { .. }));
        let err = repo.create_index("no spaces", true, SCRIPT_RULE).await.unwrap_err();
        assert!(matches!(err, IndexerError::InvalidIndexName(_)));

        assert!(repo.list_indexes().await.unwrap().is_empty());
        assert!(repo.index_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_index_is_idempotent() {
        let (_dir, repo) = open_repo().await;
        let block = block_with(BlockHash::all_zeros(), vec![paying(1, [5; 20])]);
        repo.put(block.block_hash(), &[block]).await.unwrap();

        repo.create_index("Script", true, SCRIPT_RULE).await.unwrap();
        repo.create_index("Script", true, SCRIPT_RULE).await.unwrap();
        // Not backfilled twice.
        assert_eq!(repo.lookup("Script", &[5; 20]).await.unwrap().unwrap().len(), 1);

        let err = repo.create_index("Script", false, SCRIPT_RULE).await.unwrap_err();
        assert!(matches!(err, IndexerError::IndexExists(name) if name == "Script"));
    }

    #[tokio::test]
    async fn list_and_drop_indexes() {
        let (_dir, repo) = open_repo().await;
        repo.create_index("Transaction", false, OUTPUT_RULE).await.unwrap();
        repo.create_index("Block", false, OUTPUT_RULE).await.unwrap();
        repo.create_index("Script", true, SCRIPT_RULE).await.unwrap();

        let names: Vec<String> = repo.list_indexes().await.unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["Block", "Script", "Transaction"]);
        let multi = repo.list_indexes_where(|d| d.multi_value).await.unwrap();
        assert_eq!(multi.len(), 1);
        assert_eq!(multi[0].table, "Index_Script");

        assert!(repo.drop_index("Transaction").await.unwrap());
        assert!(!repo.drop_index("Transaction").await.unwrap());
        assert_eq!(repo.index_tables().await.unwrap(), vec!["Index_Block", "Index_Script"]);
        assert_eq!(repo.list_indexes().await.unwrap().len(), 2);
        assert!(matches!(
            repo.lookup("Transaction", &[0; 36]).await.unwrap_err(),
            IndexerError::InvalidOperation(_)
        ));
    }

    #[tokio::test]
    async fn index_tables_only_lists_prefixed() {
        let (_dir, repo) = open_repo().await;
        assert!(repo.index_tables().await.unwrap().is_empty());
        for sql in [
            "CREATE TABLE Other (key BLOB)",
            "CREATE TABLE index_lower (key BLOB)",
            "CREATE TABLE Index_Transaction (key BLOB)",
        ] {
            sqlx::query(sql).execute(repo.pool()).await.unwrap();
        }
        assert_eq!(repo.index_tables().await.unwrap(), vec!["Index_Transaction"]);
    }

    #[tokio::test]
    async fn delete_index_table_checks_prefix() {
        let (_dir, repo) = open_repo().await;
        let err = repo.delete_index_table("Block").await.unwrap_err();
        assert!(matches!(err, IndexerError::InvalidOperation(_)));
        assert_eq!(count(&repo, BLOCK_TABLE).await, 0);

        // Missing table: no-op.
        repo.delete_index_table("Index_Missing").await.unwrap();

        repo.create_index("Script", true, SCRIPT_RULE).await.unwrap();
        repo.delete_index_table("Index_Script").await.unwrap();
        assert!(repo.index_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn put_after_delete_index_table() {
        let (_dir, repo) = open_repo().await;
        repo.create_index("Script", true, SCRIPT_RULE).await.unwrap();
        repo.create_index("Output", false, OUTPUT_RULE).await.unwrap();
        repo.delete_index_table("Index_Script").await.unwrap();

        let names: Vec<String> = repo.list_indexes().await.unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["Output"]);
        assert_eq!(repo.index_tables().await.unwrap(), vec!["Index_Output"]);

        let block = block_with(BlockHash::all_zeros(), vec![paying(1, [4; 20])]);
        repo.put(block.block_hash(), &[block.clone()]).await.unwrap();
        assert!(repo.exists(&block.block_hash()).await.unwrap());
        assert!(matches!(
            repo.lookup("Script", &[4; 20]).await.unwrap_err(),
            IndexerError::InvalidOperation(_)
        ));

        // The name is free again.
        repo.create_index("Script", true, SCRIPT_RULE).await.unwrap();
        assert_eq!(repo.lookup("Script", &[4; 20]).await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_put_leaves_no_trace() {
        let (_dir, repo) = open_repo().await;
        repo.create_index("Script", true, SCRIPT_RULE).await.unwrap();
        let tip = repo.block_hash().await.unwrap();

        // An entry with the wrong stride under the destination we are about to pay.
        let mut conn = repo.pool().acquire().await.unwrap();
        write(&mut conn, "Index_Script", &[9; 20], &[0, 0, 0, 6, 0, 4, 1, 2, 3, 4])
            .await
            .unwrap();
        drop(conn);

        let block = block_with(BlockHash::all_zeros(), vec![paying(1, [9; 20])]);
        let err = repo.put(block.block_hash(), &[block.clone()]).await.unwrap_err();
        assert!(err.is_fatal());

        assert!(!repo.exists(&block.block_hash()).await.unwrap());
        assert_eq!(count(&repo, TRANSACTION_TABLE).await, 0);
        assert_eq!(repo.block_hash().await.unwrap(), tip);
    }

    #[test]
    fn table_name_mapping() {
        assert_eq!(IndexRepository::index_table_name("Script"), "Index_Script");
    }
}
