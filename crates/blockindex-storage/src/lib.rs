//! Block and transaction store with dynamic secondary indexes.
//!
//! [`IndexRepository`] persists blocks keyed by hash, optionally maps every
//! transaction to its containing block, and maintains user-defined indexes.
//! An index is declared with a small extraction rule (see [`rule`]) that is
//! compiled once and run over every stored and future transaction.
//! [`SqliteCheckpointStore`] keeps replay checkpoints in the same database.

pub mod checkpoint;
pub mod index;
pub mod repository;
pub mod rule;

pub use checkpoint::SqliteCheckpointStore;
pub use index::{index_table_name, Index, IndexDescriptor, INDEX_TABLE_PREFIX};
pub use repository::{IndexRepository, RepositoryConfig, TxLookup};
pub use rule::{Field, Rule, Scope};
