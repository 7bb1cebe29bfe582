//! Index definitions and the index-entry codec.
//!
//! An [`Index`] pairs its persisted [`IndexDescriptor`] with the extractor
//! compiled from the descriptor's rule. Descriptors are stored as JSON in the
//! `Common` table under the index's table name.
//!
//! # Multi-value entry layout
//!
//! ```text
//! [u32 BE: bytes that follow] [u16 BE: stride] [slot 0] [slot 1] ...
//! ```
//!
//! Every slot holds one packed value tuple of `stride` bytes. Appending a
//! value rewrites the whole entry with one more slot.

use std::fmt;

use serde::{Deserialize, Serialize};

use blockindex_core::{Block, BlockHash, IndexerError, Network};

use crate::rule::{Entry, Extractor, Rule, TxContext};

/// Prefix of every index table.
pub const INDEX_TABLE_PREFIX: &str = "Index_";

const HEADER_LEN: usize = 6;

/// Physical table backing the index `name`.
pub fn index_table_name(name: &str) -> String {
    format!("{INDEX_TABLE_PREFIX}{name}")
}

/// Index names become table names: ASCII letters, digits and `_` only.
pub fn validate_index_name(name: &str) -> Result<(), IndexerError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(IndexerError::InvalidIndexName(name.to_string()))
    }
}

pub(crate) fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

// ─── Descriptor ───────────────────────────────────────────────────────────────

/// Catalog record of an index. Field order is the serialization order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
    pub name: String,
    pub table: String,
    pub multi_value: bool,
    /// Extraction rule source, stored verbatim.
    pub builder: String,
}

impl IndexDescriptor {
    pub fn new(name: impl Into<String>, multi_value: bool, builder: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: index_table_name(&name),
            name,
            multi_value,
            builder: builder.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, IndexerError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, IndexerError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ─── Index ────────────────────────────────────────────────────────────────────

/// A descriptor together with its compiled extractor.
pub struct Index {
    descriptor: IndexDescriptor,
    value_width: usize,
    extractor: Extractor,
}

impl Index {
    /// Validate `name` and compile `builder`. No I/O.
    pub fn new(name: &str, multi_value: bool, builder: &str) -> Result<Self, IndexerError> {
        Self::from_descriptor(IndexDescriptor::new(name, multi_value, builder))
    }

    pub fn from_descriptor(descriptor: IndexDescriptor) -> Result<Self, IndexerError> {
        validate_index_name(&descriptor.name)?;
        if descriptor.table != index_table_name(&descriptor.name) {
            return Err(IndexerError::Corrupt {
                table: descriptor.table.clone(),
                reason: format!("descriptor table does not belong to index '{}'", descriptor.name),
            });
        }
        let rule = Rule::parse(&descriptor.builder)?;
        Ok(Self {
            descriptor,
            value_width: rule.value_width(),
            extractor: rule.compile(),
        })
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn table(&self) -> &str {
        &self.descriptor.table
    }

    pub fn multi_value(&self) -> bool {
        self.descriptor.multi_value
    }

    pub fn builder(&self) -> &str {
        &self.descriptor.builder
    }

    /// Packed size of one value, i.e. the multi-value stride.
    pub fn value_width(&self) -> usize {
        self.value_width
    }

    /// Entries for every transaction of `block`, in block order.
    pub fn entries(&self, block: &Block, block_hash: BlockHash, network: Network) -> Vec<Entry> {
        let mut entries = Vec::new();
        for (position, tx) in (0u32..).zip(&block.txdata) {
            let ctx = TxContext {
                tx,
                txid: tx.compute_txid(),
                position,
                block,
                block_hash,
                network,
            };
            entries.extend((self.extractor)(&ctx));
        }
        entries
    }

    /// The bytes to store for `value` given the current entry under its key.
    pub fn merge(&self, existing: Option<&[u8]>, value: &[u8]) -> Result<Vec<u8>, IndexerError> {
        if self.multi_value() {
            append_value(self.table(), existing, value)
        } else {
            Ok(value.to_vec())
        }
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("descriptor", &self.descriptor)
            .field("value_width", &self.value_width)
            .finish_non_exhaustive()
    }
}

/// The catalog JSON.
impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(&self.descriptor).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

// ─── Multi-value codec ────────────────────────────────────────────────────────

/// Append `value` as a new slot of the multi-value entry `existing`.
pub fn append_value(
    table: &str,
    existing: Option<&[u8]>,
    value: &[u8],
) -> Result<Vec<u8>, IndexerError> {
    let stride = u16::try_from(value.len()).map_err(|_| IndexerError::Corrupt {
        table: table.to_string(),
        reason: format!("value of {} bytes exceeds the maximum stride", value.len()),
    })?;

    let Some(existing) = existing else {
        let mut entry = Vec::with_capacity(HEADER_LEN + value.len());
        entry.extend_from_slice(&(2 + value.len() as u32).to_be_bytes());
        entry.extend_from_slice(&stride.to_be_bytes());
        entry.extend_from_slice(value);
        return Ok(entry);
    };

    let (stored_stride, slots) = split_entry(table, existing)?;
    if stored_stride != stride as usize {
        return Err(IndexerError::Corrupt {
            table: table.to_string(),
            reason: format!("entry stride {stored_stride} does not match value of {} bytes", value.len()),
        });
    }

    let body = 2 + slots.len() + value.len();
    let body = u32::try_from(body).map_err(|_| IndexerError::Corrupt {
        table: table.to_string(),
        reason: "entry too large".into(),
    })?;
    let mut entry = Vec::with_capacity(existing.len() + value.len());
    entry.extend_from_slice(&body.to_be_bytes());
    entry.extend_from_slice(&stride.to_be_bytes());
    entry.extend_from_slice(slots);
    entry.extend_from_slice(value);
    Ok(entry)
}

/// Split a multi-value entry into its value slots.
pub fn decode_values(table: &str, entry: &[u8]) -> Result<Vec<Vec<u8>>, IndexerError> {
    let (stride, slots) = split_entry(table, entry)?;
    Ok(slots.chunks(stride).map(<[u8]>::to_vec).collect())
}

fn split_entry<'a>(table: &str, entry: &'a [u8]) -> Result<(usize, &'a [u8]), IndexerError> {
    let corrupt = |reason: String| IndexerError::Corrupt {
        table: table.to_string(),
        reason,
    };
    if entry.len() < HEADER_LEN {
        return Err(corrupt(format!("entry of {} bytes is shorter than its header", entry.len())));
    }
    let body = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]) as usize;
    let stride = u16::from_be_bytes([entry[4], entry[5]]) as usize;
    let slots = &entry[HEADER_LEN..];
    if body != entry.len() - 4 {
        return Err(corrupt(format!(
            "entry length field {body} does not match {} stored bytes",
            entry.len() - 4
        )));
    }
    if stride == 0 || slots.len() % stride != 0 {
        return Err(corrupt(format!("{} slot bytes are not a multiple of stride {stride}", slots.len())));
    }
    Ok((stride, slots))
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockindex_core::block::{build_block, coinbase_tx, p2pkh_output, Hash};

    const SCRIPT_RULE: &str = "outputs: out.destination -> (tx.hash, out.index)";

    #[test]
    fn descriptor_json_field_order() {
        let json = IndexDescriptor::new("Script", true, SCRIPT_RULE).to_json().unwrap();
        assert_eq!(
            json,
            format!(r#"{{"name":"Script","table":"Index_Script","multiValue":true,"builder":"{SCRIPT_RULE}"}}"#)
        );
    }

    #[test]
    fn identical_inputs_serialize_identically() {
        let a = Index::new("Script", true, SCRIPT_RULE).unwrap();
        let b = Index::new("Script", true, SCRIPT_RULE).unwrap();
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a.to_string(), a.descriptor().to_json().unwrap());
        assert_eq!(a.builder(), SCRIPT_RULE);
        assert_eq!(a.table(), "Index_Script");
    }

    #[test]
    fn new_validates_name_and_rule() {
        assert!(matches!(
            Index::new("bad-name", false, SCRIPT_RULE).unwrap_err(),
            IndexerError::InvalidIndexName(_)
        ));
        assert!(matches!(
            Index::new("", false, SCRIPT_RULE).unwrap_err(),
            IndexerError::InvalidIndexName(_)
        ));
        assert!(matches!(
            Index::new("Script", false, "outputs: nope -> tx.hash").unwrap_err(),
            IndexerError::InvalidRule { .. }
        ));
    }

    #[test]
    fn first_value_layout() {
        let txid = [42u8; 32];
        let mut value = txid.to_vec();
        value.extend_from_slice(&0u32.to_be_bytes());

        let entry = append_value("Index_Script", None, &value).unwrap();
        assert_eq!(entry.len(), 42);
        assert_eq!(&entry[..6], &[0, 0, 0, 38, 0, 36]);
        assert_eq!(&entry[6..38], &txid);
    }

    #[test]
    fn append_extends_by_one_slot() {
        let first = vec![1u8; 8];
        let second = vec![2u8; 8];
        let entry = append_value("t", None, &first).unwrap();
        let entry = append_value("t", Some(&entry), &second).unwrap();
        assert_eq!(&entry[..6], &[0, 0, 0, 18, 0, 8]);
        assert_eq!(decode_values("t", &entry).unwrap(), vec![first, second]);
    }

    #[test]
    fn stride_mismatch_is_corrupt() {
        let entry = append_value("t", None, &[0u8; 8]).unwrap();
        let err = append_value("t", Some(&entry), &[0u8; 4]).unwrap_err();
        assert!(err.is_fatal());
        assert!(decode_values("t", &[0, 0, 0, 9, 0, 4, 1, 2, 3]).is_err());
        assert!(decode_values("t", &[0, 1]).is_err());
    }

    #[test]
    fn single_value_merge_overwrites() {
        let index = Index::new("Output", false, "inputs: (in.prev_hash, in.prev_index) -> tx.hash").unwrap();
        assert_eq!(index.value_width(), 32);
        let merged = index.merge(Some(&[9u8; 32]), &[1u8; 32]).unwrap();
        assert_eq!(merged, vec![1u8; 32]);
    }

    #[test]
    fn entries_cover_every_transaction() {
        let index = Index::new("Script", true, SCRIPT_RULE).unwrap();
        let a = coinbase_tx(1, vec![p2pkh_output(10, [1; 20])]);
        let b = coinbase_tx(2, vec![p2pkh_output(20, [2; 20]), p2pkh_output(30, [3; 20])]);
        let block = build_block(BlockHash::all_zeros(), 0, 0, vec![a, b]);

        let entries = index.entries(&block, block.block_hash(), Network::Bitcoin);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].0.as_slice(), &[3; 20]);
        assert_eq!(&entries[2].1[32..], &1u32.to_be_bytes());
    }
}
