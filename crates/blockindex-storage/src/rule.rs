//! Index extraction rules.
//!
//! A rule says which rows an index gets for each transaction:
//!
//! ```text
//! rule   := scope ":" tuple "->" tuple
//! scope  := "tx" | "inputs" | "outputs"
//! tuple  := "(" field ("," field)* ")" | field
//! ```
//!
//! `tx` yields one row per transaction, `inputs` one per input and `outputs`
//! one per output. Fields are fixed width, so every value tuple of a rule
//! packs to the same number of bytes.
//!
//! ```text
//! outputs: out.destination -> (tx.hash, out.index)      script hash → outpoints
//! inputs: (in.prev_hash, in.prev_index) -> tx.hash      outpoint → spender
//! tx: tx.hash -> (block.hash, tx.position)              txid → location
//! ```

use std::fmt;
use std::sync::Arc;

use blockindex_core::block::{destination, Hash};
use blockindex_core::{Block, BlockHash, IndexerError, Network, Transaction, TxIn, TxOut, Txid};

// ─── Fields ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Tx,
    Inputs,
    Outputs,
}

impl Scope {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "tx" => Some(Self::Tx),
            "inputs" => Some(Self::Inputs),
            "outputs" => Some(Self::Outputs),
            _ => None,
        }
    }
}

/// A value a rule can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    TxHash,
    TxVersion,
    TxLockTime,
    TxPosition,
    BlockHash,
    BlockPrevHash,
    BlockMerkleRoot,
    BlockTime,
    NetworkMagic,
    InPrevHash,
    InPrevIndex,
    InIndex,
    InSequence,
    OutDestination,
    OutIndex,
    OutValue,
}

impl Field {
    fn parse(s: &str) -> Option<Self> {
        let field = match s {
            "tx.hash" => Self::TxHash,
            "tx.version" => Self::TxVersion,
            "tx.lock_time" => Self::TxLockTime,
            "tx.position" => Self::TxPosition,
            "block.hash" => Self::BlockHash,
            "block.prev_hash" => Self::BlockPrevHash,
            "block.merkle_root" => Self::BlockMerkleRoot,
            "block.time" => Self::BlockTime,
            "network.magic" => Self::NetworkMagic,
            "in.prev_hash" => Self::InPrevHash,
            "in.prev_index" => Self::InPrevIndex,
            "in.index" => Self::InIndex,
            "in.sequence" => Self::InSequence,
            "out.destination" => Self::OutDestination,
            "out.index" => Self::OutIndex,
            "out.value" => Self::OutValue,
            _ => return None,
        };
        Some(field)
    }

    /// Packed size in bytes.
    pub fn width(self) -> usize {
        match self {
            Self::TxHash
            | Self::BlockHash
            | Self::BlockPrevHash
            | Self::BlockMerkleRoot
            | Self::InPrevHash => 32,
            Self::OutDestination => 20,
            Self::OutValue => 8,
            _ => 4,
        }
    }

    /// The scope this field needs, if it is not available everywhere.
    fn required_scope(self) -> Option<Scope> {
        match self {
            Self::InPrevHash | Self::InPrevIndex | Self::InIndex | Self::InSequence => {
                Some(Scope::Inputs)
            }
            Self::OutDestination | Self::OutIndex | Self::OutValue => Some(Scope::Outputs),
            _ => None,
        }
    }

    /// Append this field's encoding to `buf`. Returns `false` when the
    /// value is absent for this row.
    fn pack(self, row: &Row<'_>, buf: &mut Vec<u8>) -> bool {
        let ctx = row.ctx;
        match self {
            Self::TxHash => buf.extend_from_slice(ctx.txid.as_byte_array()),
            Self::TxVersion => buf.extend_from_slice(&(ctx.tx.version.0 as u32).to_be_bytes()),
            Self::TxLockTime => {
                buf.extend_from_slice(&ctx.tx.lock_time.to_consensus_u32().to_be_bytes())
            }
            Self::TxPosition => buf.extend_from_slice(&ctx.position.to_be_bytes()),
            Self::BlockHash => buf.extend_from_slice(ctx.block_hash.as_byte_array()),
            Self::BlockPrevHash => {
                buf.extend_from_slice(ctx.block.header.prev_blockhash.as_byte_array())
            }
            Self::BlockMerkleRoot => {
                buf.extend_from_slice(ctx.block.header.merkle_root.as_byte_array())
            }
            Self::BlockTime => buf.extend_from_slice(&ctx.block.header.time.to_be_bytes()),
            Self::NetworkMagic => buf.extend_from_slice(&ctx.network.magic().to_bytes()),
            Self::InPrevHash | Self::InPrevIndex | Self::InIndex | Self::InSequence => {
                let Some((n, input)) = row.input else {
                    return false;
                };
                match self {
                    Self::InPrevHash => {
                        buf.extend_from_slice(input.previous_output.txid.as_byte_array())
                    }
                    Self::InPrevIndex => {
                        buf.extend_from_slice(&input.previous_output.vout.to_be_bytes())
                    }
                    Self::InIndex => buf.extend_from_slice(&n.to_be_bytes()),
                    _ => buf.extend_from_slice(&input.sequence.0.to_be_bytes()),
                }
            }
            Self::OutDestination | Self::OutIndex | Self::OutValue => {
                let Some((n, output)) = row.output else {
                    return false;
                };
                match self {
                    Self::OutDestination => match destination(output) {
                        Some(dest) => buf.extend_from_slice(&dest),
                        None => return false,
                    },
                    Self::OutIndex => buf.extend_from_slice(&n.to_be_bytes()),
                    _ => buf.extend_from_slice(&output.value.to_sat().to_be_bytes()),
                }
            }
        }
        true
    }
}

// ─── Evaluation context ───────────────────────────────────────────────────────

/// One transaction in its block, as seen by an extractor.
#[derive(Clone, Copy)]
pub struct TxContext<'a> {
    pub tx: &'a Transaction,
    pub txid: Txid,
    /// Position of `tx` within `block`.
    pub position: u32,
    pub block: &'a Block,
    pub block_hash: BlockHash,
    pub network: Network,
}

struct Row<'a> {
    ctx: &'a TxContext<'a>,
    input: Option<(u32, &'a TxIn)>,
    output: Option<(u32, &'a TxOut)>,
}

/// Packed `(key, value)` pair produced by an extractor.
pub type Entry = (Vec<u8>, Vec<u8>);

/// A compiled rule.
pub type Extractor = Arc<dyn Fn(&TxContext<'_>) -> Vec<Entry> + Send + Sync>;

// ─── Rule ─────────────────────────────────────────────────────────────────────

/// A parsed extraction rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub scope: Scope,
    pub key: Vec<Field>,
    pub value: Vec<Field>,
}

impl Rule {
    pub fn parse(source: &str) -> Result<Self, IndexerError> {
        let invalid = |reason: &str| IndexerError::InvalidRule {
            rule: source.to_string(),
            reason: reason.to_string(),
        };

        let (scope, body) = source
            .split_once(':')
            .ok_or_else(|| invalid("expected '<scope>: <key> -> <value>'"))?;
        let scope = Scope::parse(scope.trim())
            .ok_or_else(|| invalid("scope must be one of tx, inputs, outputs"))?;
        let (key, value) = body
            .split_once("->")
            .ok_or_else(|| invalid("missing '->' between key and value"))?;

        let key = parse_tuple(key).map_err(|e| invalid(&e))?;
        let value = parse_tuple(value).map_err(|e| invalid(&e))?;

        for field in key.iter().chain(&value) {
            if let Some(needed) = field.required_scope() {
                if needed != scope {
                    return Err(invalid(&format!("field {field} is not available in this scope")));
                }
            }
        }
        let rule = Self { scope, key, value };
        if rule.value_width() > u16::MAX as usize {
            return Err(invalid("value tuple is too wide"));
        }
        Ok(rule)
    }

    /// Packed size of one value tuple.
    pub fn value_width(&self) -> usize {
        self.value.iter().map(|f| f.width()).sum()
    }

    /// Turn the rule into an extractor closure.
    pub fn compile(self) -> Extractor {
        Arc::new(move |ctx: &TxContext<'_>| {
            let rows: Vec<Row<'_>> = match self.scope {
                Scope::Tx => vec![Row {
                    ctx,
                    input: None,
                    output: None,
                }],
                Scope::Inputs => (0u32..)
                    .zip(&ctx.tx.input)
                    .map(|input| Row {
                        ctx,
                        input: Some(input),
                        output: None,
                    })
                    .collect(),
                Scope::Outputs => (0u32..)
                    .zip(&ctx.tx.output)
                    .map(|output| Row {
                        ctx,
                        input: None,
                        output: Some(output),
                    })
                    .collect(),
            };
            rows.iter()
                .filter_map(|row| Some((pack(&self.key, row)?, pack(&self.value, row)?)))
                .collect::<Vec<Entry>>()
        })
    }
}

fn pack(fields: &[Field], row: &Row<'_>) -> Option<Vec<u8>> {
    let mut buf = Vec::with_capacity(fields.iter().map(|f| f.width()).sum());
    for field in fields {
        if !field.pack(row, &mut buf) {
            return None;
        }
    }
    Some(buf)
}

fn parse_tuple(s: &str) -> Result<Vec<Field>, String> {
    let s = s.trim();
    let inner = match s.strip_prefix('(') {
        Some(rest) => rest
            .strip_suffix(')')
            .ok_or_else(|| format!("unbalanced parentheses in '{s}'"))?,
        None => s,
    };
    inner
        .split(',')
        .map(|name| {
            let name = name.trim();
            if name.is_empty() {
                return Err(format!("empty field in '{s}'"));
            }
            Field::parse(name).ok_or_else(|| format!("unknown field '{name}'"))
        })
        .collect()
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TxHash => "tx.hash",
            Self::TxVersion => "tx.version",
            Self::TxLockTime => "tx.lock_time",
            Self::TxPosition => "tx.position",
            Self::BlockHash => "block.hash",
            Self::BlockPrevHash => "block.prev_hash",
            Self::BlockMerkleRoot => "block.merkle_root",
            Self::BlockTime => "block.time",
            Self::NetworkMagic => "network.magic",
            Self::InPrevHash => "in.prev_hash",
            Self::InPrevIndex => "in.prev_index",
            Self::InIndex => "in.index",
            Self::InSequence => "in.sequence",
            Self::OutDestination => "out.destination",
            Self::OutIndex => "out.index",
            Self::OutValue => "out.value",
        };
        f.write_str(name)
    }
}
