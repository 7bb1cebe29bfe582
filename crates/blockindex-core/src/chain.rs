//! The header chain the fetcher replays against the store.
//!
//! [`ChainView`] is the capability the fetcher consumes; [`MemoryChain`] is
//! an in-memory implementation used by tests and small tools.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use bitcoin::block::Header;

use crate::block::{genesis_block, BlockHash, Network};
use crate::error::IndexerError;

// ─── ChainedHeader ────────────────────────────────────────────────────────────

/// A header together with its position in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainedHeader {
    pub height: u32,
    pub hash: BlockHash,
    pub header: Header,
}

impl ChainedHeader {
    pub fn new(height: u32, header: Header) -> Self {
        Self {
            height,
            hash: header.block_hash(),
            header,
        }
    }

    /// Block time in seconds since the Unix epoch.
    pub fn time(&self) -> u32 {
        self.header.time
    }

    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &ChainedHeader) -> bool {
        self.height == parent.height + 1 && self.header.prev_blockhash == parent.hash
    }
}

// ─── BlockLocator ─────────────────────────────────────────────────────────────

/// Compact list of block hashes, newest first, used to find the last header
/// two chain views have in common.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocator(pub Vec<BlockHash>);

impl BlockLocator {
    pub fn new(hashes: Vec<BlockHash>) -> Self {
        Self(hashes)
    }

    pub fn hashes(&self) -> &[BlockHash] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ─── ChainView ────────────────────────────────────────────────────────────────

/// Read access to a header chain.
///
/// Implementations must always contain a genesis header at height 0.
pub trait ChainView: Send + Sync {
    fn tip(&self) -> ChainedHeader;

    fn header_at(&self, height: u32) -> Option<ChainedHeader>;

    fn header_by_hash(&self, hash: &BlockHash) -> Option<ChainedHeader>;

    /// Last header of this chain that also appears in `locator`.
    /// Falls back to genesis when nothing matches.
    fn find_fork(&self, locator: &BlockLocator) -> ChainedHeader {
        locator
            .hashes()
            .iter()
            .find_map(|h| self.header_by_hash(h))
            .or_else(|| self.header_at(0))
            .unwrap_or_else(|| self.tip())
    }

    /// Headers strictly after `fork`, in ascending height order.
    fn enumerate_after(&self, fork: &ChainedHeader) -> Vec<ChainedHeader> {
        let tip = self.tip().height;
        (fork.height.saturating_add(1)..=tip)
            .map_while(|h| self.header_at(h))
            .collect()
    }

    /// Locator for `header`: the ten most recent ancestors one by one, then
    /// exponentially spaced, always ending with genesis.
    fn locator(&self, header: &ChainedHeader) -> BlockLocator {
        let mut hashes = Vec::new();
        let mut height = header.height as i64;
        let mut step = 1i64;
        while height > 0 {
            if let Some(h) = self.header_at(height as u32) {
                hashes.push(h.hash);
            }
            if hashes.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        if let Some(genesis) = self.header_at(0) {
            hashes.push(genesis.hash);
        }
        BlockLocator(hashes)
    }
}

// ─── MemoryChain ──────────────────────────────────────────────────────────────

/// In-memory header chain.
#[derive(Debug, Clone)]
pub struct MemoryChain {
    headers: Vec<ChainedHeader>,
    by_hash: HashMap<BlockHash, u32>,
}

impl MemoryChain {
    /// Create a chain holding only `genesis`.
    pub fn new(genesis: Header) -> Self {
        let genesis = ChainedHeader::new(0, genesis);
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.hash, 0);
        Self {
            headers: vec![genesis],
            by_hash,
        }
    }

    pub fn for_network(network: Network) -> Self {
        Self::new(genesis_block(network).header)
    }

    /// Append `header` on top of the current tip.
    pub fn push(&mut self, header: Header) -> Result<ChainedHeader, IndexerError> {
        let tip = self.tip();
        let chained = ChainedHeader::new(tip.height + 1, header);
        if !chained.extends(&tip) {
            return Err(IndexerError::Other(format!(
                "header {} does not extend tip {} at height {}",
                chained.hash, tip.hash, tip.height
            )));
        }
        self.by_hash.insert(chained.hash, chained.height);
        self.headers.push(chained);
        Ok(chained)
    }

    /// Discard every header above `height` (genesis is always kept).
    pub fn rewind_to(&mut self, height: u32) {
        while self.headers.len() > 1 && self.tip().height > height {
            if let Some(dropped) = self.headers.pop() {
                self.by_hash.remove(&dropped.hash);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl ChainView for MemoryChain {
    fn tip(&self) -> ChainedHeader {
        // `new` seeds genesis and `rewind_to` never removes it.
        self.headers[self.headers.len() - 1]
    }

    fn header_at(&self, height: u32) -> Option<ChainedHeader> {
        self.headers.get(height as usize).copied()
    }

    fn header_by_hash(&self, hash: &BlockHash) -> Option<ChainedHeader> {
        self.by_hash.get(hash).and_then(|h| self.header_at(*h))
    }
}
