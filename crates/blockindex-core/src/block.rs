//! Thin adapter over the `bitcoin` block model.
//!
//! The rest of the workspace imports block, transaction and hash types from
//! here so the `bitcoin` version is pinned in one place. The helpers cover
//! the handful of things the store needs on top of the crate: the block
//! codec mapped onto [`IndexerError`], the 20-byte destination of standard
//! output scripts, and a small block builder for in-memory chains.

use bitcoin::block::{Header, Version};
use bitcoin::consensus::encode;
use bitcoin::transaction;

pub use bitcoin::absolute::LockTime;
pub use bitcoin::blockdata::constants::genesis_block;
pub use bitcoin::hashes::Hash;
pub use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, Network, OutPoint, PubkeyHash, ScriptBuf, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, Txid, Witness,
};

use crate::error::IndexerError;

/// Regtest difficulty bits, used for blocks assembled by [`build_block`].
const REGTEST_BITS: u32 = 0x207f_ffff;

/// Consensus-encode a block.
pub fn encode_block(block: &Block) -> Vec<u8> {
    encode::serialize(block)
}

/// Decode a consensus-encoded block; trailing bytes are rejected.
pub fn decode_block(bytes: &[u8]) -> Result<Block, IndexerError> {
    Ok(encode::deserialize(bytes)?)
}

/// Read a 32-byte hash stored in internal byte order.
pub fn hash_from_slice<H: Hash>(bytes: &[u8]) -> Result<H, IndexerError> {
    H::from_slice(bytes).map_err(|e| IndexerError::Codec(format!("bad hash bytes: {e}")))
}

/// Payload of a standard output script.
///
/// P2PKH yields the pubkey hash, P2SH the script hash and P2WPKH the witness
/// program. Every other script has no destination.
pub fn destination(output: &TxOut) -> Option<[u8; 20]> {
    let script = output.script_pubkey.as_script();
    let bytes = script.as_bytes();
    let payload = if script.is_p2pkh() {
        &bytes[3..23]
    } else if script.is_p2sh() || script.is_p2wpkh() {
        &bytes[2..22]
    } else {
        return None;
    };
    payload.try_into().ok()
}

/// Pay-to-pubkey-hash output of `value` satoshis to `hash`.
pub fn p2pkh_output(value: u64, hash: [u8; 20]) -> TxOut {
    TxOut {
        value: Amount::from_sat(value),
        script_pubkey: ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash)),
    }
}

/// Coinbase-shaped transaction with the given version and outputs.
///
/// A transaction always needs one input to round-trip through the codec, so
/// this one spends the null outpoint.
pub fn coinbase_tx(version: i32, output: Vec<TxOut>) -> Transaction {
    Transaction {
        version: transaction::Version(version),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            ..TxIn::default()
        }],
        output,
    }
}

/// Input spending `previous_output`.
pub fn spending(previous_output: OutPoint) -> TxIn {
    TxIn {
        previous_output,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

/// Assemble a block on `prev_blockhash` and fill in its merkle root.
pub fn build_block(
    prev_blockhash: BlockHash,
    time: u32,
    nonce: u32,
    txdata: Vec<Transaction>,
) -> Block {
    let mut block = Block {
        header: Header {
            version: Version::ONE,
            prev_blockhash,
            merkle_root: TxMerkleNode::all_zeros(),
            time,
            bits: CompactTarget::from_consensus(REGTEST_BITS),
            nonce,
        },
        txdata,
    };
    block.header.merkle_root = block
        .compute_merkle_root()
        .unwrap_or_else(TxMerkleNode::all_zeros);
    block
}
