//! BLAKE3 merkle root over transaction IDs.
//!
//! Leaves hash as `BLAKE3(0x00 || txid)`, interior nodes as
//! `BLAKE3(0x01 || left || right)`. An odd node at any layer is paired with
//! itself. The root of an empty list is [`Hash256::ZERO`].

use crate::error::TransactionError;
use crate::types::{Hash256, Transaction};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

fn leaf_hash(txid: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(txid.as_bytes());
    Hash256(hasher.finalize().into())
}

fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Merkle root of a list of transaction IDs.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    let mut layer: Vec<Hash256> = txids.iter().map(leaf_hash).collect();
    if layer.is_empty() {
        return Hash256::ZERO;
    }
    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| node_hash(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    layer[0]
}

/// Merkle root of a block's ordered transactions.
pub fn block_merkle_root(transactions: &[Transaction]) -> Result<Hash256, TransactionError> {
    let txids = transactions
        .iter()
        .map(Transaction::txid)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(merkle_root(&txids))
}
