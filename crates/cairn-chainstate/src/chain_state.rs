//! Immutable chain-state snapshots.

use std::sync::Arc;

use cairn_core::chain::Chain;
use cairn_core::types::{ChainedHeader, Hash256, OutPoint};
use cairn_core::utxo::{OutputState, SpentTx, SpentTxKey, UnmintedTx, UnspentTx, UtxoSnapshot};

/// A chain together with the UTXO contents at its tip.
///
/// Produced by
/// [`ChainStateBuilder::to_chain_state`](crate::builder::ChainStateBuilder::to_chain_state).
/// Shares tables with the storage it was taken from; later writes copy them,
/// so readers never block the builder.
#[derive(Debug, Clone, Default)]
pub struct ChainState {
    chain: Chain,
    utxo: Arc<UtxoSnapshot>,
}

impl ChainState {
    pub fn new(chain: Chain, utxo: UtxoSnapshot) -> Self {
        Self {
            chain,
            utxo: Arc::new(utxo),
        }
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn utxo(&self) -> &UtxoSnapshot {
        &self.utxo
    }

    pub fn tip(&self) -> Option<&ChainedHeader> {
        self.chain.tip()
    }

    pub fn height(&self) -> Option<u64> {
        self.chain.height()
    }

    pub fn contains_block(&self, hash: &Hash256) -> bool {
        self.chain.contains(hash)
    }

    pub fn try_get_unspent_tx(&self, txid: &Hash256) -> Option<&UnspentTx> {
        self.utxo.unspent_tx(txid)
    }

    pub fn try_get_spent_tx(&self, key: &SpentTxKey) -> Option<&SpentTx> {
        self.utxo.spent_tx(key)
    }

    /// The most recent tombstone for `txid` confirmed at or below `max_height`.
    pub fn latest_spent_tx(&self, txid: &Hash256, max_height: u64) -> Option<&SpentTx> {
        self.utxo.latest_spent_tx(txid, max_height)
    }

    pub fn block_unminted_txs(&self, block_hash: &Hash256) -> Option<&[UnmintedTx]> {
        self.utxo.block_unminted_txs(block_hash)
    }

    /// `true` if the output exists and is unspent.
    pub fn is_unspent(&self, outpoint: &OutPoint) -> bool {
        self.utxo.output_state(outpoint) == Some(OutputState::Unspent)
    }

    pub fn unspent_tx_count(&self) -> usize {
        self.utxo.unspent_tx_count()
    }
}
