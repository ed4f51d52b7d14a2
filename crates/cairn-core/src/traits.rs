//! Capability traits consumed by the chain-state engine.
//!
//! - [`BlockTxSource`]: historical blocks and transactions, including blocks
//!   no longer on the active chain.
//! - [`ChainStateStorage`]: the transactional UTXO store.
//! - [`ValidationRules`]: transaction and per-input script rules.

use std::sync::Arc;

use crate::error::CairnError;
use crate::types::{ChainedHeader, Hash256, Transaction, TxInput, TxOutput};
use crate::utxo::{SpentTx, SpentTxKey, UnmintedTx, UnspentTx, UtxoSnapshot};

/// Read access to stored blocks by hash.
///
/// Must answer for any block ever stored, whether or not it is on the
/// active chain, since rollback replay reads rolled-back blocks.
pub trait BlockTxSource: Send + Sync {
    /// Transaction `tx_index` of block `block_hash`, or `None` if unknown.
    fn try_get_transaction(
        &self,
        block_hash: &Hash256,
        tx_index: u32,
    ) -> Result<Option<Arc<Transaction>>, CairnError>;

    /// All transactions of a block in order, paired with their index.
    ///
    /// # Errors
    ///
    /// - [`MissingDataError::Block`](crate::error::MissingDataError::Block) if
    ///   the block is unknown.
    /// - [`CairnError::Consistency`] if the stored transactions do not hash
    ///   to `merkle_root`.
    fn read_block_transactions(
        &self,
        block_hash: &Hash256,
        merkle_root: &Hash256,
    ) -> Result<Vec<(u32, Arc<Transaction>)>, CairnError>;

    /// Chained header for a stored block, or `None` if unknown.
    fn try_get_block_header(
        &self,
        block_hash: &Hash256,
    ) -> Result<Option<ChainedHeader>, CairnError>;

    /// Transactions of the block described by `header`.
    fn read_block(
        &self,
        header: &ChainedHeader,
    ) -> Result<Vec<(u32, Arc<Transaction>)>, CairnError> {
        self.read_block_transactions(&header.hash, &header.header.merkle_root)
    }
}

/// Transactional store for UTXO records, tombstones, rollback records and
/// the persisted chain.
///
/// Mutations made between [`begin_transaction`](Self::begin_transaction) and
/// [`commit_transaction`](Self::commit_transaction) are discarded by
/// [`rollback_transaction`](Self::rollback_transaction). Beginning twice, or
/// committing or rolling back with no open transaction, is a storage error.
///
/// The `try_*` mutators return `Ok(false)` when the precondition does not
/// hold (key already present for adds, absent for removes and updates).
pub trait ChainStateStorage: Send {
    fn contains_unspent_tx(&self, txid: &Hash256) -> Result<bool, CairnError> {
        Ok(self.try_get_unspent_tx(txid)?.is_some())
    }
    fn try_get_unspent_tx(&self, txid: &Hash256) -> Result<Option<UnspentTx>, CairnError>;
    fn try_add_unspent_tx(&mut self, unspent: UnspentTx) -> Result<bool, CairnError>;
    fn try_remove_unspent_tx(&mut self, txid: &Hash256) -> Result<bool, CairnError>;
    fn try_update_unspent_tx(&mut self, unspent: UnspentTx) -> Result<bool, CairnError>;

    fn try_get_spent_tx(&self, key: &SpentTxKey) -> Result<Option<SpentTx>, CairnError>;
    /// Most recent tombstone for `txid` confirmed at or below `max_height`.
    fn try_find_spent_tx(
        &self,
        txid: &Hash256,
        max_height: u64,
    ) -> Result<Option<SpentTx>, CairnError>;
    /// Keyed by [`SpentTx::key`].
    fn try_add_spent_tx(&mut self, spent: SpentTx) -> Result<bool, CairnError>;
    fn try_remove_spent_tx(&mut self, key: &SpentTxKey) -> Result<bool, CairnError>;

    fn try_get_block_unminted_txs(
        &self,
        block_hash: &Hash256,
    ) -> Result<Option<Vec<UnmintedTx>>, CairnError>;
    fn try_add_block_unminted_txs(
        &mut self,
        block_hash: &Hash256,
        unminted: Vec<UnmintedTx>,
    ) -> Result<bool, CairnError>;
    fn try_remove_block_unminted_txs(&mut self, block_hash: &Hash256) -> Result<bool, CairnError>;

    /// Persisted chain, genesis first.
    fn read_chain(&self) -> Result<Vec<ChainedHeader>, CairnError>;
    /// Persist `header` as the new tip.
    fn add_chained_header(&mut self, header: &ChainedHeader) -> Result<(), CairnError>;
    /// Forget `header`, which must be the persisted tip.
    fn remove_chained_header(&mut self, header: &ChainedHeader) -> Result<(), CairnError>;

    fn unspent_tx_count(&self) -> Result<usize, CairnError>;

    /// The current UTXO contents. Later writes do not show through.
    fn snapshot(&self) -> Result<UtxoSnapshot, CairnError>;

    fn begin_transaction(&mut self) -> Result<(), CairnError>;
    fn commit_transaction(&mut self) -> Result<(), CairnError>;
    fn rollback_transaction(&mut self) -> Result<(), CairnError>;
    fn in_transaction(&self) -> bool;
}

/// Consensus rules applied by the validation pipeline.
pub trait ValidationRules: Send + Sync {
    /// Transaction-level rules. `prev_outputs` has one entry per input and is
    /// empty for the coinbase.
    fn validate_transaction(
        &self,
        block: &ChainedHeader,
        tx: &Transaction,
        tx_index: u32,
        prev_outputs: &[TxOutput],
    ) -> Result<(), CairnError>;

    /// Script rules for one input spending `prev_output`.
    fn validate_script(
        &self,
        block: &ChainedHeader,
        tx: &Transaction,
        tx_index: u32,
        input: &TxInput,
        input_index: u32,
        prev_output: &TxOutput,
    ) -> Result<(), CairnError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MissingDataError;
    use crate::types::BlockHeader;
    use std::collections::HashMap;

    // ------------------------------------------------------------------
    // Mock block source
    // ------------------------------------------------------------------

    struct MockSource {
        blocks: HashMap<Hash256, Vec<Arc<Transaction>>>,
    }

    impl BlockTxSource for MockSource {
        fn try_get_transaction(
            &self,
            block_hash: &Hash256,
            tx_index: u32,
        ) -> Result<Option<Arc<Transaction>>, CairnError> {
            Ok(self
                .blocks
                .get(block_hash)
                .and_then(|txs| txs.get(tx_index as usize).cloned()))
        }

        fn read_block_transactions(
            &self,
            block_hash: &Hash256,
            _merkle_root: &Hash256,
        ) -> Result<Vec<(u32, Arc<Transaction>)>, CairnError> {
            let txs = self
                .blocks
                .get(block_hash)
                .ok_or(MissingDataError::Block(*block_hash))?;
            Ok(txs.iter().cloned().enumerate().map(|(i, tx)| (i as u32, tx)).collect())
        }

        fn try_get_block_header(&self, _: &Hash256) -> Result<Option<ChainedHeader>, CairnError> {
            Ok(None)
        }
    }

    fn header() -> ChainedHeader {
        ChainedHeader::genesis(BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp: 0,
            difficulty_target: u64::MAX,
            nonce: 0,
        })
    }

    #[test]
    fn read_block_uses_header_hash() {
        let h = header();
        let tx = Transaction { version: 1, inputs: vec![], outputs: vec![], lock_time: 0 };
        let tx = Arc::new(tx);
        let source = MockSource {
            blocks: HashMap::from([(h.hash, vec![tx.clone(), tx])]),
        };
        let txs = source.read_block(&h).unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[1].0, 1);
    }

    #[test]
    fn read_block_unknown_is_missing_data() {
        let source = MockSource { blocks: HashMap::new() };
        let err = source.read_block(&header()).unwrap_err();
        assert!(matches!(err, CairnError::MissingData(MissingDataError::Block(_))));
    }

    // ------------------------------------------------------------------
    // Object safety
    // ------------------------------------------------------------------

    fn _assert_block_source_object_safe(_: &dyn BlockTxSource) {}
    fn _assert_storage_object_safe(_: &mut dyn ChainStateStorage) {}
    fn _assert_rules_object_safe(_: &dyn ValidationRules) {}
}
