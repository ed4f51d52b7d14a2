//! Shared test helpers for end-to-end tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use cairn_chainstate::{
    BuilderConfig, ChainStateBuilder, MemoryBlockStore, MemoryChainStateStorage, ValidationConfig,
};
use cairn_core::crypto::{self, KeyPair};
use cairn_core::merkle::block_merkle_root;
use cairn_core::traits::{BlockTxSource, ChainStateStorage};
use cairn_core::types::{
    BlockHeader, ChainedHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput,
};
use cairn_core::utxo::{SpentTx, SpentTxKey, UnspentTx};
use cairn_core::validation::StandardRules;

pub fn keypair(seed: u8) -> KeyPair {
    KeyPair::from_secret_bytes([seed; 32])
}

/// Pubkey hash owned by `keypair(seed)`.
pub fn owner(seed: u8) -> Hash256 {
    keypair(seed).public_key().pubkey_hash()
}

/// Create a coinbase transaction with a unique height marker.
///
/// Sets `lock_time: height` so coinbases at different heights have
/// distinct txids.
pub fn make_coinbase(value: u64, pubkey_hash: Hash256, height: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature: height.to_le_bytes().to_vec(),
            public_key: vec![],
        }],
        outputs: vec![TxOutput { value, pubkey_hash }],
        lock_time: height,
    }
}

/// Create a transaction spending each `(outpoint, signer)` into `outputs`, signed.
pub fn make_tx(inputs: &[(OutPoint, &KeyPair)], outputs: &[(u64, Hash256)]) -> Transaction {
    let mut tx = Transaction {
        version: 1,
        inputs: inputs
            .iter()
            .map(|(op, _)| TxInput {
                previous_output: op.clone(),
                signature: vec![],
                public_key: vec![],
            })
            .collect(),
        outputs: outputs
            .iter()
            .map(|(value, pubkey_hash)| TxOutput { value: *value, pubkey_hash: *pubkey_hash })
            .collect(),
        lock_time: 0,
    };
    for (i, (_, signer)) in inputs.iter().enumerate() {
        crypto::sign_transaction_input(&mut tx, i, signer).unwrap();
    }
    tx
}

pub fn outpoint(tx: &Transaction, index: u64) -> OutPoint {
    OutPoint { txid: tx.txid().unwrap(), index }
}

/// Chained header committing to `txs` on top of `parent`, or a genesis header.
pub fn make_header(parent: Option<&ChainedHeader>, txs: &[Transaction]) -> ChainedHeader {
    let height = parent.map(|p| p.height + 1).unwrap_or(0);
    let header = BlockHeader {
        version: 1,
        prev_hash: parent.map(|p| p.hash).unwrap_or(Hash256::ZERO),
        merkle_root: block_merkle_root(txs).unwrap(),
        timestamp: 1_700_000_000 + height * 60,
        difficulty_target: u64::MAX,
        nonce: 0,
    };
    match parent {
        Some(p) => ChainedHeader::from_parent(p, header),
        None => ChainedHeader::genesis(header),
    }
}

/// Builder settings with small worker pools.
pub fn test_config() -> BuilderConfig {
    BuilderConfig {
        validation: ValidationConfig::minimal(),
        ..BuilderConfig::default()
    }
}

/// Live records and tombstones, ignoring rollback bookkeeping.
pub type UtxoView = (BTreeMap<Hash256, UnspentTx>, BTreeMap<SpentTxKey, SpentTx>);

/// A builder over in-memory storage with its block store.
pub struct TestChain {
    pub builder: ChainStateBuilder,
    pub store: Arc<MemoryBlockStore>,
}

impl TestChain {
    pub fn new(config: BuilderConfig) -> Self {
        Self::with_storage(Box::new(MemoryChainStateStorage::new()), config)
    }

    pub fn with_storage(storage: Box<dyn ChainStateStorage>, config: BuilderConfig) -> Self {
        let store = Arc::new(MemoryBlockStore::new());
        let builder =
            ChainStateBuilder::new(storage, store.clone(), Arc::new(StandardRules), config)
                .unwrap();
        Self { builder, store }
    }

    /// Store a block on top of `parent` without adding it to the chain.
    pub fn store_block(
        &self,
        parent: Option<&ChainedHeader>,
        txs: &[Transaction],
    ) -> ChainedHeader {
        let header = make_header(parent, txs);
        self.store.add_block(&header, txs).unwrap();
        header
    }

    /// Store and add a block on top of the tip.
    pub fn add(&self, txs: Vec<Transaction>) -> ChainedHeader {
        let tip = self.builder.chain().tip().cloned();
        let header = self.store_block(tip.as_ref(), &txs);
        self.builder.add_block(&header, &txs).unwrap();
        header
    }

    /// Add an already stored block.
    pub fn add_stored(&self, header: &ChainedHeader) {
        let txs = self.transactions(header);
        self.builder.add_block(header, &txs).unwrap();
    }

    /// Roll back the tip block.
    pub fn rollback_tip(&self) -> ChainedHeader {
        let tip = self.builder.chain().tip().cloned().unwrap();
        let txs = self.transactions(&tip);
        self.builder.rollback_block(&tip, &txs).unwrap();
        tip
    }

    pub fn transactions(&self, header: &ChainedHeader) -> Vec<Transaction> {
        self.store
            .read_block(header)
            .unwrap()
            .into_iter()
            .map(|(_, tx)| Transaction::clone(&tx))
            .collect()
    }

    pub fn height(&self) -> Option<u64> {
        self.builder.chain().height()
    }

    pub fn utxo_view(&self) -> UtxoView {
        let state = self.builder.to_chain_state().unwrap();
        let utxo = state.utxo();
        (utxo.unspent.as_ref().clone(), utxo.spent.as_ref().clone())
    }

    pub fn header_lookup(&self) -> impl FnMut(&Hash256) -> Option<ChainedHeader> + '_ {
        move |hash: &Hash256| self.store.try_get_block_header(hash).unwrap()
    }
}
