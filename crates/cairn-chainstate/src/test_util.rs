//! Block and transaction builders for unit tests.

use std::sync::Arc;

use cairn_core::crypto::{self, KeyPair};
use cairn_core::merkle::block_merkle_root;
use cairn_core::error::CairnError;
use cairn_core::traits::ValidationRules;
use cairn_core::types::{
    BlockHeader, ChainedHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput,
};
use cairn_core::validation::StandardRules;

use crate::builder::ChainStateBuilder;
use crate::config::{BuilderConfig, ValidationConfig};
use crate::memory::{MemoryBlockStore, MemoryChainStateStorage};

/// Simple pubkey hash derived from a seed byte.
pub fn pkh(seed: u8) -> Hash256 {
    Hash256([seed; 32])
}

pub fn keypair(seed: u8) -> KeyPair {
    KeyPair::from_secret_bytes([seed; 32])
}

/// Pubkey hash owned by `keypair(seed)`.
pub fn owner(seed: u8) -> Hash256 {
    keypair(seed).public_key().pubkey_hash()
}

/// Coinbase with height-unique data, so coinbases at different heights differ.
pub fn coinbase(height: u64, value: u64, pubkey_hash: Hash256) -> Transaction {
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

/// Signed transaction spending each `(outpoint, key)` into `outputs`.
pub fn spend(inputs: &[(OutPoint, &KeyPair)], outputs: &[(u64, Hash256)]) -> Transaction {
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
    for (i, (_, key)) in inputs.iter().enumerate() {
        crypto::sign_transaction_input(&mut tx, i, key).unwrap();
    }
    tx
}

pub fn outpoint(tx: &Transaction, index: u64) -> OutPoint {
    OutPoint { txid: tx.txid().unwrap(), index }
}

/// Chained header committing to `txs`, on top of `parent` (or genesis).
pub fn header_on(parent: Option<&ChainedHeader>, txs: &[Transaction]) -> ChainedHeader {
    let header = BlockHeader {
        version: 1,
        prev_hash: parent.map(|p| p.hash).unwrap_or(Hash256::ZERO),
        merkle_root: block_merkle_root(txs).unwrap(),
        timestamp: 1_700_000_000 + parent.map(|p| p.height + 1).unwrap_or(0) * 60,
        difficulty_target: u64::MAX,
        nonce: 0,
    };
    match parent {
        Some(p) => ChainedHeader::from_parent(p, header),
        None => ChainedHeader::genesis(header),
    }
}

/// Genesis paying 50 to `owner(1)`.
pub fn genesis_block() -> (ChainedHeader, Vec<Transaction>) {
    let txs = vec![coinbase(0, 50, owner(1))];
    (header_on(None, &txs), txs)
}

pub fn test_config() -> BuilderConfig {
    BuilderConfig {
        validation: ValidationConfig::minimal(),
        ..BuilderConfig::default()
    }
}

pub fn new_builder(config: BuilderConfig) -> (ChainStateBuilder, Arc<MemoryBlockStore>) {
    let store = Arc::new(MemoryBlockStore::new());
    let builder = ChainStateBuilder::new(
        Box::new(MemoryChainStateStorage::new()),
        store.clone(),
        Arc::new(StandardRules),
        config,
    )
    .unwrap();
    (builder, store)
}

/// Store and add a block on top of the builder's tip.
pub fn add(
    builder: &ChainStateBuilder,
    store: &MemoryBlockStore,
    txs: Vec<Transaction>,
) -> ChainedHeader {
    let tip = builder.chain().tip().cloned();
    let header = header_on(tip.as_ref(), &txs);
    store.add_block(&header, &txs).unwrap();
    builder.add_block(&header, &txs).unwrap();
    header
}

/// Rules that panic on every transaction, to exercise worker failure.
pub struct PanickingRules;

impl ValidationRules for PanickingRules {
    fn validate_transaction(
        &self,
        _: &ChainedHeader,
        tx: &Transaction,
        tx_index: u32,
        _: &[TxOutput],
    ) -> Result<(), CairnError> {
        panic!("rules exploded on tx {tx_index} ({} inputs)", tx.inputs.len());
    }

    fn validate_script(
        &self,
        _: &ChainedHeader,
        _: &Transaction,
        _: u32,
        _: &TxInput,
        _: u32,
        _: &TxOutput,
    ) -> Result<(), CairnError> {
        panic!("rules exploded in script stage");
    }
}
