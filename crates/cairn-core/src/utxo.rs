//! UTXO record model.
//!
//! A transaction lives in the UTXO set as an [`UnspentTx`] while at least one
//! of its outputs is unspent. When its last output is spent the live record
//! is replaced by a [`SpentTx`] tombstone so a rollback can rebuild it.
//! A txid may be minted again once its earlier record is fully spent, so
//! tombstones are keyed by [`SpentTxKey`]: txid plus confirming height.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::UtxoError;
use crate::types::{ChainedHeader, Hash256, OutPoint, Transaction, TxOutput};

/// State of one transaction output.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputState {
    Unspent,
    Spent,
}

/// Packed per-output spent/unspent bitset. A set bit means spent.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct OutputStates {
    words: Vec<u64>,
    len: u32,
}

impl OutputStates {
    fn with_fill(len: usize, fill: u64) -> Self {
        let mut words = vec![fill; len.div_ceil(64)];
        let tail = len % 64;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
        Self { words, len: len as u32 }
    }

    /// `len` outputs, all unspent.
    pub fn unspent(len: usize) -> Self {
        Self::with_fill(len, 0)
    }

    /// `len` outputs, all spent.
    pub fn spent(len: usize) -> Self {
        Self::with_fill(len, u64::MAX)
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// State of output `index`, or `None` if out of range.
    pub fn get(&self, index: usize) -> Option<OutputState> {
        if index >= self.len() {
            return None;
        }
        let bit = (self.words[index / 64] >> (index % 64)) & 1;
        Some(if bit == 1 { OutputState::Spent } else { OutputState::Unspent })
    }

    /// Set output `index`. Returns `false` if out of range.
    pub fn set(&mut self, index: usize, state: OutputState) -> bool {
        if index >= self.len() {
            return false;
        }
        let mask = 1u64 << (index % 64);
        match state {
            OutputState::Spent => self.words[index / 64] |= mask,
            OutputState::Unspent => self.words[index / 64] &= !mask,
        }
        true
    }

    pub fn unspent_count(&self) -> usize {
        let spent: u32 = self.words.iter().map(|w| w.count_ones()).sum();
        self.len() - spent as usize
    }

    pub fn all_spent(&self) -> bool {
        self.unspent_count() == 0
    }

    pub fn all_unspent(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }
}

/// Live UTXO record for a transaction with at least one unspent output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct UnspentTx {
    pub txid: Hash256,
    /// Height of the block that confirmed the transaction.
    pub confirming_block_index: u64,
    /// Position of the transaction within that block.
    pub tx_index: u32,
    pub output_states: OutputStates,
}

impl UnspentTx {
    /// Freshly minted record with every output unspent.
    pub fn new(
        txid: Hash256,
        confirming_block_index: u64,
        tx_index: u32,
        output_count: usize,
    ) -> Self {
        Self {
            txid,
            confirming_block_index,
            tx_index,
            output_states: OutputStates::unspent(output_count),
        }
    }

    /// Mark the output at `outpoint` spent.
    ///
    /// # Errors
    ///
    /// [`UtxoError::OutputIndexOutOfRange`] or [`UtxoError::DoubleSpend`].
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<(), UtxoError> {
        let index = self.checked_index(outpoint)?;
        match self.output_states.get(index) {
            Some(OutputState::Unspent) => {
                self.output_states.set(index, OutputState::Spent);
                Ok(())
            }
            _ => Err(UtxoError::DoubleSpend(outpoint.clone())),
        }
    }

    /// Mark the output at `outpoint` unspent again.
    ///
    /// # Errors
    ///
    /// [`UtxoError::OutputIndexOutOfRange`] or
    /// [`UtxoError::RestoreUnspentOutput`] if it was not spent.
    pub fn unspend(&mut self, outpoint: &OutPoint) -> Result<(), UtxoError> {
        let index = self.checked_index(outpoint)?;
        match self.output_states.get(index) {
            Some(OutputState::Spent) => {
                self.output_states.set(index, OutputState::Unspent);
                Ok(())
            }
            _ => Err(UtxoError::RestoreUnspentOutput(outpoint.clone())),
        }
    }

    fn checked_index(&self, outpoint: &OutPoint) -> Result<usize, UtxoError> {
        usize::try_from(outpoint.index)
            .ok()
            .filter(|i| *i < self.output_states.len())
            .ok_or_else(|| UtxoError::OutputIndexOutOfRange {
                outpoint: outpoint.clone(),
                count: self.output_states.len(),
            })
    }

    pub fn is_fully_spent(&self) -> bool {
        self.output_states.all_spent()
    }

    /// Tombstone retaining this record's location and output count.
    pub fn to_spent_tx(&self) -> SpentTx {
        SpentTx {
            txid: self.txid,
            confirming_block_index: self.confirming_block_index,
            tx_index: self.tx_index,
            output_count: self.output_states.len() as u32,
        }
    }
}

/// Tombstone for a transaction whose outputs have all been spent.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct SpentTx {
    pub txid: Hash256,
    pub confirming_block_index: u64,
    pub tx_index: u32,
    pub output_count: u32,
}

impl SpentTx {
    pub fn key(&self) -> SpentTxKey {
        SpentTxKey {
            txid: self.txid,
            confirming_block_index: self.confirming_block_index,
        }
    }

    /// Rebuild the live record with every output spent.
    pub fn to_unspent_tx(&self) -> UnspentTx {
        UnspentTx {
            txid: self.txid,
            confirming_block_index: self.confirming_block_index,
            tx_index: self.tx_index,
            output_states: OutputStates::spent(self.output_count as usize),
        }
    }
}

/// Tombstone key. Orders by txid, then confirming height.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct SpentTxKey {
    pub txid: Hash256,
    pub confirming_block_index: u64,
}

impl SpentTxKey {
    pub fn new(txid: Hash256, confirming_block_index: u64) -> Self {
        Self { txid, confirming_block_index }
    }

    /// Storage key: txid then big-endian height, so keys sort like `Ord`.
    pub fn to_bytes(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..32].copy_from_slice(self.txid.as_bytes());
        out[32..].copy_from_slice(&self.confirming_block_index.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let txid: [u8; 32] = bytes.get(..32)?.try_into().ok()?;
        let height: [u8; 8] = bytes.get(32..)?.try_into().ok()?;
        Some(Self::new(Hash256(txid), u64::from_be_bytes(height)))
    }
}

/// Locator of the transaction that funded an output.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockTxKey {
    pub block_hash: Hash256,
    pub tx_index: u32,
}

/// Rollback record for a non-coinbase transaction, preserving where each
/// of its inputs was funded from.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct UnmintedTx {
    pub txid: Hash256,
    /// One locator per input, in input order.
    pub prev_output_tx_keys: Vec<BlockTxKey>,
}

/// A transaction queued for previous-output loading.
#[derive(Clone, Debug)]
pub struct TxWithPrevOutputKeys {
    pub tx_index: u32,
    pub txid: Hash256,
    pub tx: Arc<Transaction>,
    pub block: Arc<ChainedHeader>,
    /// One locator per input. Empty for the coinbase.
    pub prev_output_keys: Vec<BlockTxKey>,
}

/// A transaction paired with the outputs its inputs spend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxWithPrevOutputs {
    pub tx_index: u32,
    pub txid: Hash256,
    pub tx: Arc<Transaction>,
    pub block: Arc<ChainedHeader>,
    /// One output per input. Empty for the coinbase.
    pub prev_outputs: Vec<TxOutput>,
}

impl TxWithPrevOutputs {
    pub fn is_coinbase(&self) -> bool {
        self.tx_index == 0 && self.tx.is_coinbase()
    }
}

/// A storage backend's UTXO contents at one point in time.
///
/// The tables are shared with the backend; a backend copies a table on its
/// first write after a snapshot was taken.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UtxoSnapshot {
    pub unspent: Arc<BTreeMap<Hash256, UnspentTx>>,
    pub spent: Arc<BTreeMap<SpentTxKey, SpentTx>>,
    pub unminted: Arc<BTreeMap<Hash256, Vec<UnmintedTx>>>,
}

impl UtxoSnapshot {
    pub fn unspent_tx(&self, txid: &Hash256) -> Option<&UnspentTx> {
        self.unspent.get(txid)
    }

    pub fn spent_tx(&self, key: &SpentTxKey) -> Option<&SpentTx> {
        self.spent.get(key)
    }

    /// Most recent tombstone for `txid` confirmed at or below `max_height`.
    pub fn latest_spent_tx(&self, txid: &Hash256, max_height: u64) -> Option<&SpentTx> {
        latest_spent_in(&self.spent, txid, max_height)
    }

    /// Whether any tombstone exists for `txid`.
    pub fn has_spent_tx(&self, txid: &Hash256) -> bool {
        self.latest_spent_tx(txid, u64::MAX).is_some()
    }

    pub fn block_unminted_txs(&self, block_hash: &Hash256) -> Option<&[UnmintedTx]> {
        self.unminted.get(block_hash).map(Vec::as_slice)
    }

    /// State of the output at `outpoint`, or `None` if no live record has it.
    pub fn output_state(&self, outpoint: &OutPoint) -> Option<OutputState> {
        let index = usize::try_from(outpoint.index).ok()?;
        self.unspent.get(&outpoint.txid)?.output_states.get(index)
    }

    pub fn unspent_tx_count(&self) -> usize {
        self.unspent.len()
    }

    /// Total unspent outputs across all live records.
    pub fn unspent_output_count(&self) -> usize {
        self.unspent
            .values()
            .map(|u| u.output_states.unspent_count())
            .sum()
    }
}

/// Range lookup shared by snapshots and in-memory backends.
pub fn latest_spent_in<'a>(
    spent: &'a BTreeMap<SpentTxKey, SpentTx>,
    txid: &Hash256,
    max_height: u64,
) -> Option<&'a SpentTx> {
    spent
        .range(SpentTxKey::new(*txid, 0)..=SpentTxKey::new(*txid, max_height))
        .next_back()
        .map(|(_, tomb)| tomb)
}
