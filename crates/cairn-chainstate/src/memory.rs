//! In-memory storage backend and block store.
//!
//! [`MemoryChainStateStorage`] records an undo journal while a transaction is
//! open and replays it backwards on rollback. Writes outside a transaction
//! apply immediately. Tables sit behind `Arc`s so snapshots share them; the
//! first write after a snapshot copies the table it touches.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use cairn_core::error::{CairnError, MissingDataError};
use cairn_core::merkle::merkle_root;
use cairn_core::traits::{BlockTxSource, ChainStateStorage};
use cairn_core::types::{ChainedHeader, Hash256, Transaction};
use cairn_core::utxo::{SpentTx, SpentTxKey, UnmintedTx, UnspentTx, UtxoSnapshot, latest_spent_in};

/// Prior value of one mutated key.
#[derive(Debug)]
enum Undo {
    Unspent(Hash256, Option<UnspentTx>),
    Spent(SpentTxKey, Option<SpentTx>),
    Unminted(Hash256, Option<Vec<UnmintedTx>>),
    ChainPush,
    ChainPop(ChainedHeader),
}

/// Journaled in-memory [`ChainStateStorage`].
#[derive(Debug, Default)]
pub struct MemoryChainStateStorage {
    unspent: Arc<BTreeMap<Hash256, UnspentTx>>,
    spent: Arc<BTreeMap<SpentTxKey, SpentTx>>,
    unminted: Arc<BTreeMap<Hash256, Vec<UnmintedTx>>>,
    chain: Vec<ChainedHeader>,
    journal: Option<Vec<Undo>>,
}

impl MemoryChainStateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, undo: Undo) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(undo);
        }
    }

    fn put_unspent(&mut self, txid: Hash256, value: Option<UnspentTx>) {
        let table = Arc::make_mut(&mut self.unspent);
        let prior = match value {
            Some(v) => table.insert(txid, v),
            None => table.remove(&txid),
        };
        self.record(Undo::Unspent(txid, prior));
    }

    fn put_spent(&mut self, key: SpentTxKey, value: Option<SpentTx>) {
        let table = Arc::make_mut(&mut self.spent);
        let prior = match value {
            Some(v) => table.insert(key, v),
            None => table.remove(&key),
        };
        self.record(Undo::Spent(key, prior));
    }

    fn put_unminted(&mut self, block_hash: Hash256, value: Option<Vec<UnmintedTx>>) {
        let table = Arc::make_mut(&mut self.unminted);
        let prior = match value {
            Some(v) => table.insert(block_hash, v),
            None => table.remove(&block_hash),
        };
        self.record(Undo::Unminted(block_hash, prior));
    }

    fn restore<K: Ord + Clone, V: Clone>(map: &mut Arc<BTreeMap<K, V>>, key: K, prior: Option<V>) {
        let map = Arc::make_mut(map);
        match prior {
            Some(v) => {
                map.insert(key, v);
            }
            None => {
                map.remove(&key);
            }
        }
    }
}

impl ChainStateStorage for MemoryChainStateStorage {
    fn try_get_unspent_tx(&self, txid: &Hash256) -> Result<Option<UnspentTx>, CairnError> {
        Ok(self.unspent.get(txid).cloned())
    }

    fn try_add_unspent_tx(&mut self, unspent: UnspentTx) -> Result<bool, CairnError> {
        if self.unspent.contains_key(&unspent.txid) {
            return Ok(false);
        }
        self.put_unspent(unspent.txid, Some(unspent));
        Ok(true)
    }

    fn try_remove_unspent_tx(&mut self, txid: &Hash256) -> Result<bool, CairnError> {
        if !self.unspent.contains_key(txid) {
            return Ok(false);
        }
        self.put_unspent(*txid, None);
        Ok(true)
    }

    fn try_update_unspent_tx(&mut self, unspent: UnspentTx) -> Result<bool, CairnError> {
        if !self.unspent.contains_key(&unspent.txid) {
            return Ok(false);
        }
        self.put_unspent(unspent.txid, Some(unspent));
        Ok(true)
    }

    fn try_get_spent_tx(&self, key: &SpentTxKey) -> Result<Option<SpentTx>, CairnError> {
        Ok(self.spent.get(key).cloned())
    }

    fn try_find_spent_tx(
        &self,
        txid: &Hash256,
        max_height: u64,
    ) -> Result<Option<SpentTx>, CairnError> {
        Ok(latest_spent_in(&self.spent, txid, max_height).cloned())
    }

    fn try_add_spent_tx(&mut self, spent: SpentTx) -> Result<bool, CairnError> {
        let key = spent.key();
        if self.spent.contains_key(&key) {
            return Ok(false);
        }
        self.put_spent(key, Some(spent));
        Ok(true)
    }

    fn try_remove_spent_tx(&mut self, key: &SpentTxKey) -> Result<bool, CairnError> {
        if !self.spent.contains_key(key) {
            return Ok(false);
        }
        self.put_spent(*key, None);
        Ok(true)
    }

    fn try_get_block_unminted_txs(
        &self,
        block_hash: &Hash256,
    ) -> Result<Option<Vec<UnmintedTx>>, CairnError> {
        Ok(self.unminted.get(block_hash).cloned())
    }

    fn try_add_block_unminted_txs(
        &mut self,
        block_hash: &Hash256,
        unminted: Vec<UnmintedTx>,
    ) -> Result<bool, CairnError> {
        if self.unminted.contains_key(block_hash) {
            return Ok(false);
        }
        self.put_unminted(*block_hash, Some(unminted));
        Ok(true)
    }

    fn try_remove_block_unminted_txs(&mut self, block_hash: &Hash256) -> Result<bool, CairnError> {
        if !self.unminted.contains_key(block_hash) {
            return Ok(false);
        }
        self.put_unminted(*block_hash, None);
        Ok(true)
    }

    fn read_chain(&self) -> Result<Vec<ChainedHeader>, CairnError> {
        Ok(self.chain.clone())
    }

    fn add_chained_header(&mut self, header: &ChainedHeader) -> Result<(), CairnError> {
        if header.height != self.chain.len() as u64 {
            return Err(CairnError::Storage(format!(
                "chained header {} at height {} does not follow stored height {}",
                header.hash,
                header.height,
                self.chain.len()
            )));
        }
        self.chain.push(header.clone());
        self.record(Undo::ChainPush);
        Ok(())
    }

    fn remove_chained_header(&mut self, header: &ChainedHeader) -> Result<(), CairnError> {
        match self.chain.last() {
            Some(tip) if tip.hash == header.hash => {}
            _ => {
                return Err(CairnError::Storage(format!(
                    "chained header {} is not the stored tip",
                    header.hash
                )));
            }
        }
        if let Some(removed) = self.chain.pop() {
            self.record(Undo::ChainPop(removed));
        }
        Ok(())
    }

    fn unspent_tx_count(&self) -> Result<usize, CairnError> {
        Ok(self.unspent.len())
    }

    fn snapshot(&self) -> Result<UtxoSnapshot, CairnError> {
        Ok(UtxoSnapshot {
            unspent: Arc::clone(&self.unspent),
            spent: Arc::clone(&self.spent),
            unminted: Arc::clone(&self.unminted),
        })
    }

    fn begin_transaction(&mut self) -> Result<(), CairnError> {
        if self.journal.is_some() {
            return Err(CairnError::Storage("transaction already open".into()));
        }
        self.journal = Some(Vec::new());
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), CairnError> {
        self.journal
            .take()
            .map(|_| ())
            .ok_or_else(|| CairnError::Storage("no open transaction to commit".into()))
    }

    fn rollback_transaction(&mut self) -> Result<(), CairnError> {
        let journal = self
            .journal
            .take()
            .ok_or_else(|| CairnError::Storage("no open transaction to roll back".into()))?;
        for undo in journal.into_iter().rev() {
            match undo {
                Undo::Unspent(k, prior) => Self::restore(&mut self.unspent, k, prior),
                Undo::Spent(k, prior) => Self::restore(&mut self.spent, k, prior),
                Undo::Unminted(k, prior) => Self::restore(&mut self.unminted, k, prior),
                Undo::ChainPush => {
                    self.chain.pop();
                }
                Undo::ChainPop(header) => self.chain.push(header),
            }
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.journal.is_some()
    }
}

#[derive(Debug, Clone)]
struct StoredBlock {
    header: ChainedHeader,
    txs: Vec<Arc<Transaction>>,
    txids: Vec<Hash256>,
}

/// In-memory [`BlockTxSource`]. Blocks are never evicted, so rolled-back
/// blocks stay readable.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Hash256, StoredBlock>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a block. Replaces any earlier copy with the same hash.
    pub fn add_block(
        &self,
        header: &ChainedHeader,
        transactions: &[Transaction],
    ) -> Result<(), CairnError> {
        let txids = transactions
            .iter()
            .map(Transaction::txid)
            .collect::<Result<Vec<_>, _>>()?;
        let txs = transactions.iter().cloned().map(Arc::new).collect();
        self.blocks.write().insert(
            header.hash,
            StoredBlock {
                header: header.clone(),
                txs,
                txids,
            },
        );
        Ok(())
    }
}

impl BlockTxSource for MemoryBlockStore {
    fn try_get_transaction(
        &self,
        block_hash: &Hash256,
        tx_index: u32,
    ) -> Result<Option<Arc<Transaction>>, CairnError> {
        Ok(self
            .blocks
            .read()
            .get(block_hash)
            .and_then(|b| b.txs.get(tx_index as usize).cloned()))
    }

    fn read_block_transactions(
        &self,
        block_hash: &Hash256,
        expected_root: &Hash256,
    ) -> Result<Vec<(u32, Arc<Transaction>)>, CairnError> {
        let blocks = self.blocks.read();
        let block = blocks
            .get(block_hash)
            .ok_or(MissingDataError::Block(*block_hash))?;
        if merkle_root(&block.txids) != *expected_root {
            return Err(CairnError::Consistency(format!(
                "stored transactions of block {block_hash} do not match merkle root {expected_root}"
            )));
        }
        Ok(block
            .txs
            .iter()
            .enumerate()
            .map(|(i, tx)| (i as u32, Arc::clone(tx)))
            .collect())
    }

    fn try_get_block_header(
        &self,
        block_hash: &Hash256,
    ) -> Result<Option<ChainedHeader>, CairnError> {
        Ok(self.blocks.read().get(block_hash).map(|b| b.header.clone()))
    }
}
