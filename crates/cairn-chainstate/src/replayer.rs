//! Reproduces a block's transactions together with the outputs they spent.
//!
//! A block on the snapshot's chain is replayed in [`ReplayMode::Forward`]:
//! funding locations come from the live UTXO records (or tombstones, once a
//! funding transaction is fully spent), taking the incarnation confirmed at or
//! below the replayed block. A block that has been rolled back is
//! replayed in [`ReplayMode::Rollback`] from the [`UnmintedTx`] records kept
//! when it was undone.
//!
//! ```text
//! feeder ──▶ [loaders] ──▶ [extractors] ──▶ ReplayIter
//!                └──────── errors ────────────▲
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::debug;

use cairn_core::error::{CairnError, MissingDataError};
use cairn_core::traits::BlockTxSource;
use cairn_core::types::{ChainedHeader, Hash256, Transaction};
use cairn_core::utxo::{BlockTxKey, TxWithPrevOutputKeys, TxWithPrevOutputs, UnmintedTx};

use crate::chain_state::ChainState;
use crate::config::ReplayConfig;
use crate::pipeline::{
    LoadedTx, TxCache, extract_prev_outputs, join_workers, load_funding_txs, spawn_worker,
};

/// How a session resolves previous-output locators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// The block is on the snapshot's chain.
    Forward,
    /// The block was rolled back relative to the snapshot.
    Rollback,
}

type ReplayResult = (u32, Result<TxWithPrevOutputs, CairnError>);

/// Starts replay sessions against chain-state snapshots.
pub struct BlockReplayer {
    source: Arc<dyn BlockTxSource>,
    config: ReplayConfig,
}

impl BlockReplayer {
    pub fn new(source: Arc<dyn BlockTxSource>, config: ReplayConfig) -> Self {
        Self { source, config }
    }

    /// Begin replaying `block_hash` against `chain_state`.
    ///
    /// # Errors
    ///
    /// [`MissingDataError::Header`] if the block is neither on the chain nor
    /// known to the source; [`MissingDataError::UnmintedTxs`] if it is off
    /// the chain and its rollback records were not kept.
    pub fn start_replay(
        &self,
        chain_state: &ChainState,
        block_hash: &Hash256,
    ) -> Result<ReplaySession, CairnError> {
        let (header, mode) = match chain_state.chain().get_by_hash(block_hash) {
            Some(header) => (header.clone(), ReplayMode::Forward),
            None => {
                let header = self
                    .source
                    .try_get_block_header(block_hash)?
                    .ok_or(MissingDataError::Header(*block_hash))?;
                if chain_state.block_unminted_txs(block_hash).is_none() {
                    return Err(MissingDataError::UnmintedTxs(*block_hash).into());
                }
                (header, ReplayMode::Rollback)
            }
        };
        debug!(height = header.height, hash = %header.hash, ?mode, "starting replay");
        Ok(ReplaySession {
            source: Arc::clone(&self.source),
            config: self.config.clone(),
            state: chain_state.clone(),
            header: Arc::new(header),
            mode,
            workers: Vec::new(),
        })
    }
}

/// A bounded replay of one block. End it with [`end`](Self::end) to join its
/// workers; dropping it does the same and discards worker errors.
pub struct ReplaySession {
    source: Arc<dyn BlockTxSource>,
    config: ReplayConfig,
    state: ChainState,
    header: Arc<ChainedHeader>,
    mode: ReplayMode,
    workers: Vec<JoinHandle<()>>,
}

impl ReplaySession {
    pub fn mode(&self) -> ReplayMode {
        self.mode
    }

    pub fn header(&self) -> &ChainedHeader {
        &self.header
    }

    /// Lazily yield every transaction of the block, in block order, with the
    /// outputs its inputs spent.
    ///
    /// Transactions that fail to resolve are skipped; after the last
    /// successful item the iterator yields the lowest-index failure, so a
    /// fully consumed iterator always reports whether the replay succeeded.
    pub fn replay_block(&mut self) -> Result<ReplayIter<'_>, CairnError> {
        join_workers(std::mem::take(&mut self.workers))?;

        let txs = self.source.read_block(&self.header)?;
        let items = self.locate_inputs(&txs)?;
        let expected: VecDeque<u32> = items.iter().map(|item| item.tx_index).collect();

        let cache = Arc::new(TxCache::new());
        for item in &items {
            let key = BlockTxKey { block_hash: self.header.hash, tx_index: item.tx_index };
            cache.insert(key, LoadedTx { txid: item.txid, tx: Arc::clone(&item.tx) });
        }

        let capacity = self.config.queue_capacity.max(1);
        let (feed_tx, feed_rx) = bounded::<TxWithPrevOutputKeys>(capacity);
        let (loaded_tx, loaded_rx) = bounded::<(TxWithPrevOutputKeys, Vec<LoadedTx>)>(capacity);
        let (result_tx, result_rx) = bounded::<ReplayResult>(capacity);

        self.workers.push(spawn_worker("cairn-replay-feed".into(), move || {
            for item in items {
                if feed_tx.send(item).is_err() {
                    break;
                }
            }
        })?);

        for i in 0..self.config.loader_threads.max(1) {
            let source = Arc::clone(&self.source);
            let cache = Arc::clone(&cache);
            let (rx, tx, results) = (feed_rx.clone(), loaded_tx.clone(), result_tx.clone());
            self.workers.push(spawn_worker(format!("cairn-replay-load-{i}"), move || {
                run_funding_loader(&*source, &cache, rx, tx, results)
            })?);
        }
        drop((feed_rx, loaded_tx));

        for i in 0..self.config.extractor_threads.max(1) {
            let (rx, results) = (loaded_rx.clone(), result_tx.clone());
            self.workers.push(spawn_worker(format!("cairn-replay-extract-{i}"), move || {
                run_extractor(rx, results)
            })?);
        }
        drop((loaded_rx, result_tx));

        Ok(ReplayIter {
            results: result_rx,
            expected,
            ready: BTreeMap::new(),
            failed: BTreeMap::new(),
            finished: false,
            _session: PhantomData,
        })
    }

    /// Join the session's workers.
    pub fn end(mut self) -> Result<(), CairnError> {
        join_workers(std::mem::take(&mut self.workers))
    }

    /// Pair each transaction with the locators of the transactions funding it.
    fn locate_inputs(
        &self,
        txs: &[(u32, Arc<Transaction>)],
    ) -> Result<Vec<TxWithPrevOutputKeys>, CairnError> {
        let mut unminted = match self.mode {
            ReplayMode::Forward => None,
            ReplayMode::Rollback => Some(
                self.state
                    .block_unminted_txs(&self.header.hash)
                    .ok_or(MissingDataError::UnmintedTxs(self.header.hash))?
                    .iter(),
            ),
        };

        let mut items = Vec::with_capacity(txs.len());
        for (tx_index, tx) in txs {
            let txid = tx.txid()?;
            let prev_output_keys = if *tx_index == 0 && tx.is_coinbase() {
                Vec::new()
            } else {
                match unminted.as_mut() {
                    None => self.forward_keys(tx)?,
                    Some(records) => {
                        let record = records.next().ok_or_else(|| {
                            CairnError::Consistency(format!(
                                "block {} has more transactions than unminted records",
                                self.header.hash
                            ))
                        })?;
                        unminted_keys(record, txid, tx)?
                    }
                }
            };
            items.push(TxWithPrevOutputKeys {
                tx_index: *tx_index,
                txid,
                tx: Arc::clone(tx),
                block: Arc::clone(&self.header),
                prev_output_keys,
            });
        }

        if let Some(mut records) = unminted {
            if let Some(extra) = records.next() {
                return Err(CairnError::Consistency(format!(
                    "unminted record for {} has no transaction in block {}",
                    extra.txid, self.header.hash
                )));
            }
        }
        Ok(items)
    }

    fn forward_keys(&self, tx: &Transaction) -> Result<Vec<BlockTxKey>, CairnError> {
        let block_height = self.header.height;
        tx.inputs
            .iter()
            .map(|input| {
                let txid = &input.previous_output.txid;
                // A live record minted above this block is a later incarnation.
                let live = self
                    .state
                    .try_get_unspent_tx(txid)
                    .filter(|live| live.confirming_block_index <= block_height)
                    .map(|live| (live.confirming_block_index, live.tx_index));
                let (height, tx_index) = match live {
                    Some(found) => found,
                    None => {
                        let tomb = self.state.latest_spent_tx(txid, block_height).ok_or_else(|| {
                            CairnError::Consistency(format!(
                                "no UTXO record for funding transaction {txid}"
                            ))
                        })?;
                        (tomb.confirming_block_index, tomb.tx_index)
                    }
                };
                let block_hash =
                    self.state.chain().get(height).map(|h| h.hash).ok_or_else(|| {
                        CairnError::Consistency(format!(
                            "{txid} confirmed at height {height} beyond chain"
                        ))
                    })?;
                Ok(BlockTxKey { block_hash, tx_index })
            })
            .collect()
    }
}

impl Drop for ReplaySession {
    fn drop(&mut self) {
        let _ = join_workers(std::mem::take(&mut self.workers));
    }
}

fn unminted_keys(
    record: &UnmintedTx,
    txid: Hash256,
    tx: &Transaction,
) -> Result<Vec<BlockTxKey>, CairnError> {
    if record.txid != txid {
        return Err(CairnError::Consistency(format!(
            "unminted record {} does not match transaction {txid}",
            record.txid
        )));
    }
    if record.prev_output_tx_keys.len() != tx.inputs.len() {
        return Err(CairnError::Consistency(format!(
            "unminted record for {txid} has {} locators for {} inputs",
            record.prev_output_tx_keys.len(),
            tx.inputs.len()
        )));
    }
    Ok(record.prev_output_tx_keys.clone())
}

fn run_funding_loader(
    source: &dyn BlockTxSource,
    cache: &TxCache,
    rx: Receiver<TxWithPrevOutputKeys>,
    tx: Sender<(TxWithPrevOutputKeys, Vec<LoadedTx>)>,
    results: Sender<ReplayResult>,
) {
    for item in rx {
        let sent = match load_funding_txs(source, cache, &item) {
            Ok(funding) => tx.send((item, funding)).is_ok(),
            Err(e) => results.send((item.tx_index, Err(e))).is_ok(),
        };
        if !sent {
            break;
        }
    }
}

fn run_extractor(
    rx: Receiver<(TxWithPrevOutputKeys, Vec<LoadedTx>)>,
    results: Sender<ReplayResult>,
) {
    for (item, funding) in rx {
        let tx_index = item.tx_index;
        let result = extract_prev_outputs(&item, &funding).map(|prev_outputs| TxWithPrevOutputs {
            tx_index,
            txid: item.txid,
            tx: item.tx,
            block: item.block,
            prev_outputs,
        });
        if results.send((tx_index, result)).is_err() {
            break;
        }
    }
}

/// Order-restoring view over a replay's results.
pub struct ReplayIter<'a> {
    results: Receiver<ReplayResult>,
    expected: VecDeque<u32>,
    ready: BTreeMap<u32, TxWithPrevOutputs>,
    failed: BTreeMap<u32, CairnError>,
    finished: bool,
    _session: PhantomData<&'a mut ReplaySession>,
}

impl Iterator for ReplayIter<'_> {
    type Item = Result<TxWithPrevOutputs, CairnError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        while let Some(&want) = self.expected.front() {
            if let Some(item) = self.ready.remove(&want) {
                self.expected.pop_front();
                return Some(Ok(item));
            }
            if self.failed.contains_key(&want) {
                self.expected.pop_front();
                continue;
            }
            match self.results.recv() {
                Ok((tx_index, Ok(item))) => {
                    self.ready.insert(tx_index, item);
                }
                Ok((tx_index, Err(e))) => {
                    self.failed.insert(tx_index, e);
                }
                Err(_) => {
                    let stopped = format!("replay workers stopped before transaction {want}");
                    self.failed.insert(want, CairnError::Worker(stopped));
                    self.expected.clear();
                }
            }
        }
        self.finished = true;
        self.failed.pop_first().map(|(_, e)| Err(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlockStore;
    use crate::test_util::{
        add, coinbase, genesis_block, keypair, new_builder, outpoint, owner, spend, test_config,
    };
    use cairn_core::error::ErrorKind;
    use cairn_core::types::TxOutput;

    fn replayer(store: Arc<dyn BlockTxSource>) -> BlockReplayer {
        BlockReplayer::new(
            store,
            ReplayConfig { loader_threads: 2, extractor_threads: 2, queue_capacity: 1 },
        )
    }

    fn collect(session: &mut ReplaySession) -> Vec<Result<TxWithPrevOutputs, CairnError>> {
        session.replay_block().unwrap().collect()
    }

    fn prev_outputs(results: &[Result<TxWithPrevOutputs, CairnError>]) -> Vec<Vec<TxOutput>> {
        results
            .iter()
            .map(|r| r.as_ref().unwrap().prev_outputs.clone())
            .collect()
    }

    // --- Forward ---

    #[test]
    fn forward_replay_in_block_order() {
        let (builder, store) = new_builder(test_config());
        let (_, g_txs) = genesis_block();
        add(&builder, &store, g_txs.clone());
        let split = spend(
            &[(outpoint(&g_txs[0], 0), &keypair(1))],
            &[(20, owner(3)), (30, owner(4))],
        );
        let chained = spend(&[(outpoint(&split, 1), &keypair(4))], &[(30, owner(5))]);
        let txs = vec![coinbase(1, 50, owner(2)), split.clone(), chained.clone()];
        let header = add(&builder, &store, txs);

        let state = builder.to_chain_state().unwrap();
        let mut session = replayer(store).start_replay(&state, &header.hash).unwrap();
        assert_eq!(session.mode(), ReplayMode::Forward);

        let results = collect(&mut session);
        assert_eq!(results.len(), 3);
        let indices: Vec<u32> = results.iter().map(|r| r.as_ref().unwrap().tx_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        let outputs = prev_outputs(&results);
        assert!(outputs[0].is_empty());
        assert_eq!(outputs[1], vec![TxOutput { value: 50, pubkey_hash: owner(1) }]);
        assert_eq!(outputs[2], vec![TxOutput { value: 30, pubkey_hash: owner(4) }]);
        session.end().unwrap();
    }

    #[test]
    fn unknown_block_is_missing_header() {
        let (builder, store) = new_builder(test_config());
        add(&builder, &store, genesis_block().1);
        let state = builder.to_chain_state().unwrap();
        let err = replayer(store).start_replay(&state, &Hash256([9; 32])).err().unwrap();
        assert!(matches!(err, CairnError::MissingData(MissingDataError::Header(_))));
        assert_eq!(err.kind(), ErrorKind::MissingData);
    }

    #[test]
    fn off_chain_block_without_records_is_missing_data() {
        let (builder, store) = new_builder(test_config());
        add(&builder, &store, genesis_block().1);
        let state = builder.to_chain_state().unwrap();
        // Stored but never added to the chain.
        let txs = vec![coinbase(1, 50, owner(2))];
        let header = crate::test_util::header_on(state.tip(), &txs);
        store.add_block(&header, &txs).unwrap();

        let err = replayer(store).start_replay(&state, &header.hash).err().unwrap();
        assert!(matches!(err, CairnError::MissingData(MissingDataError::UnmintedTxs(_))));
    }

    // --- Rollback ---

    #[test]
    fn rollback_replay_matches_forward() {
        let (builder, store) = new_builder(test_config());
        let (_, g_txs) = genesis_block();
        add(&builder, &store, g_txs.clone());
        let split = spend(
            &[(outpoint(&g_txs[0], 0), &keypair(1))],
            &[(20, owner(3)), (30, owner(4))],
        );
        add(&builder, &store, vec![coinbase(1, 50, owner(2)), split.clone()]);
        let pay = spend(
            &[(outpoint(&split, 0), &keypair(3)), (outpoint(&split, 1), &keypair(4))],
            &[(50, owner(5))],
        );
        let txs = vec![coinbase(2, 50, owner(2)), pay];
        let header = add(&builder, &store, txs.clone());

        let replayer = replayer(store);
        let forward_state = builder.to_chain_state().unwrap();
        let mut forward = replayer.start_replay(&forward_state, &header.hash).unwrap();
        let forward_outputs = prev_outputs(&collect(&mut forward));
        forward.end().unwrap();

        builder.rollback_block(&header, &txs).unwrap();
        let rolled_state = builder.to_chain_state().unwrap();
        let mut rollback = replayer.start_replay(&rolled_state, &header.hash).unwrap();
        assert_eq!(rollback.mode(), ReplayMode::Rollback);
        let rollback_outputs = prev_outputs(&collect(&mut rollback));
        assert_eq!(forward_outputs, rollback_outputs);
        assert!(rollback_outputs[0].is_empty());
        rollback.end().unwrap();
    }

    #[test]
    fn replay_surfaces_error_after_partial_results() {
        let (builder, store) = new_builder(test_config());
        let (_, g_txs) = genesis_block();
        add(&builder, &store, g_txs.clone());
        let pay = spend(&[(outpoint(&g_txs[0], 0), &keypair(1))], &[(50, owner(3))]);
        let txs = vec![coinbase(1, 50, owner(2)), pay];
        let header = add(&builder, &store, txs.clone());
        builder.rollback_block(&header, &txs).unwrap();

        // A snapshot whose unminted record points at the wrong funding slot.
        let mut utxo = builder.to_chain_state().unwrap().utxo().clone();
        let records = Arc::make_mut(&mut utxo.unminted).get_mut(&header.hash).unwrap();
        records[0].prev_output_tx_keys[0].tx_index = 7;
        let state = ChainState::new(builder.chain(), utxo);

        let mut session = replayer(store).start_replay(&state, &header.hash).unwrap();
        let results = collect(&mut session);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().tx_index, 0);
        assert!(matches!(
            results[1],
            Err(CairnError::MissingData(MissingDataError::Transaction { tx_index: 7, .. }))
        ));
    }

    #[test]
    fn mismatched_unminted_record_is_consistency() {
        let (builder, store) = new_builder(test_config());
        let (_, g_txs) = genesis_block();
        add(&builder, &store, g_txs.clone());
        let pay = spend(&[(outpoint(&g_txs[0], 0), &keypair(1))], &[(50, owner(3))]);
        let txs = vec![coinbase(1, 50, owner(2)), pay];
        let header = add(&builder, &store, txs.clone());
        builder.rollback_block(&header, &txs).unwrap();

        let mut utxo = builder.to_chain_state().unwrap().utxo().clone();
        Arc::make_mut(&mut utxo.unminted).get_mut(&header.hash).unwrap()[0].txid = Hash256([1; 32]);
        let state = ChainState::new(builder.chain(), utxo);

        let mut session = replayer(store).start_replay(&state, &header.hash).unwrap();
        let err = session.replay_block().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Consistency);
    }

    #[test]
    fn dropping_iterator_early_releases_workers() {
        let (builder, store) = new_builder(test_config());
        let (_, g_txs) = genesis_block();
        add(&builder, &store, g_txs.clone());
        let mut txs = vec![coinbase(1, 50, owner(2))];
        let mut prev = outpoint(&g_txs[0], 0);
        for _ in 0..8 {
            let tx = spend(&[(prev.clone(), &keypair(1))], &[(50, owner(1))]);
            prev = outpoint(&tx, 0);
            txs.push(tx);
        }
        let header = add(&builder, &store, txs);

        let state = builder.to_chain_state().unwrap();
        let mut session = replayer(store).start_replay(&state, &header.hash).unwrap();
        let first = session.replay_block().unwrap().next().unwrap().unwrap();
        assert_eq!(first.tx_index, 0);
        // A second replay joins the first one's workers before starting.
        assert_eq!(collect(&mut session).len(), 9);
        session.end().unwrap();
    }

    #[test]
    fn forward_replay_of_reminted_funding_uses_matching_incarnation() {
        let (builder, store) = new_builder(test_config());
        let (_, g_txs) = genesis_block();
        add(&builder, &store, g_txs);
        let x = coinbase(77, 50, owner(2));
        let b1 = add(&builder, &store, vec![x.clone()]);
        let first_spend = spend(&[(outpoint(&x, 0), &keypair(2))], &[(50, owner(3))]);
        let b2 = add(&builder, &store, vec![coinbase(2, 50, owner(5)), first_spend.clone()]);
        let b3 = add(&builder, &store, vec![x.clone()]);
        let second_spend = spend(&[(outpoint(&x, 0), &keypair(2))], &[(49, owner(6))]);
        let b4 = add(&builder, &store, vec![coinbase(4, 50, owner(5)), second_spend.clone()]);

        let state = builder.to_chain_state().unwrap();
        let replayer = replayer(store);
        for (header, spender, funding_block) in
            [(&b2, &first_spend, &b1), (&b4, &second_spend, &b3)]
        {
            let mut session = replayer.start_replay(&state, &header.hash).unwrap();
            let keys = session.forward_keys(spender).unwrap();
            assert_eq!(keys, vec![BlockTxKey { block_hash: funding_block.hash, tx_index: 0 }]);
            let results = collect(&mut session);
            assert_eq!(prev_outputs(&results)[1], x.outputs);
            session.end().unwrap();
        }
    }

    /// Serves whole blocks but panics when a single funding transaction is read.
    struct PanickingSource(Arc<MemoryBlockStore>);

    impl BlockTxSource for PanickingSource {
        fn try_get_transaction(
            &self,
            block_hash: &Hash256,
            tx_index: u32,
        ) -> Result<Option<Arc<Transaction>>, CairnError> {
            panic!("funding read of {block_hash}:{tx_index} exploded");
        }

        fn read_block_transactions(
            &self,
            block_hash: &Hash256,
            merkle_root: &Hash256,
        ) -> Result<Vec<(u32, Arc<Transaction>)>, CairnError> {
            self.0.read_block_transactions(block_hash, merkle_root)
        }

        fn try_get_block_header(
            &self,
            block_hash: &Hash256,
        ) -> Result<Option<ChainedHeader>, CairnError> {
            self.0.try_get_block_header(block_hash)
        }
    }

    #[test]
    fn panicking_loader_surfaces_as_worker_error() {
        let (builder, store) = new_builder(test_config());
        let (_, g_txs) = genesis_block();
        add(&builder, &store, g_txs.clone());
        let pay = spend(&[(outpoint(&g_txs[0], 0), &keypair(1))], &[(50, owner(3))]);
        let header = add(&builder, &store, vec![coinbase(1, 50, owner(2)), pay]);

        let state = builder.to_chain_state().unwrap();
        let replayer = replayer(Arc::new(PanickingSource(store)));
        let mut session = replayer.start_replay(&state, &header.hash).unwrap();
        let results = collect(&mut session);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().tx_index, 0);
        assert!(matches!(results[1], Err(CairnError::Worker(_))));

        let err = session.end().unwrap_err();
        let CairnError::Worker(message) = &err else { panic!("unexpected {err}") };
        assert!(message.contains("cairn-replay-load"), "{message}");
    }
}
