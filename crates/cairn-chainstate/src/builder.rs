//! Applies blocks to, and rolls blocks back from, the UTXO set.
//!
//! Every [`add_block`](ChainStateBuilder::add_block) and
//! [`rollback_block`](ChainStateBuilder::rollback_block) runs inside one
//! storage transaction: begin, mutate, commit, or roll the storage
//! transaction back on any error so the UTXO set is left as it was.
//!
//! Adding a block, per transaction in block order:
//! - spend each input (skipped for the coinbase), tombstoning funding
//!   transactions whose outputs become fully spent;
//! - mint the transaction's outputs;
//! - queue the transaction with its funding locators into the validation
//!   pipeline.
//!
//! Rolling back walks the block in reverse: unmint, then unspend inputs in
//! reverse, restoring tombstoned records. The funding locators of each
//! non-coinbase transaction are kept as [`UnmintedTx`] records so the block
//! can still be replayed after it leaves the chain.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use cairn_core::chain::{Chain, ChainBuilder};
use cairn_core::constants::is_duplicate_coinbase;
use cairn_core::error::{CairnError, ChainError, UtxoError, ValidationErrors};
use cairn_core::merkle::merkle_root;
use cairn_core::traits::{BlockTxSource, ChainStateStorage, ValidationRules};
use cairn_core::types::{ChainedHeader, Hash256, OutPoint, Transaction};
use cairn_core::utxo::{BlockTxKey, TxWithPrevOutputKeys, UnmintedTx, UnspentTx};

use crate::chain_state::ChainState;
use crate::config::BuilderConfig;
use crate::events::ChainStateEvent;
use crate::pipeline::{PipelineContext, ValidationPipeline};
use crate::stats::BuilderStats;

struct BuilderInner {
    storage: Box<dyn ChainStateStorage>,
    chain: ChainBuilder,
    stats: BuilderStats,
}

/// Owns the mutable chain state. One add or rollback runs at a time.
pub struct ChainStateBuilder {
    inner: Mutex<BuilderInner>,
    source: Arc<dyn BlockTxSource>,
    rules: Arc<dyn ValidationRules>,
    config: BuilderConfig,
    events: broadcast::Sender<ChainStateEvent>,
}

impl ChainStateBuilder {
    /// Open a builder over `storage`, reloading the chain it persisted.
    pub fn new(
        storage: Box<dyn ChainStateStorage>,
        source: Arc<dyn BlockTxSource>,
        rules: Arc<dyn ValidationRules>,
        config: BuilderConfig,
    ) -> Result<Self, CairnError> {
        if storage.in_transaction() {
            return Err(CairnError::Storage(
                "storage has an open transaction".into(),
            ));
        }
        let chain = ChainBuilder::from_headers(storage.read_chain()?)?;
        info!(
            height = ?chain.tip().map(|t| t.height),
            unspent_txs = storage.unspent_tx_count()?,
            "opened chain state"
        );
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Ok(Self {
            inner: Mutex::new(BuilderInner {
                storage,
                chain,
                stats: BuilderStats::default(),
            }),
            source,
            rules,
            config,
            events,
        })
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Immutable copy of the current chain.
    pub fn chain(&self) -> Chain {
        self.inner.lock().chain.to_chain()
    }

    /// Immutable snapshot of the chain and UTXO set.
    pub fn to_chain_state(&self) -> Result<ChainState, CairnError> {
        let inner = self.inner.lock();
        Ok(ChainState::new(inner.chain.to_chain(), inner.storage.snapshot()?))
    }

    pub fn stats(&self) -> BuilderStats {
        self.inner.lock().stats.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainStateEvent> {
        self.events.subscribe()
    }

    /// Apply `header` and its ordered transactions on top of the current tip.
    ///
    /// # Errors
    ///
    /// Chain errors if `header` does not extend the tip; UTXO errors for
    /// double spends, missing outputs and duplicate transactions; a
    /// [`ValidationErrors`] aggregate for pipeline faults. The UTXO set is
    /// unchanged after any error.
    pub fn add_block(
        &self,
        header: &ChainedHeader,
        txs: &[Transaction],
    ) -> Result<(), CairnError> {
        let started = Instant::now();
        let mut inner = self.inner.lock();

        let txids = match self.prepare(&inner.chain, header, txs, Direction::Add) {
            Ok(txids) => txids,
            Err(e) => return Err(self.fail(header, e)),
        };

        let result = inner.storage.begin_transaction().and_then(|()| {
            let applied = self.apply_block(&mut inner, header, txs, &txids)?;
            inner.storage.commit_transaction()?;
            Ok(applied)
        });
        let (inputs, validation_time) = match result {
            Ok(applied) => applied,
            Err(e) => {
                Self::abort(&mut inner);
                return Err(self.fail(header, e));
            }
        };

        inner.chain.add_block(header.clone())?;
        inner.stats.record_add(txs.len(), inputs, started.elapsed(), validation_time);
        debug!(
            height = header.height,
            hash = %header.hash,
            txs = txs.len(),
            inputs,
            "added block"
        );
        self.maybe_log_stats(&inner.stats);
        drop(inner);

        let _ = self.events.send(ChainStateEvent::BlockAdded {
            hash: header.hash,
            height: header.height,
            tx_count: txs.len(),
        });
        let _ = self.events.send(ChainStateEvent::ChainStateChanged {
            tip: Some(header.hash),
            height: Some(header.height),
        });
        Ok(())
    }

    /// Undo `header`, which must be the current tip, given its ordered transactions.
    pub fn rollback_block(
        &self,
        header: &ChainedHeader,
        txs: &[Transaction],
    ) -> Result<(), CairnError> {
        let started = Instant::now();
        let mut inner = self.inner.lock();

        let txids = match self.prepare(&inner.chain, header, txs, Direction::Rollback) {
            Ok(txids) => txids,
            Err(e) => return Err(self.fail(header, e)),
        };

        let result = inner.storage.begin_transaction().and_then(|()| {
            self.revert_block(&mut inner, header, txs, &txids)?;
            inner.storage.commit_transaction()
        });
        if let Err(e) = result {
            Self::abort(&mut inner);
            return Err(self.fail(header, e));
        }

        inner.chain.remove_block(header)?;
        inner.stats.record_rollback(started.elapsed());
        let tip = inner.chain.tip().map(|t| (t.hash, t.height));
        debug!(height = header.height, hash = %header.hash, "rolled back block");
        drop(inner);

        let _ = self.events.send(ChainStateEvent::BlockRolledBack {
            hash: header.hash,
            height: header.height,
        });
        let _ = self.events.send(ChainStateEvent::ChainStateChanged {
            tip: tip.map(|(hash, _)| hash),
            height: tip.map(|(_, height)| height),
        });
        Ok(())
    }

    /// Position and merkle checks made before any storage is touched.
    fn prepare(
        &self,
        chain: &ChainBuilder,
        header: &ChainedHeader,
        txs: &[Transaction],
        direction: Direction,
    ) -> Result<Vec<Hash256>, CairnError> {
        match direction {
            Direction::Add => chain.check_next(header)?,
            Direction::Rollback => match chain.tip() {
                Some(tip) if tip.hash == header.hash => {}
                Some(_) => return Err(ChainError::NotTip(header.hash).into()),
                None => return Err(ChainError::EmptyChain.into()),
            },
        }
        let txids = txs
            .iter()
            .map(Transaction::txid)
            .collect::<Result<Vec<_>, _>>()?;
        if merkle_root(&txids) != header.header.merkle_root {
            return Err(ChainError::MerkleMismatch(header.hash).into());
        }
        Ok(txids)
    }

    fn apply_block(
        &self,
        inner: &mut BuilderInner,
        header: &ChainedHeader,
        txs: &[Transaction],
        txids: &[Hash256],
    ) -> Result<(usize, Duration), CairnError> {
        let block = Arc::new(header.clone());
        let shared: Vec<Arc<Transaction>> = txs.iter().cloned().map(Arc::new).collect();

        let pipeline = if self.config.validation.bypass_validation {
            None
        } else {
            let context = Arc::new(PipelineContext::new());
            for (i, (tx, txid)) in shared.iter().zip(txids).enumerate() {
                let key = BlockTxKey { block_hash: header.hash, tx_index: i as u32 };
                context.seed(key, *txid, Arc::clone(tx));
            }
            Some(ValidationPipeline::start(
                Arc::clone(&self.source),
                Arc::clone(&self.rules),
                &self.config.validation,
                context,
            )?)
        };

        let mut inputs = 0;
        for (i, (tx, txid)) in shared.iter().zip(txids).enumerate() {
            let tx_index = i as u32;
            let prev_output_keys = if spends_inputs(i, tx) {
                inputs += tx.inputs.len();
                tx.inputs
                    .iter()
                    .map(|input| Self::spend_output(inner, header, &input.previous_output))
                    .collect::<Result<Vec<_>, _>>()?
            } else {
                Vec::new()
            };
            self.mint(inner, header, *txid, tx_index, tx.outputs.len())?;

            if let Some(pipeline) = pipeline.as_ref() {
                pipeline.submit(TxWithPrevOutputKeys {
                    tx_index,
                    txid: *txid,
                    tx: Arc::clone(tx),
                    block: Arc::clone(&block),
                    prev_output_keys,
                })?;
            }
        }

        let validation_started = Instant::now();
        if let Some(pipeline) = pipeline {
            let errors = pipeline.finish()?;
            self.check_validation(header, errors)?;
        }
        let validation_time = validation_started.elapsed();

        inner.storage.try_remove_block_unminted_txs(&header.hash)?;
        inner.storage.add_chained_header(header)?;
        Ok((inputs, validation_time))
    }

    fn revert_block(
        &self,
        inner: &mut BuilderInner,
        header: &ChainedHeader,
        txs: &[Transaction],
        txids: &[Hash256],
    ) -> Result<(), CairnError> {
        let mut unminted = Vec::with_capacity(txs.len());
        for (i, (tx, txid)) in txs.iter().zip(txids).enumerate().rev() {
            self.unmint(inner, header, *txid)?;
            if spends_inputs(i, tx) {
                let mut keys = Vec::with_capacity(tx.inputs.len());
                for input in tx.inputs.iter().rev() {
                    keys.push(Self::unspend_output(inner, header, &input.previous_output)?);
                }
                keys.reverse();
                unminted.push(UnmintedTx {
                    txid: *txid,
                    prev_output_tx_keys: keys,
                });
            }
        }
        unminted.reverse();

        inner.storage.try_remove_block_unminted_txs(&header.hash)?;
        inner.storage.try_add_block_unminted_txs(&header.hash, unminted)?;
        inner.storage.remove_chained_header(header)?;
        Ok(())
    }

    fn mint(
        &self,
        inner: &mut BuilderInner,
        header: &ChainedHeader,
        txid: Hash256,
        tx_index: u32,
        output_count: usize,
    ) -> Result<(), CairnError> {
        if is_duplicate_coinbase(&self.config.duplicate_coinbases, header.height, &txid) {
            debug!(height = header.height, %txid, "skipping mint of duplicate coinbase");
            return Ok(());
        }
        let unspent = UnspentTx::new(txid, header.height, tx_index, output_count);
        if !inner.storage.try_add_unspent_tx(unspent)? {
            return Err(UtxoError::DuplicateTransaction(txid).into());
        }
        Ok(())
    }

    fn unmint(
        &self,
        inner: &mut BuilderInner,
        header: &ChainedHeader,
        txid: Hash256,
    ) -> Result<(), CairnError> {
        if is_duplicate_coinbase(&self.config.duplicate_coinbases, header.height, &txid) {
            debug!(height = header.height, %txid, "skipping unmint of duplicate coinbase");
            return Ok(());
        }
        let record = inner
            .storage
            .try_get_unspent_tx(&txid)?
            .ok_or(UtxoError::UnmintMissing(txid))?;
        if !record.output_states.all_unspent() {
            return Err(UtxoError::UnmintPartiallySpent(txid).into());
        }
        if record.confirming_block_index != header.height {
            return Err(CairnError::Consistency(format!(
                "unminting {txid} from height {} but it was confirmed at {}",
                header.height, record.confirming_block_index
            )));
        }
        inner.storage.try_remove_unspent_tx(&txid)?;
        Ok(())
    }

    fn spend_output(
        inner: &mut BuilderInner,
        header: &ChainedHeader,
        outpoint: &OutPoint,
    ) -> Result<BlockTxKey, CairnError> {
        let mut record = inner
            .storage
            .try_get_unspent_tx(&outpoint.txid)?
            .ok_or_else(|| UtxoError::MissingOutput(outpoint.clone()))?;
        record.spend(outpoint)?;
        let key = locate(&inner.chain, header, &record)?;

        if record.is_fully_spent() {
            inner.storage.try_remove_unspent_tx(&record.txid)?;
            if !inner.storage.try_add_spent_tx(record.to_spent_tx())? {
                return Err(CairnError::Consistency(format!(
                    "tombstone for {} already exists",
                    record.txid
                )));
            }
        } else if !inner.storage.try_update_unspent_tx(record)? {
            return Err(CairnError::Consistency(format!(
                "live record for {} vanished during spend",
                outpoint.txid
            )));
        }
        Ok(key)
    }

    fn unspend_output(
        inner: &mut BuilderInner,
        header: &ChainedHeader,
        outpoint: &OutPoint,
    ) -> Result<BlockTxKey, CairnError> {
        let record = match inner.storage.try_get_unspent_tx(&outpoint.txid)? {
            Some(mut live) => {
                live.unspend(outpoint)?;
                inner.storage.try_update_unspent_tx(live.clone())?;
                live
            }
            None => {
                // A txid can be tombstoned more than once; the incarnation
                // this block spent is the latest one confirmed at or below it.
                let tombstone = inner
                    .storage
                    .try_find_spent_tx(&outpoint.txid, header.height)?
                    .ok_or_else(|| {
                        CairnError::Consistency(format!(
                            "no live record or tombstone for {outpoint}"
                        ))
                    })?;
                let mut restored = tombstone.to_unspent_tx();
                restored.unspend(outpoint).map_err(|e| match e {
                    UtxoError::OutputIndexOutOfRange { outpoint, count } => {
                        CairnError::Consistency(format!(
                            "tombstone for {} has {count} outputs, cannot restore {outpoint}",
                            outpoint.txid
                        ))
                    }
                    other => other.into(),
                })?;
                inner.storage.try_remove_spent_tx(&tombstone.key())?;
                if !inner.storage.try_add_unspent_tx(restored.clone())? {
                    return Err(CairnError::Consistency(format!(
                        "live record for {} reappeared during restore",
                        outpoint.txid
                    )));
                }
                restored
            }
        };
        locate(&inner.chain, header, &record)
    }

    /// Structural faults always fail the block. Script faults fail it unless
    /// `ignore_script_errors` is set, in which case they are logged.
    fn check_validation(
        &self,
        header: &ChainedHeader,
        mut errors: ValidationErrors,
    ) -> Result<(), CairnError> {
        if self.config.validation.ignore_script_errors {
            for fault in errors.script.drain(..) {
                warn!(
                    height = header.height,
                    hash = %header.hash,
                    tx_index = fault.tx_index,
                    input_index = ?fault.input_index,
                    "ignoring script failure: {}",
                    fault.error
                );
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    fn abort(inner: &mut BuilderInner) {
        if inner.storage.in_transaction() {
            if let Err(e) = inner.storage.rollback_transaction() {
                error!("storage rollback failed: {e}");
            }
        }
    }

    fn fail(&self, header: &ChainedHeader, e: CairnError) -> CairnError {
        debug!(height = header.height, hash = %header.hash, "block failed: {e}");
        let _ = self.events.send(ChainStateEvent::BlockFailed {
            hash: header.hash,
            height: header.height,
            kind: e.kind(),
            message: e.to_string(),
        });
        e
    }

    fn maybe_log_stats(&self, stats: &BuilderStats) {
        let interval = self.config.stats_log_interval;
        if interval == 0 || stats.blocks_added % interval != 0 {
            return;
        }
        info!(
            blocks = stats.blocks_added,
            rolled_back = stats.blocks_rolled_back,
            txs = stats.txs,
            inputs = stats.inputs,
            blocks_per_sec = stats.blocks_per_sec(),
            txs_per_sec = stats.txs_per_sec(),
            inputs_per_sec = stats.inputs_per_sec(),
            validation_ms = stats.validation_time.as_millis() as u64,
            "chain state builder stats"
        );
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Add,
    Rollback,
}

/// The leading coinbase has no inputs to spend; every other transaction does.
fn spends_inputs(tx_index: usize, tx: &Transaction) -> bool {
    !(tx_index == 0 && tx.is_coinbase())
}

/// Locator of the block and position that confirmed `record`.
fn locate(
    chain: &ChainBuilder,
    header: &ChainedHeader,
    record: &UnspentTx,
) -> Result<BlockTxKey, CairnError> {
    let block_hash = if record.confirming_block_index == header.height {
        header.hash
    } else {
        chain
            .get(record.confirming_block_index)
            .map(|h| h.hash)
            .ok_or_else(|| {
                CairnError::Consistency(format!(
                    "{} confirmed at height {} beyond chain",
                    record.txid, record.confirming_block_index
                ))
            })?
    };
    Ok(BlockTxKey {
        block_hash,
        tx_index: record.tx_index,
    })
}
