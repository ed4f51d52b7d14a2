//! Three-stage concurrent validation pipeline.
//!
//! ```text
//! submit ──▶ [loader pool] ──▶ [tx validator pool] ──▶ [script validator pool]
//!            prev outputs       transaction rules       one item per input
//! ```
//!
//! Stages are joined by bounded `crossbeam-channel` queues, so a full queue
//! blocks its producer. Each stage's workers hold the only senders into the
//! next stage; when a stage's input disconnects and drains, its workers exit
//! and the next stage sees its own input disconnect. Faults are collected in
//! the per-run [`PipelineContext`] and read after [`ValidationPipeline::finish`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error};

use cairn_core::error::{CairnError, MissingDataError, TxFault, ValidationErrors};
use cairn_core::traits::{BlockTxSource, ValidationRules};
use cairn_core::types::{Hash256, Transaction, TxOutput};
use cairn_core::utxo::{BlockTxKey, TxWithPrevOutputKeys, TxWithPrevOutputs};

use crate::config::ValidationConfig;

/// A funding transaction resolved from a [`BlockTxKey`].
#[derive(Debug, Clone)]
pub struct LoadedTx {
    pub txid: Hash256,
    pub tx: Arc<Transaction>,
}

/// Transaction cache scoped to one block's processing.
pub type TxCache = DashMap<BlockTxKey, LoadedTx>;

/// Per-run state shared by the pipeline's workers.
#[derive(Debug, Default)]
pub struct PipelineContext {
    pub cache: TxCache,
    loader_faults: Mutex<Vec<TxFault>>,
    tx_faults: Mutex<Vec<TxFault>>,
    script_faults: Mutex<Vec<TxFault>>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `tx` resolvable without a store lookup.
    pub fn seed(&self, key: BlockTxKey, txid: Hash256, tx: Arc<Transaction>) {
        self.cache.insert(key, LoadedTx { txid, tx });
    }

    /// Drain collected faults. Loader and transaction-rule faults are
    /// structural; each bag is ordered by transaction then input.
    pub fn take_errors(&self) -> ValidationErrors {
        let mut structural = std::mem::take(&mut *self.loader_faults.lock());
        structural.append(&mut self.tx_faults.lock());
        structural.sort_by_key(|f| (f.tx_index, f.input_index));
        let mut script = std::mem::take(&mut *self.script_faults.lock());
        script.sort_by_key(|f| (f.tx_index, f.input_index));
        ValidationErrors { structural, script }
    }
}

/// Resolve every locator of `item` to its funding transaction, consulting
/// `cache` before `source`.
///
/// # Errors
///
/// - [`MissingDataError::Transaction`] if `source` lacks a funding transaction.
/// - [`CairnError::Consistency`] if the locator count differs from the input count.
pub fn load_funding_txs(
    source: &dyn BlockTxSource,
    cache: &TxCache,
    item: &TxWithPrevOutputKeys,
) -> Result<Vec<LoadedTx>, CairnError> {
    if item.prev_output_keys.is_empty() && item.tx.is_coinbase() {
        return Ok(Vec::new());
    }
    if item.prev_output_keys.len() != item.tx.inputs.len() {
        return Err(CairnError::Consistency(format!(
            "tx {} has {} inputs but {} previous-output locators",
            item.txid,
            item.tx.inputs.len(),
            item.prev_output_keys.len()
        )));
    }

    let mut loaded = Vec::with_capacity(item.prev_output_keys.len());
    for key in &item.prev_output_keys {
        let cached = cache.get(key).map(|entry| entry.value().clone());
        let funding = match cached {
            Some(funding) => funding,
            None => {
                let tx = source
                    .try_get_transaction(&key.block_hash, key.tx_index)?
                    .ok_or(MissingDataError::Transaction {
                        block_hash: key.block_hash,
                        tx_index: key.tx_index,
                    })?;
                let funding = LoadedTx { txid: tx.txid()?, tx };
                cache.insert(*key, funding.clone());
                funding
            }
        };
        loaded.push(funding);
    }
    Ok(loaded)
}

/// Pick the spent output of each input out of its funding transaction.
///
/// A funding transaction whose hash differs from the input's outpoint means
/// the locator is wrong, which is a [`CairnError::Consistency`] fault.
pub fn extract_prev_outputs(
    item: &TxWithPrevOutputKeys,
    funding: &[LoadedTx],
) -> Result<Vec<TxOutput>, CairnError> {
    let mut outputs = Vec::with_capacity(funding.len());
    for (input, loaded) in item.tx.inputs.iter().zip(funding) {
        let outpoint = &input.previous_output;
        if loaded.txid != outpoint.txid {
            return Err(CairnError::Consistency(format!(
                "locator for {outpoint} resolved to transaction {}",
                loaded.txid
            )));
        }
        let output = usize::try_from(outpoint.index)
            .ok()
            .and_then(|i| loaded.tx.outputs.get(i))
            .ok_or_else(|| {
                CairnError::Consistency(format!("funding transaction has no output {outpoint}"))
            })?;
        outputs.push(output.clone());
    }
    Ok(outputs)
}

/// [`load_funding_txs`] followed by [`extract_prev_outputs`].
pub fn load_prev_outputs(
    source: &dyn BlockTxSource,
    cache: &TxCache,
    item: TxWithPrevOutputKeys,
) -> Result<TxWithPrevOutputs, CairnError> {
    let funding = load_funding_txs(source, cache, &item)?;
    let prev_outputs = extract_prev_outputs(&item, &funding)?;
    Ok(TxWithPrevOutputs {
        tx_index: item.tx_index,
        txid: item.txid,
        tx: item.tx,
        block: item.block,
        prev_outputs,
    })
}

/// Spawn a named worker thread.
pub(crate) fn spawn_worker<F>(name: String, work: F) -> Result<JoinHandle<()>, CairnError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(work)
        .map_err(|e| CairnError::Worker(format!("failed to spawn {name}: {e}")))
}

/// Join `workers`, reporting any that panicked.
pub(crate) fn join_workers(workers: Vec<JoinHandle<()>>) -> Result<(), CairnError> {
    let mut panicked = Vec::new();
    for handle in workers {
        let name = handle.thread().name().unwrap_or("worker").to_string();
        if handle.join().is_err() {
            error!(worker = %name, "worker thread panicked");
            panicked.push(name);
        }
    }
    if panicked.is_empty() {
        Ok(())
    } else {
        Err(CairnError::Worker(format!("panicked: {}", panicked.join(", "))))
    }
}

/// One input queued for script validation.
struct ScriptItem {
    tx: Arc<TxWithPrevOutputs>,
    input_index: usize,
}

/// A running pipeline for one block.
pub struct ValidationPipeline {
    input: Option<Sender<TxWithPrevOutputKeys>>,
    workers: Vec<JoinHandle<()>>,
    context: Arc<PipelineContext>,
}

impl ValidationPipeline {
    /// Start all stage worker pools.
    ///
    /// The script stage is not started when `config.ignore_scripts` is set.
    pub fn start(
        source: Arc<dyn BlockTxSource>,
        rules: Arc<dyn ValidationRules>,
        config: &ValidationConfig,
        context: Arc<PipelineContext>,
    ) -> Result<Self, CairnError> {
        let capacity = config.queue_capacity.max(1);
        let (input_tx, input_rx) = bounded::<TxWithPrevOutputKeys>(capacity);
        let (loaded_tx, loaded_rx) = bounded::<TxWithPrevOutputs>(capacity);
        let (script_tx, script_rx) = if config.ignore_scripts {
            (None, None)
        } else {
            let (tx, rx) = bounded::<ScriptItem>(capacity);
            (Some(tx), Some(rx))
        };

        let mut pipeline = Self {
            input: Some(input_tx),
            workers: Vec::new(),
            context,
        };

        for i in 0..config.loader_threads.max(1) {
            let rx = input_rx.clone();
            let tx = loaded_tx.clone();
            let source = Arc::clone(&source);
            let ctx = Arc::clone(&pipeline.context);
            pipeline.workers.push(spawn_worker(format!("cairn-loader-{i}"), move || {
                run_loader(&*source, &ctx, rx, tx)
            })?);
        }
        drop(loaded_tx);

        for i in 0..config.tx_validator_threads.max(1) {
            let rx = loaded_rx.clone();
            let tx = script_tx.clone();
            let rules = Arc::clone(&rules);
            let ctx = Arc::clone(&pipeline.context);
            pipeline.workers.push(spawn_worker(format!("cairn-txval-{i}"), move || {
                run_tx_validator(&*rules, &ctx, rx, tx)
            })?);
        }
        drop(script_tx);

        if let Some(script_rx) = script_rx {
            for i in 0..config.script_validator_threads.max(1) {
                let rx = script_rx.clone();
                let rules = Arc::clone(&rules);
                let ctx = Arc::clone(&pipeline.context);
                pipeline.workers.push(spawn_worker(format!("cairn-script-{i}"), move || {
                    run_script_validator(&*rules, &ctx, rx)
                })?);
            }
        }

        Ok(pipeline)
    }

    /// Queue a transaction. Blocks while the loader queue is full.
    pub fn submit(&self, item: TxWithPrevOutputKeys) -> Result<(), CairnError> {
        let sender = self
            .input
            .as_ref()
            .ok_or_else(|| CairnError::Worker("pipeline input already closed".into()))?;
        sender
            .send(item)
            .map_err(|_| CairnError::Worker("pipeline loader stage stopped".into()))
    }

    /// Close the input, wait for every stage to drain and return the faults.
    pub fn finish(mut self) -> Result<ValidationErrors, CairnError> {
        self.shutdown()?;
        Ok(self.context.take_errors())
    }

    fn shutdown(&mut self) -> Result<(), CairnError> {
        self.input.take();
        join_workers(std::mem::take(&mut self.workers))
    }
}

impl Drop for ValidationPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("validation pipeline shutdown: {e}");
        }
    }
}

fn run_loader(
    source: &dyn BlockTxSource,
    ctx: &PipelineContext,
    rx: Receiver<TxWithPrevOutputKeys>,
    tx: Sender<TxWithPrevOutputs>,
) {
    for item in rx.iter() {
        let tx_index = item.tx_index;
        match load_prev_outputs(source, &ctx.cache, item) {
            Ok(loaded) => {
                if tx.send(loaded).is_err() {
                    break;
                }
            }
            Err(error) => {
                debug!(tx_index, "previous-output load failed: {error}");
                ctx.loader_faults.lock().push(TxFault {
                    tx_index,
                    input_index: None,
                    error,
                });
            }
        }
    }
}

fn run_tx_validator(
    rules: &dyn ValidationRules,
    ctx: &PipelineContext,
    rx: Receiver<TxWithPrevOutputs>,
    scripts: Option<Sender<ScriptItem>>,
) {
    for item in rx.iter() {
        if let Err(error) =
            rules.validate_transaction(&item.block, &item.tx, item.tx_index, &item.prev_outputs)
        {
            ctx.tx_faults.lock().push(TxFault {
                tx_index: item.tx_index,
                input_index: None,
                error,
            });
        }

        let Some(scripts) = scripts.as_ref() else { continue };
        if item.is_coinbase() {
            continue;
        }
        let input_count = item.prev_outputs.len();
        let shared = Arc::new(item);
        for input_index in 0..input_count {
            let script = ScriptItem {
                tx: Arc::clone(&shared),
                input_index,
            };
            if scripts.send(script).is_err() {
                return;
            }
        }
    }
}

fn run_script_validator(
    rules: &dyn ValidationRules,
    ctx: &PipelineContext,
    rx: Receiver<ScriptItem>,
) {
    for item in rx.iter() {
        let tx = &item.tx;
        let (Some(input), Some(prev_output)) = (
            tx.tx.inputs.get(item.input_index),
            tx.prev_outputs.get(item.input_index),
        ) else {
            continue;
        };
        let input_index = item.input_index as u32;
        if let Err(error) =
            rules.validate_script(&tx.block, &tx.tx, tx.tx_index, input, input_index, prev_output)
        {
            ctx.script_faults.lock().push(TxFault {
                tx_index: tx.tx_index,
                input_index: Some(input_index),
                error,
            });
        }
    }
}
