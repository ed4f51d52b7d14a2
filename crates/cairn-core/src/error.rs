//! Error types for the Cairn chain-state engine.
use std::fmt;

use thiserror::Error;

use crate::types::{Hash256, OutPoint};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("invalid signature on input {index}")]
    InvalidSignature { index: usize },
    #[error("duplicate input: {0}")]
    DuplicateInput(String),
    #[error("oversized: {size} > {max}")]
    OversizedTransaction { size: usize, max: usize },
    #[error("empty inputs or outputs")]
    EmptyInputsOrOutputs,
    #[error("value overflow")]
    ValueOverflow,
    #[error("invalid coinbase: {0}")]
    InvalidCoinbase(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("zero-value output at index {0}")]
    ZeroValueOutput(usize),
    #[error("null outpoint in non-coinbase input {0}")]
    NullOutpointInRegularTx(usize),
    #[error("previous output count mismatch: {inputs} inputs, {prev_outputs} previous outputs")]
    PrevOutputCount { inputs: usize, prev_outputs: usize },
}

/// Faults raised while minting, spending, unminting or unspending outputs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UtxoError {
    #[error("duplicate live transaction: {0}")]
    DuplicateTransaction(Hash256),
    #[error("missing output: {0}")]
    MissingOutput(OutPoint),
    #[error("output index out of range: {outpoint} (tx has {count} outputs)")]
    OutputIndexOutOfRange { outpoint: OutPoint, count: usize },
    #[error("double spend: {0}")]
    DoubleSpend(OutPoint),
    #[error("cannot unmint {0}: no live record")]
    UnmintMissing(Hash256),
    #[error("cannot unmint {0}: outputs already spent")]
    UnmintPartiallySpent(Hash256),
    #[error("cannot restore {0}: output is not spent")]
    RestoreUnspentOutput(OutPoint),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MissingDataError {
    #[error("block not found: {0}")]
    Block(Hash256),
    #[error("header not found: {0}")]
    Header(Hash256),
    #[error("transaction not found: block {block_hash} index {tx_index}")]
    Transaction { block_hash: Hash256, tx_index: u32 },
    #[error("no unminted transaction record for block {0}")]
    UnmintedTxs(Hash256),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("chain mismatch: {from} and {to} share no common ancestor")]
    ChainMismatch { from: Hash256, to: Hash256 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("empty chain: no blocks")]
    EmptyChain,
    #[error("height mismatch: expected {expected}, got {got}")]
    HeightMismatch { expected: u64, got: u64 },
    #[error("block {hash} does not extend tip {tip}")]
    NotNextBlock { hash: Hash256, tip: Hash256 },
    #[error("block {0} is not the chain tip")]
    NotTip(Hash256),
    #[error("merkle root mismatch for block {0}")]
    MerkleMismatch(Hash256),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")]
    InvalidPublicKey,
    #[error("invalid signature bytes")]
    InvalidSignature,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("pubkey hash does not match expected")]
    PubkeyHashMismatch,
    #[error("input index out of bounds: {index} >= {len}")]
    InputIndexOutOfBounds { index: usize, len: usize },
}

/// One failure attributed to the transaction (and input, for scripts) it came from.
#[derive(Debug)]
pub struct TxFault {
    pub tx_index: u32,
    pub input_index: Option<u32>,
    pub error: CairnError,
}

impl fmt::Display for TxFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.input_index {
            Some(input) => write!(f, "tx {} input {}: {}", self.tx_index, input, self.error),
            None => write!(f, "tx {}: {}", self.tx_index, self.error),
        }
    }
}

/// Aggregate of every fault collected while validating one block.
///
/// Structural faults (previous-output loading and transaction rules) are kept
/// apart from script faults so callers can tell which may be ignored.
#[derive(Debug, Default)]
pub struct ValidationErrors {
    pub structural: Vec<TxFault>,
    pub script: Vec<TxFault>,
}

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.structural.is_empty() && self.script.is_empty()
    }

    pub fn len(&self) -> usize {
        self.structural.len() + self.script.len()
    }

    /// All faults, structural first.
    pub fn iter(&self) -> impl Iterator<Item = &TxFault> {
        self.structural.iter().chain(self.script.iter())
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block validation failed: {} structural, {} script",
            self.structural.len(),
            self.script.len()
        )?;
        if let Some(first) = self.iter().next() {
            write!(f, "; first: {first}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Coarse classification of a [`CairnError`], used by callers to decide
/// between retrying, marking a block invalid, or treating the store as corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ChainMismatch,
    Validation,
    MissingData,
    Script,
    Consistency,
    Storage,
    Cancelled,
    Resource,
}

#[derive(Error, Debug)]
pub enum CairnError {
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Utxo(#[from] UtxoError),
    #[error(transparent)] MissingData(#[from] MissingDataError),
    #[error(transparent)] Chain(#[from] ChainError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Validation(#[from] ValidationErrors),
    #[error("consistency fault: {0}")]
    Consistency(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("worker: {0}")]
    Worker(String),
}

impl CairnError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transaction(_) | Self::Utxo(_) => ErrorKind::Validation,
            Self::MissingData(_) => ErrorKind::MissingData,
            Self::Chain(ChainError::ChainMismatch { .. }) => ErrorKind::ChainMismatch,
            Self::Chain(ChainError::Cancelled) => ErrorKind::Cancelled,
            Self::Chain(_) => ErrorKind::Validation,
            Self::Crypto(_) => ErrorKind::Script,
            Self::Validation(errors) => {
                let kinds = errors.structural.iter().map(|f| f.error.kind());
                let mut result = None;
                for kind in kinds {
                    match kind {
                        ErrorKind::Consistency => return ErrorKind::Consistency,
                        other => {
                            result.get_or_insert(other);
                        }
                    }
                }
                result.unwrap_or(ErrorKind::Script)
            }
            Self::Consistency(_) => ErrorKind::Consistency,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Worker(_) => ErrorKind::Resource,
        }
    }
}
