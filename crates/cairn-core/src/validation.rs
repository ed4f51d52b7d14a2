//! Standard consensus rules.
//!
//! [`validate_transaction_structure`] runs context-free format checks.
//! [`StandardRules`] plugs those checks plus value conservation and Ed25519
//! input verification into the [`ValidationRules`] capability.

use std::collections::HashSet;

use crate::constants::{MAX_COINBASE_DATA, MAX_TX_SIZE};
use crate::crypto;
use crate::error::{CairnError, TransactionError};
use crate::traits::ValidationRules;
use crate::types::{ChainedHeader, Transaction, TxInput, TxOutput};

/// Validate transaction structure without any external state.
///
/// Both kinds: non-empty inputs and outputs, no zero-value output, no
/// output-sum overflow, serialized size within [`MAX_TX_SIZE`].
/// Coinbase: data within [`MAX_COINBASE_DATA`]. Regular: no null or
/// duplicate outpoints, 64-byte signatures and 32-byte public keys.
pub fn validate_transaction_structure(tx: &Transaction) -> Result<(), TransactionError> {
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return Err(TransactionError::EmptyInputsOrOutputs);
    }
    if let Some(i) = tx.outputs.iter().position(|o| o.value == 0) {
        return Err(TransactionError::ZeroValueOutput(i));
    }
    if tx.total_output_value().is_none() {
        return Err(TransactionError::ValueOverflow);
    }

    let encoded = bincode::encode_to_vec(tx, bincode::config::standard())
        .map_err(|e| TransactionError::Serialization(e.to_string()))?;
    if encoded.len() > MAX_TX_SIZE {
        return Err(TransactionError::OversizedTransaction {
            size: encoded.len(),
            max: MAX_TX_SIZE,
        });
    }

    if tx.is_coinbase() {
        let data = &tx.inputs[0].signature;
        if data.len() > MAX_COINBASE_DATA {
            return Err(TransactionError::InvalidCoinbase(format!(
                "data too large: {} > {MAX_COINBASE_DATA}",
                data.len()
            )));
        }
        return Ok(());
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for (i, input) in tx.inputs.iter().enumerate() {
        if input.previous_output.is_null() {
            return Err(TransactionError::NullOutpointInRegularTx(i));
        }
        if !seen.insert(&input.previous_output) {
            return Err(TransactionError::DuplicateInput(input.previous_output.to_string()));
        }
        if input.signature.len() != 64 || input.public_key.len() != 32 {
            return Err(TransactionError::InvalidSignature { index: i });
        }
    }
    Ok(())
}

/// Value conservation: inputs must cover outputs.
///
/// Returns the fee on success.
pub fn check_value_conservation(
    tx: &Transaction,
    prev_outputs: &[TxOutput],
) -> Result<u64, TransactionError> {
    if prev_outputs.len() != tx.inputs.len() {
        return Err(TransactionError::PrevOutputCount {
            inputs: tx.inputs.len(),
            prev_outputs: prev_outputs.len(),
        });
    }
    let have = prev_outputs
        .iter()
        .try_fold(0u64, |acc, o| acc.checked_add(o.value))
        .ok_or(TransactionError::ValueOverflow)?;
    let need = tx.total_output_value().ok_or(TransactionError::ValueOverflow)?;
    if have < need {
        return Err(TransactionError::InsufficientFunds { have, need });
    }
    Ok(have - need)
}

/// The default rule set.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardRules;

impl ValidationRules for StandardRules {
    fn validate_transaction(
        &self,
        _block: &ChainedHeader,
        tx: &Transaction,
        tx_index: u32,
        prev_outputs: &[TxOutput],
    ) -> Result<(), CairnError> {
        validate_transaction_structure(tx)?;
        let is_coinbase = tx.is_coinbase();
        if is_coinbase != (tx_index == 0) {
            return Err(TransactionError::InvalidCoinbase(format!(
                "coinbase must be first and only first, found at index {tx_index}"
            ))
            .into());
        }
        if !is_coinbase {
            check_value_conservation(tx, prev_outputs)?;
        }
        Ok(())
    }

    fn validate_script(
        &self,
        _block: &ChainedHeader,
        tx: &Transaction,
        _tx_index: u32,
        _input: &TxInput,
        input_index: u32,
        prev_output: &TxOutput,
    ) -> Result<(), CairnError> {
        crypto::verify_transaction_input(tx, input_index as usize, &prev_output.pubkey_hash)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::error::CryptoError;
    use crate::types::{BlockHeader, Hash256, OutPoint};

    // --- Helpers ---

    fn block() -> ChainedHeader {
        ChainedHeader::genesis(BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp: 0,
            difficulty_target: u64::MAX,
            nonce: 0,
        })
    }

    fn owner() -> KeyPair {
        KeyPair::from_secret_bytes([5; 32])
    }

    fn prev(value: u64) -> TxOutput {
        TxOutput { value, pubkey_hash: owner().public_key().pubkey_hash() }
    }

    fn signed_spend(out_value: u64) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint { txid: Hash256([1; 32]), index: 0 },
                signature: vec![],
                public_key: vec![],
            }],
            outputs: vec![TxOutput { value: out_value, pubkey_hash: Hash256([2; 32]) }],
            lock_time: 0,
        };
        crypto::sign_transaction_input(&mut tx, 0, &owner()).unwrap();
        tx
    }

    fn coinbase() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                signature: b"height 0".to_vec(),
                public_key: vec![],
            }],
            outputs: vec![TxOutput { value: 50, pubkey_hash: Hash256([2; 32]) }],
            lock_time: 0,
        }
    }

    // --- Structure ---

    #[test]
    fn structure_accepts_coinbase_and_signed_spend() {
        validate_transaction_structure(&coinbase()).unwrap();
        validate_transaction_structure(&signed_spend(10)).unwrap();
    }

    #[test]
    fn structure_rejects_zero_value_output() {
        let mut tx = signed_spend(10);
        tx.outputs.push(TxOutput { value: 0, pubkey_hash: Hash256::ZERO });
        assert_eq!(validate_transaction_structure(&tx), Err(TransactionError::ZeroValueOutput(1)));
    }

    #[test]
    fn structure_rejects_duplicate_input() {
        let mut tx = signed_spend(10);
        tx.inputs.push(tx.inputs[0].clone());
        assert!(matches!(
            validate_transaction_structure(&tx),
            Err(TransactionError::DuplicateInput(_))
        ));
    }

    #[test]
    fn structure_rejects_oversized_coinbase_data() {
        let mut cb = coinbase();
        cb.inputs[0].signature = vec![0; MAX_COINBASE_DATA + 1];
        assert!(matches!(
            validate_transaction_structure(&cb),
            Err(TransactionError::InvalidCoinbase(_))
        ));
    }

    // --- Value conservation ---

    #[test]
    fn conservation_returns_fee() {
        assert_eq!(check_value_conservation(&signed_spend(30), &[prev(40)]), Ok(10));
    }

    #[test]
    fn conservation_rejects_overspend() {
        assert_eq!(
            check_value_conservation(&signed_spend(50), &[prev(40)]),
            Err(TransactionError::InsufficientFunds { have: 40, need: 50 })
        );
    }

    #[test]
    fn conservation_rejects_count_mismatch() {
        assert!(matches!(
            check_value_conservation(&signed_spend(1), &[]),
            Err(TransactionError::PrevOutputCount { inputs: 1, prev_outputs: 0 })
        ));
    }

    // --- StandardRules ---

    #[test]
    fn rules_reject_misplaced_coinbase() {
        let err = StandardRules
            .validate_transaction(&block(), &coinbase(), 1, &[])
            .unwrap_err();
        assert!(matches!(err, CairnError::Transaction(TransactionError::InvalidCoinbase(_))));
        StandardRules.validate_transaction(&block(), &coinbase(), 0, &[]).unwrap();
    }

    #[test]
    fn rules_script_checks_owner_and_signature() {
        let tx = signed_spend(10);
        StandardRules
            .validate_script(&block(), &tx, 1, &tx.inputs[0], 0, &prev(40))
            .unwrap();

        let stranger = TxOutput { value: 40, pubkey_hash: Hash256([9; 32]) };
        let err = StandardRules
            .validate_script(&block(), &tx, 1, &tx.inputs[0], 0, &stranger)
            .unwrap_err();
        assert!(matches!(err, CairnError::Crypto(CryptoError::PubkeyHashMismatch)));
    }
}
