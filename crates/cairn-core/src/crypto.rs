//! Ed25519 signing scheme for transaction inputs.
//!
//! An output is locked to the BLAKE3 hash of an Ed25519 public key. Spending
//! it requires the input to carry that key plus a signature over the input's
//! signing hash, which commits to:
//! - Transaction version and lock_time
//! - All input outpoints (txid + index)
//! - All outputs (value + pubkey_hash)
//! - The index of the input being signed
//!
//! Signatures and public keys are excluded so inputs can be signed in any order.

use ed25519_dalek::{Signer, Verifier};
use std::fmt;

use crate::error::CryptoError;
use crate::types::{Hash256, Transaction};

/// Ed25519 keypair used to sign transaction inputs.
pub struct KeyPair {
    signing_key: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Create a keypair from 32-byte secret key material.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(&bytes),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Sign a message, returning the raw 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Ed25519 public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    verifying_key: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { verifying_key })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// The locking hash of this key, as stored in
    /// [`TxOutput::pubkey_hash`](crate::types::TxOutput).
    pub fn pubkey_hash(&self) -> Hash256 {
        pubkey_hash(&self.to_bytes())
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        self.verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

/// BLAKE3 hash of raw public key bytes.
pub fn pubkey_hash(pubkey_bytes: &[u8; 32]) -> Hash256 {
    Hash256(blake3::hash(pubkey_bytes).into())
}

/// Compute the signing hash for input `input_index` of `tx`.
pub fn signing_hash(tx: &Transaction, input_index: usize) -> Result<Hash256, CryptoError> {
    if input_index >= tx.inputs.len() {
        return Err(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        });
    }

    let mut hasher = blake3::Hasher::new();
    hasher.update(&tx.version.to_le_bytes());
    hasher.update(&(tx.inputs.len() as u64).to_le_bytes());
    for input in &tx.inputs {
        hasher.update(input.previous_output.txid.as_bytes());
        hasher.update(&input.previous_output.index.to_le_bytes());
    }
    hasher.update(&(tx.outputs.len() as u64).to_le_bytes());
    for output in &tx.outputs {
        hasher.update(&output.value.to_le_bytes());
        hasher.update(output.pubkey_hash.as_bytes());
    }
    hasher.update(&tx.lock_time.to_le_bytes());
    hasher.update(&(input_index as u64).to_le_bytes());
    Ok(Hash256(hasher.finalize().into()))
}

/// Sign input `input_index` in place, writing the signature and public key.
pub fn sign_transaction_input(
    tx: &mut Transaction,
    input_index: usize,
    keypair: &KeyPair,
) -> Result<(), CryptoError> {
    let sighash = signing_hash(tx, input_index)?;
    let signature = keypair.sign(sighash.as_bytes());
    let input = &mut tx.inputs[input_index];
    input.signature = signature.to_vec();
    input.public_key = keypair.public_key().to_bytes().to_vec();
    Ok(())
}

/// Verify input `input_index` of `tx` unlocks an output locked to `expected_pubkey_hash`.
pub fn verify_transaction_input(
    tx: &Transaction,
    input_index: usize,
    expected_pubkey_hash: &Hash256,
) -> Result<(), CryptoError> {
    let input = tx
        .inputs
        .get(input_index)
        .ok_or(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        })?;

    let pk_bytes: [u8; 32] = input
        .public_key
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let pk = PublicKey::from_bytes(&pk_bytes)?;
    if pk.pubkey_hash() != *expected_pubkey_hash {
        return Err(CryptoError::PubkeyHashMismatch);
    }

    let sig_bytes: [u8; 64] = input
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let sighash = signing_hash(tx, input_index)?;
    pk.verify(sighash.as_bytes(), &sig_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutPoint, TxInput, TxOutput};

    fn unsigned_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![
                TxInput {
                    previous_output: OutPoint { txid: Hash256([1; 32]), index: 0 },
                    signature: vec![],
                    public_key: vec![],
                },
                TxInput {
                    previous_output: OutPoint { txid: Hash256([2; 32]), index: 3 },
                    signature: vec![],
                    public_key: vec![],
                },
            ],
            outputs: vec![TxOutput { value: 10, pubkey_hash: Hash256([9; 32]) }],
            lock_time: 0,
        }
    }

    #[test]
    fn keypair_is_deterministic() {
        let a = KeyPair::from_secret_bytes([42; 32]);
        let b = KeyPair::from_secret_bytes([42; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), KeyPair::from_secret_bytes([43; 32]).public_key());
    }

    #[test]
    fn signing_hash_commits_to_input_index() {
        let tx = unsigned_tx();
        assert_ne!(signing_hash(&tx, 0).unwrap(), signing_hash(&tx, 1).unwrap());
        assert!(matches!(
            signing_hash(&tx, 2),
            Err(CryptoError::InputIndexOutOfBounds { index: 2, len: 2 })
        ));
    }

    #[test]
    fn sign_then_verify() {
        let kp = KeyPair::from_secret_bytes([7; 32]);
        let owner = kp.public_key().pubkey_hash();
        let mut tx = unsigned_tx();
        sign_transaction_input(&mut tx, 0, &kp).unwrap();
        sign_transaction_input(&mut tx, 1, &kp).unwrap();
        verify_transaction_input(&tx, 0, &owner).unwrap();
        verify_transaction_input(&tx, 1, &owner).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_owner() {
        let kp = KeyPair::from_secret_bytes([7; 32]);
        let mut tx = unsigned_tx();
        sign_transaction_input(&mut tx, 0, &kp).unwrap();
        assert_eq!(
            verify_transaction_input(&tx, 0, &Hash256([0xEE; 32])),
            Err(CryptoError::PubkeyHashMismatch)
        );
    }

    #[test]
    fn verify_rejects_tampered_output() {
        let kp = KeyPair::from_secret_bytes([7; 32]);
        let owner = kp.public_key().pubkey_hash();
        let mut tx = unsigned_tx();
        sign_transaction_input(&mut tx, 0, &kp).unwrap();
        tx.outputs[0].value = 11;
        assert_eq!(
            verify_transaction_input(&tx, 0, &owner),
            Err(CryptoError::VerificationFailed)
        );
    }

    #[test]
    fn verify_rejects_malformed_key() {
        let tx = unsigned_tx();
        assert_eq!(
            verify_transaction_input(&tx, 0, &Hash256::ZERO),
            Err(CryptoError::InvalidPublicKey)
        );
    }
}
