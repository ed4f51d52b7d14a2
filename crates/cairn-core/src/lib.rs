//! # cairn-core
//! Domain types, chain walking, UTXO records and capability traits for the
//! Cairn chain-state engine.

pub mod chain;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod merkle;
pub mod traits;
pub mod types;
pub mod utxo;
pub mod validation;
pub mod walker;
