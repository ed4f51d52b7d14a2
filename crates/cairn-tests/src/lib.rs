//! End-to-end test suite for cairn.
//!
//! Tests drive a [`ChainStateBuilder`](cairn_chainstate::ChainStateBuilder)
//! through reorganizations, replays and rejected blocks, against both the
//! in-memory and the RocksDB backends.

pub mod helpers;
