//! # cairn-node: persistent backends and process setup.
//!
//! - [`storage::RocksChainStateStorage`]: chain-state storage backed by RocksDB
//! - [`block_store::RocksBlockStore`]: block source backed by RocksDB
//! - [`config::NodeConfig`]: data directory, logging and engine settings
//! - [`logging`]: tracing subscriber initialisation

pub mod block_store;
pub mod config;
pub mod logging;
pub mod storage;

pub use block_store::RocksBlockStore;
pub use config::{LogFormat, NodeConfig, NodeError};
pub use storage::RocksChainStateStorage;
