//! # cairn-chainstate: UTXO chain state under reorganization.
//!
//! - [`builder::ChainStateBuilder`]: applies and rolls back blocks transactionally
//! - [`pipeline::ValidationPipeline`]: three-stage concurrent block validation
//! - [`replayer::BlockReplayer`]: reproduces a block's transactions with the outputs they spent
//! - [`memory`]: in-memory storage backend and block store

pub mod builder;
pub mod chain_state;
pub mod config;
pub mod events;
pub mod memory;
pub mod pipeline;
pub mod replayer;
pub mod stats;

#[cfg(test)]
pub(crate) mod test_util;

pub use builder::ChainStateBuilder;
pub use chain_state::ChainState;
pub use config::{BuilderConfig, ReplayConfig, ValidationConfig};
pub use events::ChainStateEvent;
pub use memory::{MemoryBlockStore, MemoryChainStateStorage};
pub use replayer::{BlockReplayer, ReplayMode, ReplaySession};
