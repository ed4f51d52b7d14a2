//! Chain-state notifications.
//!
//! The builder owns a `tokio::sync::broadcast` sender; callers obtain a
//! receiver with [`ChainStateBuilder::subscribe`](crate::builder::ChainStateBuilder::subscribe)
//! and poll it. Nothing in the builder depends on delivery.

use cairn_core::error::ErrorKind;
use cairn_core::types::Hash256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStateEvent {
    BlockAdded {
        hash: Hash256,
        height: u64,
        tx_count: usize,
    },
    BlockRolledBack {
        hash: Hash256,
        height: u64,
    },
    /// Fired after every committed add or rollback.
    ChainStateChanged {
        tip: Option<Hash256>,
        height: Option<u64>,
    },
    /// An add or rollback failed and was rolled back in storage.
    BlockFailed {
        hash: Hash256,
        height: u64,
        kind: ErrorKind,
        message: String,
    },
}
