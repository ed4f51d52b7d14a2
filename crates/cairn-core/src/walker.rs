//! Fork resolution: the minimal rewind/advance path between two chain tips.
//!
//! The walker keeps one cursor per tip. Whichever cursor is higher steps to
//! its parent, emitting itself; at equal heights both step. The cursors meet
//! at the last common ancestor. Rewind blocks come out tip-first, advance
//! blocks are reversed to read ancestor-first.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CairnError, ChainError, MissingDataError};
use crate::types::{ChainedHeader, Hash256};

/// Edit path from one tip to another.
///
/// Walking `from_block` back through `rewind_blocks` reaches
/// `last_common_block`; walking `last_common_block` forward through
/// `advance_blocks` reaches `to_block`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockchainPath {
    pub from_block: ChainedHeader,
    pub to_block: ChainedHeader,
    pub last_common_block: ChainedHeader,
    /// Blocks to roll back, tip-first.
    pub rewind_blocks: Vec<ChainedHeader>,
    /// Blocks to apply, ancestor-first.
    pub advance_blocks: Vec<ChainedHeader>,
}

impl BlockchainPath {
    /// `true` when `from_block == to_block`.
    pub fn is_empty(&self) -> bool {
        self.rewind_blocks.is_empty() && self.advance_blocks.is_empty()
    }
}

/// Path-finder over chained headers.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockchainWalker;

impl BlockchainWalker {
    /// Compute the path from `from` to `to`.
    ///
    /// `lookup` resolves a block hash to its chained header and must cover
    /// the ancestors of both tips.
    ///
    /// # Errors
    ///
    /// - [`ChainError::ChainMismatch`] if the tips share no ancestor.
    /// - [`MissingDataError::Header`] if `lookup` cannot resolve a parent.
    pub fn get_path<F>(
        from: &ChainedHeader,
        to: &ChainedHeader,
        lookup: F,
    ) -> Result<BlockchainPath, CairnError>
    where
        F: FnMut(&Hash256) -> Option<ChainedHeader>,
    {
        Self::get_path_cancellable(from, to, lookup, &AtomicBool::new(false))
    }

    /// Like [`get_path`](Self::get_path), checking `cancel` before every step.
    ///
    /// Returns [`ChainError::Cancelled`] once `cancel` is set.
    pub fn get_path_cancellable<F>(
        from: &ChainedHeader,
        to: &ChainedHeader,
        mut lookup: F,
        cancel: &AtomicBool,
    ) -> Result<BlockchainPath, CairnError>
    where
        F: FnMut(&Hash256) -> Option<ChainedHeader>,
    {
        let mut from_cursor = from.clone();
        let mut to_cursor = to.clone();
        let mut rewind_blocks = Vec::new();
        let mut advance_blocks = Vec::new();

        while from_cursor.hash != to_cursor.hash {
            if cancel.load(Ordering::Relaxed) {
                return Err(ChainError::Cancelled.into());
            }

            if from_cursor.height > to_cursor.height {
                let parent = parent_of(&from_cursor, &mut lookup)?;
                rewind_blocks.push(std::mem::replace(&mut from_cursor, parent));
            } else if to_cursor.height > from_cursor.height {
                let parent = parent_of(&to_cursor, &mut lookup)?;
                advance_blocks.push(std::mem::replace(&mut to_cursor, parent));
            } else {
                if from_cursor.height == 0 {
                    return Err(ChainError::ChainMismatch {
                        from: from.hash,
                        to: to.hash,
                    }
                    .into());
                }
                let from_parent = parent_of(&from_cursor, &mut lookup)?;
                let to_parent = parent_of(&to_cursor, &mut lookup)?;
                rewind_blocks.push(std::mem::replace(&mut from_cursor, from_parent));
                advance_blocks.push(std::mem::replace(&mut to_cursor, to_parent));
            }
        }

        advance_blocks.reverse();
        debug!(
            from = %from.hash,
            to = %to.hash,
            common_height = from_cursor.height,
            rewind = rewind_blocks.len(),
            advance = advance_blocks.len(),
            "computed chain path"
        );

        Ok(BlockchainPath {
            from_block: from.clone(),
            to_block: to.clone(),
            last_common_block: from_cursor,
            rewind_blocks,
            advance_blocks,
        })
    }
}

fn parent_of<F>(header: &ChainedHeader, lookup: &mut F) -> Result<ChainedHeader, CairnError>
where
    F: FnMut(&Hash256) -> Option<ChainedHeader>,
{
    let prev = header.previous_block_hash();
    let parent = lookup(&prev).ok_or(MissingDataError::Header(prev))?;
    if parent.height + 1 != header.height {
        return Err(CairnError::Consistency(format!(
            "header {} at height {} has parent {} at height {}",
            header.hash, header.height, parent.hash, parent.height
        )));
    }
    Ok(parent)
}
