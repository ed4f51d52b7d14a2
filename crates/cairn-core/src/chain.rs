//! Immutable chains of headers and the tip-only builder that produces them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ChainError;
use crate::types::{ChainedHeader, Hash256};

/// An ordered sequence of chained headers from genesis to a tip.
///
/// Invariant: `blocks[i].height == i` and `blocks[i].previous_block_hash()
/// == blocks[i - 1].hash`. Cloning is cheap; the contents are shared.
#[derive(Clone, Debug, Default)]
pub struct Chain {
    blocks: Arc<Vec<ChainedHeader>>,
    index: Arc<HashMap<Hash256, u64>>,
}

impl Chain {
    /// The empty chain.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Header at `height`, if present.
    pub fn get(&self, height: u64) -> Option<&ChainedHeader> {
        usize::try_from(height).ok().and_then(|h| self.blocks.get(h))
    }

    pub fn tip(&self) -> Option<&ChainedHeader> {
        self.blocks.last()
    }

    pub fn genesis(&self) -> Option<&ChainedHeader> {
        self.blocks.first()
    }

    /// Height of the tip, or `None` for an empty chain.
    pub fn height(&self) -> Option<u64> {
        self.tip().map(|tip| tip.height)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.index.contains_key(hash)
    }

    pub fn height_of(&self, hash: &Hash256) -> Option<u64> {
        self.index.get(hash).copied()
    }

    /// Header with the given hash, if it is on this chain.
    pub fn get_by_hash(&self, hash: &Hash256) -> Option<&ChainedHeader> {
        self.height_of(hash).and_then(|h| self.get(h))
    }

    pub fn blocks(&self) -> impl DoubleEndedIterator<Item = &ChainedHeader> + ExactSizeIterator {
        self.blocks.iter()
    }

    pub fn to_builder(&self) -> ChainBuilder {
        ChainBuilder {
            blocks: Arc::clone(&self.blocks),
            index: Arc::clone(&self.index),
        }
    }
}

impl PartialEq for Chain {
    fn eq(&self, other: &Self) -> bool {
        self.blocks == other.blocks
    }
}

impl Eq for Chain {}

/// Mutable chain under construction. Only the tip may be added or removed.
///
/// Storage is shared with the [`Chain`]s it produces and copied on the
/// first write after a freeze.
#[derive(Clone, Debug, Default)]
pub struct ChainBuilder {
    blocks: Arc<Vec<ChainedHeader>>,
    index: Arc<HashMap<Hash256, u64>>,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a chain from headers ordered genesis-first.
    pub fn from_headers<I>(headers: I) -> Result<Self, ChainError>
    where
        I: IntoIterator<Item = ChainedHeader>,
    {
        let mut builder = Self::new();
        for header in headers {
            builder.add_block(header)?;
        }
        Ok(builder)
    }

    pub fn tip(&self) -> Option<&ChainedHeader> {
        self.blocks.last()
    }

    pub fn get(&self, height: u64) -> Option<&ChainedHeader> {
        usize::try_from(height).ok().and_then(|h| self.blocks.get(h))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Append `header` as the new tip.
    ///
    /// # Errors
    ///
    /// [`ChainError::HeightMismatch`] if the height is not the next one;
    /// [`ChainError::NotNextBlock`] if it does not link to the current tip.
    pub fn add_block(&mut self, header: ChainedHeader) -> Result<(), ChainError> {
        self.check_next(&header)?;
        Arc::make_mut(&mut self.index).insert(header.hash, header.height);
        Arc::make_mut(&mut self.blocks).push(header);
        Ok(())
    }

    /// Check that `header` would be accepted by [`add_block`](Self::add_block).
    pub fn check_next(&self, header: &ChainedHeader) -> Result<(), ChainError> {
        let expected = self.blocks.len() as u64;
        if header.height != expected {
            return Err(ChainError::HeightMismatch {
                expected,
                got: header.height,
            });
        }
        if let Some(tip) = self.blocks.last() {
            if header.previous_block_hash() != tip.hash {
                return Err(ChainError::NotNextBlock {
                    hash: header.hash,
                    tip: tip.hash,
                });
            }
        }
        Ok(())
    }

    /// Remove `header`, which must be the current tip.
    pub fn remove_block(&mut self, header: &ChainedHeader) -> Result<ChainedHeader, ChainError> {
        match self.blocks.last() {
            None => Err(ChainError::EmptyChain),
            Some(tip) if tip.hash != header.hash => Err(ChainError::NotTip(header.hash)),
            Some(_) => {
                Arc::make_mut(&mut self.index).remove(&header.hash);
                Arc::make_mut(&mut self.blocks).pop().ok_or(ChainError::EmptyChain)
            }
        }
    }

    /// Freeze into an immutable [`Chain`] sharing this builder's storage.
    pub fn to_chain(&self) -> Chain {
        Chain {
            blocks: Arc::clone(&self.blocks),
            index: Arc::clone(&self.index),
        }
    }
}
