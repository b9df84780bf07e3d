//! Blocks, the hash chain, and chain validation.
//!
//! A block's `hash` is a fingerprint of its own index, timestamp and data
//! only; it does not cover `previous_hash`. Linkage is therefore checked
//! separately from content, which is why [`Blockchain::is_valid`] runs two
//! independent checks per block instead of a single hash-of-hash walk. A
//! consequence is that rewriting `previous_hash` alone is only caught by
//! the link check of the *same* block, never by its successor.

use crate::crypto::sha256_hex_joined;
use crate::error::ValidationError;
use crate::types::{MedicalRecord, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// `previous_hash` of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// One immutable entry of the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Block<R = MedicalRecord> {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub data: R,
    pub previous_hash: String,
    pub hash: String,
}

/// Deterministic content fingerprint of a block.
///
/// Hex SHA-256 over `"{index}-{rfc3339 timestamp}-{json data}"`. Any change
/// to one of the three inputs changes the result; `previous_hash` is not an
/// input.
pub fn fingerprint<R: Record>(index: u64, timestamp: &DateTime<Utc>, data: &R) -> String {
    let index = index.to_string();
    let timestamp = timestamp.to_rfc3339();
    let data = serde_json::to_string(data).unwrap_or_default();
    sha256_hex_joined(&[index.as_bytes(), timestamp.as_bytes(), data.as_bytes()])
}

impl<R: Record> Block<R> {
    /// Build a block stamped with the current time and compute its hash
    pub fn new(index: u64, data: R, previous_hash: impl Into<String>) -> Self {
        let mut block = Self {
            index,
            timestamp: Utc::now(),
            data,
            previous_hash: previous_hash.into(),
            hash: String::new(),
        };
        block.hash = block.calculate_hash();
        block
    }

    /// Index 0, empty record, `previous_hash` of `"0"`
    pub fn genesis() -> Self {
        Self::new(0, R::default(), GENESIS_PREVIOUS_HASH)
    }

    /// Recompute the fingerprint from the block's current content
    pub fn calculate_hash(&self) -> String {
        fingerprint(self.index, &self.timestamp, &self.data)
    }

    /// Stored hash matches the content
    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    /// This block's `previous_hash` names `previous`
    pub fn links_to(&self, previous: &Block<R>) -> bool {
        self.previous_hash == previous.hash
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }
}

/// Index of the first block that fails validation, if any.
///
/// Block 0 is never checked, so chains of length 0 or 1 are valid.
pub fn first_invalid_index<R: Record>(blocks: &[Block<R>]) -> Option<u64> {
    blocks.windows(2).find_map(|pair| {
        let (previous, current) = (&pair[0], &pair[1]);
        if !current.has_valid_hash() || !current.links_to(previous) {
            Some(current.index)
        } else {
            None
        }
    })
}

/// True iff every block after genesis carries its own fingerprint and links
/// to its predecessor
pub fn is_valid<R: Record>(blocks: &[Block<R>]) -> bool {
    first_invalid_index(blocks).is_none()
}

/// A node's local ordered sequence of blocks
#[derive(Debug, Clone, PartialEq)]
pub struct Blockchain<R = MedicalRecord> {
    blocks: Vec<Block<R>>,
}

impl<R: Record> Default for Blockchain<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> Blockchain<R> {
    /// A chain holding a freshly created genesis block
    pub fn new() -> Self {
        Self {
            blocks: vec![Self::create_genesis_block()],
        }
    }

    /// Wrap an existing sequence of blocks without validating it
    pub fn from_blocks(blocks: Vec<Block<R>>) -> Self {
        Self { blocks }
    }

    pub fn create_genesis_block() -> Block<R> {
        Block::genesis()
    }

    /// Append `record` as a new block linked to the current tip.
    ///
    /// # Panics
    ///
    /// Panics if the chain is empty; every chain must start from genesis.
    pub fn append(&mut self, record: R) -> Block<R> {
        let latest = self
            .latest_block()
            .expect("append requires a chain with a genesis block");
        let block = Block::new(latest.index + 1, record, latest.hash.clone());
        self.blocks.push(block.clone());
        block
    }

    /// Push a block exactly as received, trusting its index and hashes
    pub fn push_unchecked(&mut self, block: Block<R>) {
        self.blocks.push(block);
    }

    /// Push a block only if it extends the current tip
    pub fn try_append_block(&mut self, block: Block<R>) -> Result<(), ValidationError> {
        let tip = self.latest_block().ok_or(ValidationError::EmptyChain)?;
        let expected = tip.index + 1;
        if block.index != expected {
            return Err(ValidationError::UnexpectedIndex {
                expected,
                actual: block.index,
            });
        }
        if !block.links_to(tip) {
            return Err(ValidationError::BrokenLink { index: block.index });
        }
        if !block.has_valid_hash() {
            return Err(ValidationError::HashMismatch { index: block.index });
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Overwrite the whole chain; no comparison against the local blocks
    pub fn replace_all(&mut self, blocks: Vec<Block<R>>) {
        self.blocks = blocks;
    }

    pub fn is_valid(&self) -> bool {
        is_valid(&self.blocks)
    }

    pub fn first_invalid_index(&self) -> Option<u64> {
        first_invalid_index(&self.blocks)
    }

    /// Decide whether `candidate` should replace this chain.
    ///
    /// The candidate must be non-empty and valid. It wins if it is longer,
    /// or equally long with a lexicographically greater tip hash.
    pub fn should_replace_with(&self, candidate: &[Block<R>]) -> Result<(), ValidationError> {
        check_candidate(candidate)?;
        let local_len = self.blocks.len();
        let preferred = match candidate.len().cmp(&local_len) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match (candidate.last(), self.latest_block()) {
                (Some(theirs), Some(ours)) => theirs.hash > ours.hash,
                (Some(_), None) => true,
                _ => false,
            },
        };
        if preferred {
            Ok(())
        } else {
            Err(ValidationError::NotPreferred {
                local: local_len,
                candidate: candidate.len(),
            })
        }
    }

    pub fn latest_block(&self) -> Option<&Block<R>> {
        self.blocks.last()
    }

    pub fn get(&self, index: u64) -> Option<&Block<R>> {
        usize::try_from(index).ok().and_then(|i| self.blocks.get(i))
    }

    pub fn blocks(&self) -> &[Block<R>] {
        &self.blocks
    }

    /// Records of every block after genesis, in chain order
    pub fn records(&self) -> impl Iterator<Item = &R> {
        self.blocks.iter().skip(1).map(|block| &block.data)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// A chain received from a peer must start at a genesis block and validate
pub fn check_candidate<R: Record>(candidate: &[Block<R>]) -> Result<(), ValidationError> {
    let first = candidate.first().ok_or(ValidationError::EmptyChain)?;
    if !first.is_genesis() {
        return Err(ValidationError::MissingGenesis { index: first.index });
    }
    match first_invalid_index(candidate) {
        Some(index) => Err(ValidationError::InvalidChain { index }),
        None => Ok(()),
    }
}
