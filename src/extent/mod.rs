//! # Extent Manager
//!
//! Owns the allocation state of every fixed-size extent in the backing file.
//!
//! ## Layout
//!
//! Extent `i` covers bytes `[i * extent_size, (i + 1) * extent_size)`. The
//! first `reserved_extents` extents hold the static header and the metablock
//! ring and are never handed out. Every other extent is either free or
//! allocated to exactly one owner (an LBA extent, the LBA superblock, or a
//! data extent).
//!
//! ## Durable state
//!
//! Only the file size in extents is persisted ([`ExtentMixin`]). On startup
//! every non-reserved extent starts out free and the LBA index and the data
//! block manager [`reserve`](ExtentManager::reserve) the extents they own
//! while replaying their own state, so the free list is always derived from
//! the latest committed metablock.
//!
//! ## Extent transactions
//!
//! While a commit is being assembled, frees are deferred in an
//! [`ExtentTransaction`]. The extents are released only through
//! [`ExtentManager::commit`], after the metablock that no longer references
//! them is durable; until then a crash would recover a metablock that still
//! points into them, so they must not be reused.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use crate::encoding::{Decode, Encode, EncodingError};
use crate::file::DbFile;
use std::{collections::BTreeSet, io};
use thiserror::Error;
use tracing::{debug, trace};

/// Offset value meaning "no extent" in durable mixins.
pub const NULL_OFFSET: u64 = u64::MAX;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by the extent manager.
#[derive(Debug, Error)]
pub enum ExtentError {
    /// The file cannot grow by another extent without exceeding its limit.
    #[error("Out of space: file limited to {limit} bytes")]
    OutOfSpace { limit: u64 },

    /// The offset is not the start of a usable extent.
    #[error("Offset {0} is not a valid extent")]
    InvalidExtent(u64),

    /// Allocation state did not allow the requested transition.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Underlying I/O error while growing the file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// Durable mixin
// ------------------------------------------------------------------------------------------------

/// Extent manager state embedded in every metablock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentMixin {
    /// Number of extents the file spans, reserved ones included.
    pub extent_count: u64,
}

impl Encode for ExtentMixin {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.extent_count.encode_to(buf)
    }
}

impl Decode for ExtentMixin {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (extent_count, n) = u64::decode_from(buf)?;
        Ok((Self { extent_count }, n))
    }
}

// ------------------------------------------------------------------------------------------------
// Extent transactions
// ------------------------------------------------------------------------------------------------

/// Frees collected while a commit is in progress.
#[derive(Debug, Default)]
#[must_use = "deferred frees are lost unless the transaction is committed"]
pub struct ExtentTransaction {
    frees: Vec<u64>,
}

impl ExtentTransaction {
    /// Offsets whose release is pending.
    pub fn pending(&self) -> &[u64] {
        &self.frees
    }
}

// ------------------------------------------------------------------------------------------------
// ExtentManager
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
pub struct ExtentManager {
    extent_size: u64,
    reserved_extents: u64,
    max_extents: u64,
    max_file_size: u64,
    allocated: Vec<bool>,
    free: BTreeSet<u64>,
    txn: Option<ExtentTransaction>,
}

impl ExtentManager {
    /// Manager for a freshly created file that spans only the reserved extents.
    pub fn new(extent_size: u64, reserved_extents: u64, max_file_size: u64) -> Self {
        let mut manager = Self {
            extent_size,
            reserved_extents,
            max_extents: max_file_size / extent_size,
            max_file_size,
            allocated: Vec::new(),
            free: BTreeSet::new(),
            txn: None,
        };
        manager.allocated.resize(reserved_extents as usize, true);
        manager
    }

    /// Manager for an existing file. Every non-reserved extent starts free
    /// until its owner reserves it.
    pub fn start_existing(
        extent_size: u64,
        reserved_extents: u64,
        max_file_size: u64,
        mixin: &ExtentMixin,
    ) -> Result<Self, ExtentError> {
        if mixin.extent_count < reserved_extents {
            return Err(ExtentError::InvariantViolation(format!(
                "metablock records {} extents, fewer than the {} reserved ones",
                mixin.extent_count, reserved_extents
            )));
        }
        let mut manager = Self::new(extent_size, reserved_extents, max_file_size);
        // An existing file may already exceed a lowered limit; it may not grow further.
        manager.max_extents = manager.max_extents.max(mixin.extent_count);
        for index in reserved_extents..mixin.extent_count {
            manager.allocated.push(false);
            manager.free.insert(index);
        }
        debug!(
            extent_count = mixin.extent_count,
            free = manager.free.len(),
            "extent manager started"
        );
        Ok(manager)
    }

    pub fn extent_size(&self) -> u64 {
        self.extent_size
    }

    /// Number of extents the file currently spans.
    pub fn extent_count(&self) -> u64 {
        self.allocated.len() as u64
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Allocated extents, reserved ones excluded.
    pub fn allocated_count(&self) -> usize {
        self.allocated.iter().filter(|a| **a).count() - self.reserved_extents as usize
    }

    pub fn is_allocated(&self, offset: u64) -> bool {
        match self.index_of(offset) {
            Ok(index) => self.allocated[index as usize],
            Err(_) => false,
        }
    }

    fn index_of(&self, offset: u64) -> Result<u64, ExtentError> {
        if offset % self.extent_size != 0 {
            return Err(ExtentError::InvalidExtent(offset));
        }
        let index = offset / self.extent_size;
        if index < self.reserved_extents || index >= self.extent_count() {
            return Err(ExtentError::InvalidExtent(offset));
        }
        Ok(index)
    }

    /// Allocates the lowest free extent, growing the file when none is free.
    pub fn allocate(&mut self, file: &DbFile) -> Result<u64, ExtentError> {
        let index = match self.free.pop_first() {
            Some(index) => index,
            None => {
                let index = self.extent_count();
                if index + 1 > self.max_extents {
                    return Err(ExtentError::OutOfSpace {
                        limit: self.max_file_size,
                    });
                }
                file.set_len((index + 1) * self.extent_size)?;
                self.allocated.push(false);
                index
            }
        };
        self.allocated[index as usize] = true;
        let offset = index * self.extent_size;
        trace!(offset, "extent allocated");
        Ok(offset)
    }

    /// Marks an extent found in the recovered state as allocated.
    pub fn reserve(&mut self, offset: u64) -> Result<(), ExtentError> {
        let index = self.index_of(offset)?;
        if !self.free.remove(&index) {
            return Err(ExtentError::InvariantViolation(format!(
                "extent at {offset} reserved twice"
            )));
        }
        self.allocated[index as usize] = true;
        Ok(())
    }

    /// Frees an extent, or defers the free when a transaction is open.
    pub fn free(&mut self, offset: u64) -> Result<(), ExtentError> {
        let index = self.index_of(offset)?;
        if !self.allocated[index as usize] {
            return Err(ExtentError::InvariantViolation(format!(
                "extent at {offset} freed while not allocated"
            )));
        }
        match self.txn.as_mut() {
            Some(txn) => {
                if txn.frees.contains(&offset) {
                    return Err(ExtentError::InvariantViolation(format!(
                        "extent at {offset} freed twice in one transaction"
                    )));
                }
                txn.frees.push(offset);
            }
            None => self.release(index),
        }
        Ok(())
    }

    fn release(&mut self, index: u64) {
        self.allocated[index as usize] = false;
        self.free.insert(index);
        trace!(offset = index * self.extent_size, "extent freed");
    }

    /// Starts deferring frees.
    pub fn begin_transaction(&mut self) -> Result<(), ExtentError> {
        if self.txn.is_some() {
            return Err(ExtentError::InvariantViolation(
                "extent transaction already open".into(),
            ));
        }
        self.txn = Some(ExtentTransaction::default());
        Ok(())
    }

    /// Stops deferring frees and hands back what was collected.
    pub fn end_transaction(&mut self) -> Result<ExtentTransaction, ExtentError> {
        self.txn.take().ok_or_else(|| {
            ExtentError::InvariantViolation("no extent transaction is open".into())
        })
    }

    /// Releases the deferred frees of a transaction whose metablock is durable.
    pub fn commit(&mut self, txn: ExtentTransaction) {
        for offset in txn.frees {
            self.release(offset / self.extent_size);
        }
    }

    pub fn mixin(&self) -> ExtentMixin {
        ExtentMixin {
            extent_count: self.extent_count(),
        }
    }
}
