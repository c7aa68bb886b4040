//! # Diff Out-of-Core Storage
//!
//! A patch log that lets the cache record small in-place mutations of a
//! block instead of rewriting the whole block each time.
//!
//! Patches are appended to the *active* log block, one of a contiguous
//! range of serializer blocks reserved by [`init`](DiffOocoreStorage::init).
//! Each log block carries a log sequence number; the block with the highest
//! one is active and the others are ordered oldest to newest by theirs.
//!
//! ## Space reclamation
//!
//! - [`store_patch`](DiffOocoreStorage::store_patch) never does I/O. When
//!   the active block is full it compacts another log block in memory,
//!   dropping patches that are no longer unresolved. If the patch fits the
//!   compacted block, that block becomes active. Otherwise it returns
//!   `false` and the cache falls back to flushing the target block.
//! - [`flush_n_oldest_blocks`](DiffOocoreStorage::flush_n_oldest_blocks)
//!   empties the `n` oldest in-use log blocks. Unresolved patches are moved
//!   forward into the active block when possible; otherwise their target
//!   block is flushed through the [`PatchOwner`].
//!
//! Modified log blocks reach disk through
//! [`writeback`](DiffOocoreStorage::writeback), which hands all of them to
//! the [`LogBlockDevice`] at once.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

mod in_core;
pub mod patch;

pub use in_core::DiffCoreStorage;
pub use patch::{BufPatch, LOG_BLOCK_HEADER_SIZE, PATCH_HEADER_SIZE};

use crate::encoding::EncodingError;
use crate::io::IoAccount;
use crate::serializer::{
    BufWriteInfo, IndexWriteOp, LogSerializer, SerializerError, TokenUpdate,
};
use patch::{LogBlock, TERMINATOR_SIZE};
use std::io;
use thiserror::Error;
use tracing::{debug, info, trace};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Serializer error: {0}")]
    Serializer(#[from] SerializerError),

    /// `init` has not been called.
    #[error("diff storage is not initialized")]
    NotInitialized,

    /// The log block range or block size cannot hold a log.
    #[error("invalid log range: {0}")]
    InvalidRange(String),

    /// Fewer log blocks are in use than were asked to be flushed.
    #[error("asked to flush {requested} log blocks, only {in_use} in use")]
    NotEnoughLogBlocks { requested: usize, in_use: usize },

    /// A patch reaches past the end of its target block.
    #[error("patch for block {block_id} ends at byte {end}, block size {block_size}")]
    PatchOutOfBounds {
        block_id: u64,
        end: usize,
        block_size: usize,
    },

    #[error("corrupt log block {block_id}: {reason}")]
    CorruptLogBlock { block_id: u64, reason: String },

    /// The owner could not flush a target block.
    #[error("flushing block {block_id} failed: {reason}")]
    Flush { block_id: u64, reason: String },
}

// ------------------------------------------------------------------------------------------------
// Collaborators
// ------------------------------------------------------------------------------------------------

/// Where log blocks are read from and written to.
pub trait LogBlockDevice {
    fn log_block_size(&self) -> usize;

    /// Contents of `block_id`, `None` if it was never written or is deleted.
    fn read_log_block(&self, block_id: u64) -> Result<Option<Vec<u8>>, DiffError>;

    /// Writes all `blocks` atomically.
    fn write_log_blocks(&self, blocks: Vec<(u64, Vec<u8>)>) -> Result<(), DiffError>;
}

/// The cache that owns the patched blocks.
pub trait PatchOwner {
    /// Highest patch counter already contained in the stored image of
    /// `block_id`, or `None` if the block no longer exists.
    fn applied_patch_counter(&self, block_id: u64) -> Option<u64>;

    /// Durably writes `block_id` with `patches` applied.
    fn flush_block(&mut self, block_id: u64, patches: &[BufPatch]) -> Result<(), DiffError>;
}

/// Which log block `store_patch` compacts when the active one is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogBlockSelection {
    /// The block with the lowest log sequence.
    #[default]
    OldestFirst,
    /// The block holding the fewest unresolved patch bytes.
    LeastLive,
}

// ------------------------------------------------------------------------------------------------
// DiffOocoreStorage
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
pub struct DiffOocoreStorage {
    block_size: usize,
    selection: LogBlockSelection,
    first_block: u64,
    blocks: Vec<LogBlock>,
    active: usize,
    next_sequence: u64,
}

impl DiffOocoreStorage {
    pub fn new(block_size: usize, selection: LogBlockSelection) -> Self {
        Self {
            block_size,
            selection,
            first_block: 0,
            blocks: Vec::new(),
            active: 0,
            next_sequence: 1,
        }
    }

    /// Reserves `number_of_blocks` serializer blocks starting at
    /// `first_block` and resets them to empty log blocks in memory.
    pub fn init(&mut self, first_block: u64, number_of_blocks: usize) -> Result<(), DiffError> {
        if number_of_blocks == 0 {
            return Err(DiffError::InvalidRange("no log blocks".into()));
        }
        if self.block_size < LOG_BLOCK_HEADER_SIZE + PATCH_HEADER_SIZE + TERMINATOR_SIZE + 1 {
            return Err(DiffError::InvalidRange(format!(
                "block size {} cannot hold a patch",
                self.block_size
            )));
        }
        self.first_block = first_block;
        self.blocks = (0..number_of_blocks)
            .map(|_| LogBlock::empty(self.block_size, 0))
            .collect();
        self.active = 0;
        self.next_sequence = 1;
        self.restamp_active();
        debug!(first_block, number_of_blocks, "diff log initialized");
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<(), DiffError> {
        if self.blocks.is_empty() {
            return Err(DiffError::NotInitialized);
        }
        Ok(())
    }

    /// Gives the active block a fresh, highest log sequence.
    fn restamp_active(&mut self) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let block = &mut self.blocks[self.active];
        block.sequence = sequence;
        block.image[4..LOG_BLOCK_HEADER_SIZE].copy_from_slice(&sequence.to_le_bytes());
        block.dirty = true;
    }

    // --------------------------------------------------------------------------------------------
    // Loading
    // --------------------------------------------------------------------------------------------

    /// Reads every log block and rebuilds `in_core` from the patches that
    /// are neither applied to their block already nor aimed at a deleted
    /// block. Returns the number of patches loaded.
    pub fn load_patches(
        &mut self,
        device: &dyn LogBlockDevice,
        owner: &dyn PatchOwner,
        in_core: &mut DiffCoreStorage,
    ) -> Result<usize, DiffError> {
        self.ensure_initialized()?;
        let mut loaded = 0;
        let mut discarded = 0;

        for i in 0..self.blocks.len() {
            let block_id = self.first_block + i as u64;
            let parsed = match device.read_log_block(block_id)? {
                Some(raw) => LogBlock::parse(block_id, &raw, self.block_size)?,
                None => None,
            };
            let Some((block, patches)) = parsed else {
                self.blocks[i] = LogBlock::empty(self.block_size, 0);
                continue;
            };
            for patch in patches {
                match owner.applied_patch_counter(patch.block_id) {
                    Some(applied) if patch.patch_counter > applied => {
                        in_core.store_patch(patch);
                        loaded += 1;
                    }
                    _ => discarded += 1,
                }
            }
            self.blocks[i] = block;
        }

        let (newest, sequence) = self
            .blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (i, b.sequence))
            .fold((0, 0), |best, cur| if cur.1 > best.1 { cur } else { best });
        self.active = newest;
        self.next_sequence = sequence + 1;
        if sequence == 0 {
            self.restamp_active();
        }

        info!(
            loaded,
            discarded,
            in_use = self.in_use_blocks(),
            active = self.active_block(),
            "diff log loaded"
        );
        Ok(loaded)
    }

    // --------------------------------------------------------------------------------------------
    // Storing
    // --------------------------------------------------------------------------------------------

    /// Appends `patch` to the active log block. Never blocks. Returns
    /// `false` if no log space could be found; the caller then flushes the
    /// target block instead. On success the caller records the patch in
    /// `in_core` as well.
    pub fn store_patch(&mut self, patch: &BufPatch, in_core: &DiffCoreStorage) -> bool {
        if self.blocks.is_empty() {
            return false;
        }
        let size = patch.serialized_size();
        if size > u16::MAX as usize || !LogBlock::empty(self.block_size, 0).fits(size) {
            return false;
        }

        if !self.blocks[self.active].fits(size) {
            let chosen = self.select_block_for_compaction(in_core);
            if let Err(e) = self.compact_block(chosen, in_core) {
                debug!(block = self.first_block + chosen as u64, error = %e, "log block compaction failed");
                return false;
            }
            if !self.blocks[chosen].fits(size) {
                trace!(size, "no log space for patch");
                return false;
            }
            self.active = chosen;
            self.restamp_active();
        }

        self.blocks[self.active].append(patch).is_ok()
    }

    fn select_block_for_compaction(&self, in_core: &DiffCoreStorage) -> usize {
        let candidates = (0..self.blocks.len()).filter(|i| *i != self.active || self.blocks.len() == 1);
        let chosen = match self.selection {
            LogBlockSelection::OldestFirst => {
                candidates.min_by_key(|i| (self.blocks[*i].sequence, *i))
            }
            LogBlockSelection::LeastLive => {
                candidates.min_by_key(|i| (self.live_bytes(*i, in_core), self.blocks[*i].sequence))
            }
        };
        chosen.unwrap_or(self.active)
    }

    fn live_bytes(&self, index: usize, in_core: &DiffCoreStorage) -> usize {
        match self.blocks[index].patches() {
            Ok(patches) => patches
                .iter()
                .filter(|p| in_core.is_unresolved(p))
                .map(BufPatch::serialized_size)
                .sum(),
            Err(_) => usize::MAX,
        }
    }

    /// Rewrites a log block keeping only its unresolved patches.
    fn compact_block(&mut self, index: usize, in_core: &DiffCoreStorage) -> Result<(), DiffError> {
        let patches = self.blocks[index].patches()?;
        let before = patches.len();
        let mut fresh = LogBlock::empty(self.block_size, self.blocks[index].sequence);
        for patch in patches.iter().filter(|p| in_core.is_unresolved(p)) {
            fresh.append(patch)?;
        }
        trace!(
            block = self.first_block + index as u64,
            before,
            after = fresh.patch_count,
            "log block compacted"
        );
        self.blocks[index] = fresh;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Flushing
    // --------------------------------------------------------------------------------------------

    /// Empties the `n` oldest in-use log blocks. May block while the owner
    /// flushes target blocks.
    pub fn flush_n_oldest_blocks(
        &mut self,
        n: usize,
        owner: &mut dyn PatchOwner,
        in_core: &mut DiffCoreStorage,
    ) -> Result<(), DiffError> {
        self.ensure_initialized()?;
        let mut in_use: Vec<usize> = (0..self.blocks.len())
            .filter(|i| self.blocks[*i].patch_count > 0)
            .collect();
        if n > in_use.len() {
            return Err(DiffError::NotEnoughLogBlocks {
                requested: n,
                in_use: in_use.len(),
            });
        }
        in_use.sort_by_key(|i| self.blocks[*i].sequence);
        let victims = &in_use[..n];
        let merge_target = (!victims.contains(&self.active)
            && self.blocks[self.active].patch_count > 0)
            .then_some(self.active);

        let mut moved = 0;
        let mut flushed = 0;
        for &victim in victims {
            for patch in self.blocks[victim].patches()? {
                if !in_core.is_unresolved(&patch) {
                    continue;
                }
                if let Some(active) = merge_target {
                    if self.blocks[active].fits(patch.serialized_size()) {
                        self.blocks[active].append(&patch)?;
                        moved += 1;
                        continue;
                    }
                }
                let pending = in_core.patches_for(patch.block_id).to_vec();
                owner.flush_block(patch.block_id, &pending)?;
                in_core.drop_patches(patch.block_id);
                flushed += 1;
            }

            let sequence = if victim == self.active {
                self.blocks[victim].sequence
            } else {
                0
            };
            self.blocks[victim] = LogBlock::empty(self.block_size, sequence);
        }

        debug!(n, moved, flushed, "oldest log blocks flushed");
        Ok(())
    }

    /// Writes every modified log block. Returns how many were written.
    pub fn writeback(&mut self, device: &dyn LogBlockDevice) -> Result<usize, DiffError> {
        self.ensure_initialized()?;
        let dirty: Vec<(u64, Vec<u8>)> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.dirty)
            .map(|(i, b)| (self.first_block + i as u64, b.image.clone()))
            .collect();
        let count = dirty.len();
        if count > 0 {
            device.write_log_blocks(dirty)?;
            for block in &mut self.blocks {
                block.dirty = false;
            }
            trace!(count, "log blocks written back");
        }
        Ok(count)
    }

    // --------------------------------------------------------------------------------------------
    // Queries
    // --------------------------------------------------------------------------------------------

    /// Log blocks holding at least one patch record.
    pub fn in_use_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.patch_count > 0).count()
    }

    /// Serializer block id of the active log block.
    pub fn active_block(&self) -> u64 {
        self.first_block + self.active as u64
    }

    /// Bytes still free in the active log block.
    pub fn active_free_space(&self) -> usize {
        self.blocks.get(self.active).map_or(0, |b| {
            b.image.len().saturating_sub(b.end + TERMINATOR_SIZE)
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Serializer-backed log device
// ------------------------------------------------------------------------------------------------

impl LogBlockDevice for LogSerializer {
    fn log_block_size(&self) -> usize {
        self.get_block_size() as usize
    }

    fn read_log_block(&self, block_id: u64) -> Result<Option<Vec<u8>>, DiffError> {
        let Some(token) = self.index_read(block_id)? else {
            return Ok(None);
        };
        Ok(Some(self.block_read(&token, &IoAccount::default())?))
    }

    fn write_log_blocks(&self, blocks: Vec<(u64, Vec<u8>)>) -> Result<(), DiffError> {
        if blocks.is_empty() {
            return Ok(());
        }
        let writes: Vec<BufWriteInfo> = blocks
            .into_iter()
            .map(|(block_id, data)| BufWriteInfo { block_id, data })
            .collect();
        let tokens = self.block_writes(&writes, &IoAccount::default())?;
        let ops = tokens
            .into_iter()
            .map(|token| IndexWriteOp {
                block_id: token.block_id(),
                token: TokenUpdate::Set(token),
                recency: None,
            })
            .collect();
        self.index_write(ops)?;
        Ok(())
    }
}
