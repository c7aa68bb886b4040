//! # Data Block Manager
//!
//! Places block payloads into data extents and decides when those extents
//! can be reclaimed.
//!
//! ## Slots
//!
//! A data extent is divided into `blocks_per_extent` fixed-size slots of
//! `BLOCK_HEADER_SIZE + block_size` bytes. Every slot starts with a header:
//!
//! ```text
//! block_id u64 | block_sequence_id u64 | payload_len u32 | crc32 u32
//! ```
//!
//! The CRC covers the first 20 header bytes and the payload. Slots are
//! handed out sequentially from the *active* extent; when it is full a new
//! extent is allocated. The active extent and the next free slot form the
//! [`DataBlockMixin`].
//!
//! ## Liveness
//!
//! Each tracked extent keeps an *index bit* per slot, set while the
//! committed LBA maps a block to it. Outstanding block tokens (and read
//! pins) are the second source of liveness and are asked of the token
//! registry. A slot is garbage only when both are clear; an extent is
//! returned to the extent manager only when every slot is garbage.
//!
//! ## Garbage collection
//!
//! The garbage ratio is measured over all non-active extents. Once it rises
//! above `gc_high_ratio` the serializer's commit thread relocates the
//! index-live blocks of the least utilised extents
//! ([`gc_candidates`](DataBlockManager::gc_candidates)) until it falls
//! below `gc_low_ratio`. Slots kept alive only by tokens are never moved;
//! their extent is freed once the tokens are released.

#[cfg(test)]
mod tests;

use crate::encoding::{Decode, Encode, EncodingError};
use crate::extent::{ExtentError, ExtentManager, NULL_OFFSET};
use crate::file::DbFile;
use crate::lba::LbaIndex;
use crate::serializer::shutdown::ShutdownListener;
use crate::token::TokenRegistry;
use std::{
    collections::{BTreeMap, HashSet},
    io,
};
use thiserror::Error;
use tracing::{debug, trace};

/// Size of the header in front of every payload.
pub const BLOCK_HEADER_SIZE: u64 = 24;

/// Header bytes covered by the CRC (everything but the CRC itself).
const CHECKSUMMED_HEADER_SIZE: usize = 20;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DataBlockError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Extent error: {0}")]
    Extent(#[from] ExtentError),

    /// A slot's header or payload failed validation.
    #[error("Corrupt block at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// The payload does not fit into a slot.
    #[error("Payload of {len} bytes exceeds block size {block_size}")]
    PayloadTooLarge { len: usize, block_size: u32 },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

// ------------------------------------------------------------------------------------------------
// Slot header
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_id: u64,
    pub block_sequence_id: u64,
    pub payload_len: u32,
}

impl Encode for BlockHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.block_id.encode_to(buf)?;
        self.block_sequence_id.encode_to(buf)?;
        self.payload_len.encode_to(buf)
    }
}

impl Decode for BlockHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (block_id, mut offset) = u64::decode_from(buf)?;
        let (block_sequence_id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (payload_len, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                block_id,
                block_sequence_id,
                payload_len,
            },
            offset,
        ))
    }
}

fn block_crc(header_bytes: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_bytes);
    hasher.update(payload);
    hasher.finalize()
}

/// Builds the on-disk image of a slot: header, then payload.
pub fn encode_block(header: &BlockHeader, payload: &[u8]) -> Result<Vec<u8>, DataBlockError> {
    let mut buf = Vec::with_capacity(BLOCK_HEADER_SIZE as usize + payload.len());
    header.encode_to(&mut buf)?;
    let crc = block_crc(&buf, payload);
    crc.encode_to(&mut buf)?;
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Validates a slot image read from `offset` and splits it into header and payload.
///
/// `raw` must hold at least the header and `payload_len` payload bytes.
pub fn decode_block(offset: u64, raw: &[u8]) -> Result<(BlockHeader, Vec<u8>), DataBlockError> {
    let corrupt = |reason: String| DataBlockError::Corrupt { offset, reason };
    let (header, n) = BlockHeader::decode_from(raw).map_err(|e| corrupt(e.to_string()))?;
    let (stored, _) = u32::decode_from(&raw[n..]).map_err(|e| corrupt(e.to_string()))?;

    let start = BLOCK_HEADER_SIZE as usize;
    let end = start + header.payload_len as usize;
    if raw.len() < end {
        return Err(corrupt(format!(
            "header claims {} payload bytes, only {} available",
            header.payload_len,
            raw.len() - start
        )));
    }
    let payload = &raw[start..end];
    let computed = block_crc(&raw[..CHECKSUMMED_HEADER_SIZE], payload);
    if stored != computed {
        return Err(corrupt(format!(
            "checksum mismatch (stored {stored:08x}, computed {computed:08x})"
        )));
    }
    Ok((header, payload.to_vec()))
}

/// Reads and validates the block at `offset` whose payload is `payload_len` bytes.
pub fn read_block(
    file: &DbFile,
    offset: u64,
    payload_len: u32,
) -> Result<(BlockHeader, Vec<u8>), DataBlockError> {
    let raw = file.read_at(offset, BLOCK_HEADER_SIZE as usize + payload_len as usize)?;
    let (header, payload) = decode_block(offset, &raw)?;
    if header.payload_len != payload_len {
        return Err(DataBlockError::Corrupt {
            offset,
            reason: format!(
                "payload length {} does not match expected {}",
                header.payload_len, payload_len
            ),
        });
    }
    Ok((header, payload))
}

// ------------------------------------------------------------------------------------------------
// Durable mixin
// ------------------------------------------------------------------------------------------------

/// Data block manager state embedded in every metablock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlockMixin {
    pub active_extent: u64,
    pub next_slot: u32,
}

impl DataBlockMixin {
    pub fn empty() -> Self {
        Self {
            active_extent: NULL_OFFSET,
            next_slot: 0,
        }
    }
}

impl Encode for DataBlockMixin {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.active_extent.encode_to(buf)?;
        self.next_slot.encode_to(buf)
    }
}

impl Decode for DataBlockMixin {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (active_extent, mut offset) = u64::decode_from(buf)?;
        let (next_slot, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                active_extent,
                next_slot,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Garbage collection thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcConfig {
    pub high_ratio: f64,
    pub low_ratio: f64,
    pub extents_per_pass: usize,
}

/// Slot geometry shared by every data extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u32,
    pub blocks_per_extent: u32,
}

impl Geometry {
    pub fn slot_size(&self) -> u64 {
        BLOCK_HEADER_SIZE + self.block_size as u64
    }

    pub fn extent_size(&self) -> u64 {
        self.slot_size() * self.blocks_per_extent as u64
    }
}

// ------------------------------------------------------------------------------------------------
// DataBlockManager
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct ExtentUsage {
    index_bits: Vec<bool>,
    live: u32,
}

impl ExtentUsage {
    fn new(slots: u32) -> Self {
        Self {
            index_bits: vec![false; slots as usize],
            live: 0,
        }
    }
}

#[derive(Debug)]
pub struct DataBlockManager {
    geometry: Geometry,
    gc: GcConfig,
    active: Option<u64>,
    next_slot: u32,
    extents: BTreeMap<u64, ExtentUsage>,
    gc_running: bool,
}

impl DataBlockManager {
    pub fn new(geometry: Geometry, gc: GcConfig) -> Self {
        Self {
            geometry,
            gc,
            active: None,
            next_slot: 0,
            extents: BTreeMap::new(),
            gc_running: false,
        }
    }

    /// Rebuilds usage from the recovered LBA index, reserving every data
    /// extent that holds a live block, plus the active extent.
    pub fn start_existing(
        geometry: Geometry,
        gc: GcConfig,
        mixin: &DataBlockMixin,
        lba: &LbaIndex,
        extents: &mut ExtentManager,
    ) -> Result<Self, DataBlockError> {
        let mut manager = Self::new(geometry, gc);

        if mixin.active_extent != NULL_OFFSET {
            if mixin.next_slot > geometry.blocks_per_extent {
                return Err(DataBlockError::InvariantViolation(format!(
                    "next slot {} beyond {} slots per extent",
                    mixin.next_slot, geometry.blocks_per_extent
                )));
            }
            extents.reserve(mixin.active_extent)?;
            manager
                .extents
                .insert(mixin.active_extent, ExtentUsage::new(geometry.blocks_per_extent));
            manager.active = Some(mixin.active_extent);
            manager.next_slot = mixin.next_slot;
        }

        for (block_id, location) in lba.iter_live() {
            let base = manager.extent_of(location.offset);
            if !manager.extents.contains_key(&base) {
                extents.reserve(base)?;
                manager
                    .extents
                    .insert(base, ExtentUsage::new(geometry.blocks_per_extent));
            }
            manager.mark_live(location.offset).map_err(|e| {
                DataBlockError::InvariantViolation(format!("block {block_id}: {e}"))
            })?;
        }

        debug!(
            extents = manager.extents.len(),
            active = ?manager.active,
            next_slot = manager.next_slot,
            "data block manager started"
        );
        Ok(manager)
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn extent_of(&self, offset: u64) -> u64 {
        offset - offset % self.geometry.extent_size()
    }

    fn slot_index(&self, offset: u64) -> Result<usize, DataBlockError> {
        let within = offset % self.geometry.extent_size();
        if within % self.geometry.slot_size() != 0 {
            return Err(DataBlockError::InvariantViolation(format!(
                "offset {offset} is not slot aligned"
            )));
        }
        Ok((within / self.geometry.slot_size()) as usize)
    }

    /// Offsets of every slot in the extent starting at `extent`.
    pub fn slot_offsets(&self, extent: u64) -> impl Iterator<Item = u64> + use<> {
        let slot_size = self.geometry.slot_size();
        (0..self.geometry.blocks_per_extent as u64).map(move |i| extent + i * slot_size)
    }

    /// Number of extents currently owned by the manager.
    pub fn extent_count(&self) -> usize {
        self.extents.len()
    }

    pub fn active_extent(&self) -> Option<u64> {
        self.active
    }

    /// Reserves the next slot, allocating a fresh extent when the active one is full.
    pub fn allocate_slot(
        &mut self,
        extents: &mut ExtentManager,
        file: &DbFile,
    ) -> Result<u64, DataBlockError> {
        let extent = match self.active {
            Some(extent) if self.next_slot < self.geometry.blocks_per_extent => extent,
            _ => {
                let fresh = extents.allocate(file)?;
                self.extents
                    .insert(fresh, ExtentUsage::new(self.geometry.blocks_per_extent));
                self.active = Some(fresh);
                self.next_slot = 0;
                trace!(extent = fresh, "new active data extent");
                fresh
            }
        };
        let offset = extent + self.next_slot as u64 * self.geometry.slot_size();
        self.next_slot += 1;
        Ok(offset)
    }

    /// Validates a payload length against the block size.
    pub fn check_payload(&self, len: usize) -> Result<u32, DataBlockError> {
        if len > self.geometry.block_size as usize {
            return Err(DataBlockError::PayloadTooLarge {
                len,
                block_size: self.geometry.block_size,
            });
        }
        Ok(len as u32)
    }

    fn usage_mut(&mut self, offset: u64) -> Result<(&mut ExtentUsage, usize), DataBlockError> {
        let slot = self.slot_index(offset)?;
        let base = self.extent_of(offset);
        let usage = self.extents.get_mut(&base).ok_or_else(|| {
            DataBlockError::InvariantViolation(format!(
                "offset {offset} is not in a tracked data extent"
            ))
        })?;
        Ok((usage, slot))
    }

    /// The committed LBA now maps a block to `offset`.
    pub fn mark_live(&mut self, offset: u64) -> Result<(), DataBlockError> {
        let (usage, slot) = self.usage_mut(offset)?;
        if usage.index_bits[slot] {
            return Err(DataBlockError::InvariantViolation(format!(
                "slot at {offset} already referenced by the index"
            )));
        }
        usage.index_bits[slot] = true;
        usage.live += 1;
        Ok(())
    }

    /// The committed LBA no longer maps anything to `offset`.
    pub fn mark_garbage(&mut self, offset: u64) -> Result<(), DataBlockError> {
        let (usage, slot) = self.usage_mut(offset)?;
        if !usage.index_bits[slot] {
            return Err(DataBlockError::InvariantViolation(format!(
                "slot at {offset} is not referenced by the index"
            )));
        }
        usage.index_bits[slot] = false;
        usage.live -= 1;
        Ok(())
    }

    pub fn is_index_live(&self, offset: u64) -> bool {
        let Ok(slot) = self.slot_index(offset) else {
            return false;
        };
        self.extents
            .get(&self.extent_of(offset))
            .is_some_and(|usage| usage.index_bits[slot])
    }

    /// Frees every non-active extent whose slots are all garbage. Returns
    /// the number of extents released.
    pub fn reclaim_free_extents(
        &mut self,
        registry: &mut TokenRegistry,
        extents: &mut ExtentManager,
    ) -> Result<usize, DataBlockError> {
        let candidates: Vec<u64> = self
            .extents
            .iter()
            .filter(|(base, usage)| Some(**base) != self.active && usage.live == 0)
            .map(|(base, _)| *base)
            .collect();

        let mut freed = 0;
        for base in candidates {
            let referenced = self
                .slot_offsets(base)
                .any(|offset| registry.tokens_exist_for(offset));
            if referenced {
                continue;
            }
            self.extents.remove(&base);
            extents.free(base)?;
            freed += 1;
        }
        if freed > 0 {
            debug!(freed, "data extents reclaimed");
        }
        Ok(freed)
    }

    /// Fraction of slots in non-active extents that the index does not reference.
    pub fn garbage_ratio(&self) -> f64 {
        let mut total = 0u64;
        let mut live = 0u64;
        for (base, usage) in &self.extents {
            if Some(*base) == self.active {
                continue;
            }
            total += self.geometry.blocks_per_extent as u64;
            live += usage.live as u64;
        }
        if total == 0 {
            return 0.0;
        }
        1.0 - live as f64 / total as f64
    }

    pub fn gc_wanted(&self) -> bool {
        self.garbage_ratio() > self.gc.high_ratio
    }

    pub fn gc_should_continue(&self) -> bool {
        self.garbage_ratio() > self.gc.low_ratio
    }

    /// Least utilised non-active extents with something to relocate,
    /// skipping those already tried in this pass.
    pub fn gc_candidates(&self, tried: &HashSet<u64>) -> Vec<u64> {
        let mut candidates: Vec<(u32, u64)> = self
            .extents
            .iter()
            .filter(|(base, usage)| {
                Some(**base) != self.active && usage.live > 0 && !tried.contains(*base)
            })
            .map(|(base, usage)| (usage.live, *base))
            .collect();
        candidates.sort_unstable();
        candidates
            .into_iter()
            .take(self.gc.extents_per_pass.max(1))
            .map(|(_, base)| base)
            .collect()
    }

    /// Index-live slots of an extent.
    pub fn live_offsets(&self, extent: u64) -> Vec<u64> {
        match self.extents.get(&extent) {
            Some(usage) => self
                .slot_offsets(extent)
                .zip(usage.index_bits.iter())
                .filter(|(_, live)| **live)
                .map(|(offset, _)| offset)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn set_gc_running(&mut self, running: bool) {
        self.gc_running = running;
    }

    pub fn gc_running(&self) -> bool {
        self.gc_running
    }

    pub fn mixin(&self) -> DataBlockMixin {
        DataBlockMixin {
            active_extent: self.active.unwrap_or(NULL_OFFSET),
            next_slot: self.next_slot,
        }
    }

    /// Reports completion once no GC pass is running.
    pub fn shutdown(&mut self, listener: &mut dyn ShutdownListener) -> Result<(), DataBlockError> {
        if self.gc_running {
            return Err(DataBlockError::InvariantViolation(
                "shutdown requested while a GC pass is running".into(),
            ));
        }
        debug!(extents = self.extents.len(), "data block manager shut down");
        listener.on_shutdown_complete();
        Ok(())
    }
}
