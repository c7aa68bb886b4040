//! # LBA Index
//!
//! Durable map from logical block id to the slot currently holding the
//! block's bytes, together with its payload size, recency and delete bit.
//!
//! ## On-disk representation
//!
//! The index is an append-only log of fixed-size [`LbaEntry`] records
//! (32 bytes each, CRC-sealed) written into LBA extents:
//!
//! ```text
//! block_id u64 | offset u64 (u64::MAX = tombstone) | recency u64 | size u32 | crc32 u32
//! ```
//!
//! Entries fill one extent at a time. Extents that have been filled are
//! listed, in fill order, by the **LBA superblock** (an extent of its own:
//! `"LBAS" | count u32 | offsets u64… | crc32`), which is rewritten into a
//! fresh extent whenever the list changes. The metablock's [`LbaMixin`]
//! points at the superblock and at the partially filled last extent, and
//! records how many of its entries are committed; anything past that count
//! was written by a commit that never got its metablock and is ignored.
//!
//! ## Visibility
//!
//! [`append_writes`](LbaIndex::append_writes) only puts entries on disk. The
//! in-memory map changes through [`apply`](LbaIndex::apply) once the
//! metablock covering them is durable, so lookups never observe an
//! uncommitted transaction.
//!
//! ## Compaction
//!
//! Every overwrite leaves a dead entry behind. When the on-disk entry count
//! exceeds `compaction_ratio × live entries` plus one extent of slack, the
//! committed live entries are rewritten into fresh extents and the old
//! extents are released through the open extent transaction. Tombstones do
//! not survive compaction; `max_block_id` is carried by the mixin instead.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::extent::{ExtentError, ExtentManager, NULL_OFFSET};
use crate::file::DbFile;
use crate::serializer::shutdown::ShutdownListener;
use std::{collections::BTreeMap, io};
use thiserror::Error;
use tracing::{debug, info};

/// Size of one sealed LBA entry on disk.
pub const LBA_ENTRY_SIZE: u64 = 32;

const TOMBSTONE_OFFSET: u64 = u64::MAX;
const SUPERBLOCK_MAGIC: [u8; 4] = *b"LBAS";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LbaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Extent error: {0}")]
    Extent(#[from] ExtentError),

    /// A committed entry failed validation during recovery.
    #[error("Corrupt LBA entry at offset {offset}: {reason}")]
    CorruptEntry { offset: u64, reason: String },

    /// The superblock failed validation during recovery.
    #[error("Corrupt LBA superblock: {0}")]
    CorruptSuperblock(String),

    /// The superblock cannot list another full extent.
    #[error("LBA superblock full ({0} extents)")]
    SuperblockFull(usize),
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// One durable index mutation. `offset == None` is a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbaEntry {
    pub block_id: u64,
    pub offset: Option<u64>,
    pub recency: u64,
    pub size: u32,
}

impl Encode for LbaEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.block_id.encode_to(buf)?;
        self.offset.unwrap_or(TOMBSTONE_OFFSET).encode_to(buf)?;
        self.recency.encode_to(buf)?;
        self.size.encode_to(buf)
    }
}

impl Decode for LbaEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (block_id, mut offset) = u64::decode_from(buf)?;
        let (raw_offset, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (recency, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                block_id,
                offset: (raw_offset != TOMBSTONE_OFFSET).then_some(raw_offset),
                recency,
                size,
            },
            offset,
        ))
    }
}

/// Ordered list of full LBA extents.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Superblock {
    extents: Vec<u64>,
}

impl Encode for Superblock {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        SUPERBLOCK_MAGIC.encode_to(buf)?;
        encoding::encode_vec(&self.extents, buf)
    }
}

impl Decode for Superblock {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (magic, offset) = <[u8; 4]>::decode_from(buf)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(EncodingError::InvalidTag {
                tag: u32::from_le_bytes(magic),
                type_name: "LBA superblock magic",
            });
        }
        let (extents, n) = encoding::decode_vec::<u64>(&buf[offset..])?;
        Ok((Self { extents }, offset + n))
    }
}

/// LBA state embedded in every metablock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbaMixin {
    pub superblock_offset: u64,
    pub superblock_entries: u32,
    pub last_extent_offset: u64,
    pub last_extent_entries: u32,
    pub max_block_id: u64,
}

impl LbaMixin {
    pub fn empty() -> Self {
        Self {
            superblock_offset: NULL_OFFSET,
            superblock_entries: 0,
            last_extent_offset: NULL_OFFSET,
            last_extent_entries: 0,
            max_block_id: 0,
        }
    }
}

impl Encode for LbaMixin {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.superblock_offset.encode_to(buf)?;
        self.superblock_entries.encode_to(buf)?;
        self.last_extent_offset.encode_to(buf)?;
        self.last_extent_entries.encode_to(buf)?;
        self.max_block_id.encode_to(buf)
    }
}

impl Decode for LbaMixin {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (superblock_offset, mut offset) = u64::decode_from(buf)?;
        let (superblock_entries, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (last_extent_offset, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (last_extent_entries, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (max_block_id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                superblock_offset,
                superblock_entries,
                last_extent_offset,
                last_extent_entries,
                max_block_id,
            },
            offset,
        ))
    }
}

/// Committed location of a live block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbaLookup {
    pub offset: u64,
    pub size: u32,
    pub recency: u64,
}

/// On-disk position state captured before a commit, restored if the
/// commit fails before its metablock is written.
#[derive(Debug, Clone)]
pub struct LbaCheckpoint {
    full_extents: Vec<u64>,
    superblock_offset: Option<u64>,
    last_extent: Option<u64>,
    last_extent_entries: u32,
    max_block_id: u64,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    offset: Option<u64>,
    size: u32,
    recency: u64,
}

// ------------------------------------------------------------------------------------------------
// LbaIndex
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
pub struct LbaIndex {
    extent_size: u64,
    entries_per_extent: u32,
    compaction_ratio: f64,

    map: BTreeMap<u64, Record>,
    live_entries: u64,
    max_block_id: u64,
    /// Set by a compaction whose metablock is not yet durable.
    purge_tombstones: bool,

    full_extents: Vec<u64>,
    superblock_offset: Option<u64>,
    last_extent: Option<u64>,
    last_extent_entries: u32,
}

impl LbaIndex {
    /// Empty index for a freshly created store.
    pub fn new(extent_size: u64, compaction_ratio: f64) -> Self {
        Self {
            extent_size,
            entries_per_extent: (extent_size / LBA_ENTRY_SIZE) as u32,
            compaction_ratio,
            map: BTreeMap::new(),
            live_entries: 0,
            max_block_id: 0,
            purge_tombstones: false,
            full_extents: Vec::new(),
            superblock_offset: None,
            last_extent: None,
            last_extent_entries: 0,
        }
    }

    /// Rebuilds the index from a file image, reserving every extent it owns.
    pub fn start_existing(
        image: &[u8],
        mixin: &LbaMixin,
        extents: &mut ExtentManager,
        compaction_ratio: f64,
    ) -> Result<Self, LbaError> {
        let mut index = Self::new(extents.extent_size(), compaction_ratio);
        index.max_block_id = mixin.max_block_id;

        if mixin.superblock_offset != NULL_OFFSET {
            let raw = index.extent_bytes(image, mixin.superblock_offset)?;
            let superblock = encoding::unseal::<Superblock>(raw)
                .map_err(|e| LbaError::CorruptSuperblock(e.to_string()))?;
            if superblock.extents.len() != mixin.superblock_entries as usize {
                return Err(LbaError::CorruptSuperblock(format!(
                    "lists {} extents, metablock expects {}",
                    superblock.extents.len(),
                    mixin.superblock_entries
                )));
            }
            extents.reserve(mixin.superblock_offset)?;
            index.superblock_offset = Some(mixin.superblock_offset);

            for extent in superblock.extents {
                extents.reserve(extent)?;
                index.replay_extent(image, extent, index.entries_per_extent)?;
                index.full_extents.push(extent);
            }
        }

        if mixin.last_extent_offset != NULL_OFFSET {
            if mixin.last_extent_entries > index.entries_per_extent {
                return Err(LbaError::CorruptEntry {
                    offset: mixin.last_extent_offset,
                    reason: format!(
                        "{} committed entries exceed extent capacity {}",
                        mixin.last_extent_entries, index.entries_per_extent
                    ),
                });
            }
            extents.reserve(mixin.last_extent_offset)?;
            index.replay_extent(image, mixin.last_extent_offset, mixin.last_extent_entries)?;
            index.last_extent = Some(mixin.last_extent_offset);
            index.last_extent_entries = mixin.last_extent_entries;
        }

        info!(
            live = index.live_entries,
            on_disk = index.on_disk_entries(),
            max_block_id = index.max_block_id,
            "LBA index recovered"
        );
        Ok(index)
    }

    fn extent_bytes<'a>(&self, image: &'a [u8], extent: u64) -> Result<&'a [u8], LbaError> {
        let start = extent as usize;
        let end = start + self.extent_size as usize;
        if end > image.len() {
            return Err(LbaError::CorruptEntry {
                offset: extent,
                reason: "extent lies past the end of the file".into(),
            });
        }
        Ok(&image[start..end])
    }

    fn replay_extent(&mut self, image: &[u8], extent: u64, count: u32) -> Result<(), LbaError> {
        let raw = self.extent_bytes(image, extent)?;
        for i in 0..count as usize {
            let start = i * LBA_ENTRY_SIZE as usize;
            let record = &raw[start..start + LBA_ENTRY_SIZE as usize];
            let entry =
                encoding::unseal::<LbaEntry>(record).map_err(|e| LbaError::CorruptEntry {
                    offset: extent + start as u64,
                    reason: e.to_string(),
                })?;
            if entry.block_id >= self.max_block_id {
                return Err(LbaError::CorruptEntry {
                    offset: extent + start as u64,
                    reason: format!(
                        "block id {} beyond recorded max {}",
                        entry.block_id, self.max_block_id
                    ),
                });
            }
            self.apply(&entry);
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Queries
    // --------------------------------------------------------------------------------------------

    fn record(&self, block_id: u64) -> Option<&Record> {
        self.map.get(&block_id)
    }

    /// Location of a live block; `None` for deleted or never written blocks.
    pub fn lookup(&self, block_id: u64) -> Option<LbaLookup> {
        let record = self.record(block_id)?;
        record.offset.map(|offset| LbaLookup {
            offset,
            size: record.size,
            recency: record.recency,
        })
    }

    /// Recency of the last committed write or delete, `0` if none survives.
    pub fn get_recency(&self, block_id: u64) -> u64 {
        self.record(block_id).map_or(0, |r| r.recency)
    }

    /// `true` for deleted and never written blocks.
    pub fn get_delete_bit(&self, block_id: u64) -> bool {
        self.lookup(block_id).is_none()
    }

    /// One past the highest block id ever written.
    pub fn max_block_id(&self) -> u64 {
        self.max_block_id
    }

    pub fn live_entries(&self) -> u64 {
        self.live_entries
    }

    pub fn on_disk_entries(&self) -> u64 {
        self.full_extents.len() as u64 * self.entries_per_extent as u64
            + self.last_extent_entries as u64
    }

    /// Every live block with its committed location.
    pub fn iter_live(&self) -> impl Iterator<Item = (u64, LbaLookup)> + '_ {
        self.map.iter().filter_map(|(&id, record)| {
            record.offset.map(|offset| {
                (
                    id,
                    LbaLookup {
                        offset,
                        size: record.size,
                        recency: record.recency,
                    },
                )
            })
        })
    }

    /// Extents owned by the index (superblock included).
    pub fn owned_extents(&self) -> Vec<u64> {
        let mut owned = self.full_extents.clone();
        owned.extend(self.last_extent);
        owned.extend(self.superblock_offset);
        owned
    }

    pub fn mixin(&self) -> LbaMixin {
        LbaMixin {
            superblock_offset: self.superblock_offset.unwrap_or(NULL_OFFSET),
            superblock_entries: self.full_extents.len() as u32,
            last_extent_offset: self.last_extent.unwrap_or(NULL_OFFSET),
            last_extent_entries: self.last_extent_entries,
            max_block_id: self.max_block_id,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Mutation
    // --------------------------------------------------------------------------------------------

    /// Applies a committed entry to the in-memory map and returns the
    /// previous live offset of the block, if any.
    pub fn apply(&mut self, entry: &LbaEntry) -> Option<u64> {
        let record = Record {
            offset: entry.offset,
            size: entry.size,
            recency: entry.recency,
        };
        let previous = self
            .map
            .insert(entry.block_id, record)
            .and_then(|r| r.offset);
        if previous.is_some() {
            self.live_entries -= 1;
        }
        if entry.offset.is_some() {
            self.live_entries += 1;
        }
        self.max_block_id = self.max_block_id.max(entry.block_id + 1);
        previous
    }

    /// Writes `entries` to the on-disk log. They become visible only through
    /// [`apply`](Self::apply) after the covering metablock is durable.
    pub fn append_writes(
        &mut self,
        entries: &[LbaEntry],
        file: &DbFile,
        extents: &mut ExtentManager,
    ) -> Result<(), LbaError> {
        let superblock_dirty = self.write_entries(entries, file, extents)?;
        for entry in entries {
            self.max_block_id = self.max_block_id.max(entry.block_id + 1);
        }
        if superblock_dirty {
            self.write_superblock(file, extents)?;
        }
        Ok(())
    }

    /// Returns `true` if an extent filled up and the superblock must be rewritten.
    fn write_entries(
        &mut self,
        entries: &[LbaEntry],
        file: &DbFile,
        extents: &mut ExtentManager,
    ) -> Result<bool, LbaError> {
        let mut superblock_dirty = false;
        let mut remaining = entries;

        while !remaining.is_empty() {
            let extent = match self.last_extent {
                Some(extent) if self.last_extent_entries < self.entries_per_extent => extent,
                current => {
                    if let Some(full) = current {
                        if self.full_extents.len() >= self.superblock_capacity() {
                            return Err(LbaError::SuperblockFull(self.full_extents.len()));
                        }
                        self.full_extents.push(full);
                        superblock_dirty = true;
                    }
                    let fresh = extents.allocate(file)?;
                    self.last_extent = Some(fresh);
                    self.last_extent_entries = 0;
                    fresh
                }
            };

            let room = (self.entries_per_extent - self.last_extent_entries) as usize;
            let take = room.min(remaining.len());
            let mut buf = Vec::with_capacity(take * LBA_ENTRY_SIZE as usize);
            for entry in &remaining[..take] {
                buf.extend_from_slice(&encoding::seal(entry, LBA_ENTRY_SIZE as usize)?);
            }
            let at = extent + self.last_extent_entries as u64 * LBA_ENTRY_SIZE;
            file.write_at(at, &buf)?;

            self.last_extent_entries += take as u32;
            remaining = &remaining[take..];
        }
        Ok(superblock_dirty)
    }

    fn superblock_capacity(&self) -> usize {
        // magic + count + crc
        ((self.extent_size as usize).saturating_sub(12)) / 8
    }

    fn write_superblock(
        &mut self,
        file: &DbFile,
        extents: &mut ExtentManager,
    ) -> Result<(), LbaError> {
        let old = self.superblock_offset.take();
        if !self.full_extents.is_empty() {
            let superblock = Superblock {
                extents: self.full_extents.clone(),
            };
            let bytes = encoding::seal(&superblock, self.extent_size as usize)?;
            let fresh = extents.allocate(file)?;
            file.write_at(fresh, &bytes)?;
            self.superblock_offset = Some(fresh);
        }
        if let Some(old) = old {
            extents.free(old)?;
        }
        debug!(
            extents = self.full_extents.len(),
            superblock = ?self.superblock_offset,
            "LBA superblock rewritten"
        );
        Ok(())
    }

    pub fn checkpoint(&self) -> LbaCheckpoint {
        LbaCheckpoint {
            full_extents: self.full_extents.clone(),
            superblock_offset: self.superblock_offset,
            last_extent: self.last_extent,
            last_extent_entries: self.last_extent_entries,
            max_block_id: self.max_block_id,
        }
    }

    /// Forgets everything written since `checkpoint`. Entries past the
    /// restored position are overwritten by the next append.
    pub fn rollback(&mut self, checkpoint: LbaCheckpoint) {
        self.full_extents = checkpoint.full_extents;
        self.superblock_offset = checkpoint.superblock_offset;
        self.last_extent = checkpoint.last_extent;
        self.last_extent_entries = checkpoint.last_extent_entries;
        self.max_block_id = checkpoint.max_block_id;
        self.purge_tombstones = false;
    }

    /// Called once the metablock of a commit is durable, before its entries
    /// are applied. Tombstones dropped from disk by a compaction in that
    /// commit are forgotten in memory too.
    pub fn commit_compaction(&mut self) {
        if std::mem::take(&mut self.purge_tombstones) {
            let before = self.map.len();
            self.map.retain(|_, r| r.offset.is_some());
            debug!(dropped = before - self.map.len(), "compacted tombstones forgotten");
        }
    }

    /// Whether dead entries outweigh live ones enough to warrant compaction.
    pub fn needs_compaction(&self) -> bool {
        let slack = self.entries_per_extent as f64;
        let on_disk = self.on_disk_entries() as f64;
        self.full_extents.len() >= 2
            && on_disk > self.compaction_ratio * self.live_entries as f64 + slack
    }

    /// Rewrites the committed live entries into fresh extents. The old
    /// extents are freed through the caller's open extent transaction, and
    /// tombstones stay visible until [`commit_compaction`](Self::commit_compaction).
    pub fn compact(&mut self, file: &DbFile, extents: &mut ExtentManager) -> Result<(), LbaError> {
        let before = self.on_disk_entries();
        let mut old = std::mem::take(&mut self.full_extents);
        old.extend(self.last_extent.take());
        self.last_extent_entries = 0;

        let live: Vec<LbaEntry> = self
            .iter_live()
            .map(|(block_id, l)| LbaEntry {
                block_id,
                offset: Some(l.offset),
                recency: l.recency,
                size: l.size,
            })
            .collect();

        // Tombstoned ids are forgotten once the metablock is durable; the
        // mixin keeps max_block_id.
        self.purge_tombstones = true;

        self.write_entries(&live, file, extents)?;
        for extent in old {
            extents.free(extent)?;
        }
        self.write_superblock(file, extents)?;

        info!(before, after = self.on_disk_entries(), "LBA compacted");
        Ok(())
    }

    /// Nothing is buffered in memory, so the index is flushed as soon as the
    /// last metablock is durable.
    pub fn shutdown(&mut self, listener: &mut dyn ShutdownListener) {
        debug!(live = self.live_entries, "LBA index shut down");
        listener.on_shutdown_complete();
    }
}
