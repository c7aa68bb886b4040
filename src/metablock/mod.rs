//! # Metablock Manager
//!
//! The metablock is the single durable root of the store. It combines the
//! mixins of the extent manager, the LBA index and the data block manager
//! with a block sequence id, and is written to a fixed ring of slots.
//!
//! ## Static region
//!
//! ```text
//! 0            4 KiB                              4 KiB + 8 * 512 B
//! ├────────────┼──────┬──────┬─────┬──────┐
//! │ static hdr │ mb 0 │ mb 1 │ ... │ mb 7 │  padding to whole extents
//! └────────────┴──────┴──────┴─────┴──────┘
//! ```
//!
//! The static header records the block size and extent geometry the file
//! was created with; it is written once by `create` and never changes.
//!
//! ## Ring slots
//!
//! Each slot holds `magic "LSMB" | version u32 | metablock | crc32`, zero
//! padded to [`METABLOCK_SLOT_SIZE`]. Writes always target the slot after
//! the last one written and are fsynced before returning. Recovery reads
//! every slot, skips empty or corrupt ones, and picks the highest block
//! sequence id. A torn write therefore only ever damages the slot being
//! written; the previous one stays valid.

#[cfg(test)]
mod tests;

use crate::data_block::DataBlockMixin;
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::extent::ExtentMixin;
use crate::file::DbFile;
use crate::lba::LbaMixin;
use std::io;
use thiserror::Error;
use tracing::{debug, warn};

/// Size of the static header at offset 0.
pub const STATIC_HEADER_SIZE: u64 = 4096;

/// Size of one metablock ring slot.
pub const METABLOCK_SLOT_SIZE: u64 = 512;

/// Number of slots in the metablock ring.
pub const METABLOCK_RING_SIZE: usize = 8;

/// Bytes used by the static header and the metablock ring.
pub const STATIC_REGION_SIZE: u64 = STATIC_HEADER_SIZE + METABLOCK_SLOT_SIZE * METABLOCK_RING_SIZE as u64;

const STATIC_MAGIC: [u8; 8] = *b"LOGSER\0\0";
const SLOT_MAGIC: [u8; 4] = *b"LSMB";
const FORMAT_VERSION: u32 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MetablockError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// No ring slot holds a metablock that passes its checksum.
    #[error("No valid metablock found in any ring slot")]
    NoValidMetablock,

    /// The static header is missing, corrupt, or from another format.
    #[error("Invalid static header: {0}")]
    InvalidStaticHeader(String),
}

// ------------------------------------------------------------------------------------------------
// Static header
// ------------------------------------------------------------------------------------------------

/// Geometry fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticHeader {
    pub block_size: u32,
    pub blocks_per_extent: u32,
}

impl Encode for StaticHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        STATIC_MAGIC.encode_to(buf)?;
        FORMAT_VERSION.encode_to(buf)?;
        self.block_size.encode_to(buf)?;
        self.blocks_per_extent.encode_to(buf)
    }
}

impl Decode for StaticHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (magic, mut offset) = <[u8; 8]>::decode_from(buf)?;
        if magic != STATIC_MAGIC {
            return Err(EncodingError::InvalidTag {
                tag: u32::from_le_bytes([magic[0], magic[1], magic[2], magic[3]]),
                type_name: "StaticHeader magic",
            });
        }
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        if version != FORMAT_VERSION {
            return Err(EncodingError::InvalidTag {
                tag: version,
                type_name: "StaticHeader version",
            });
        }
        let (block_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (blocks_per_extent, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                block_size,
                blocks_per_extent,
            },
            offset,
        ))
    }
}

/// Reads and validates the static header from a file image.
pub fn read_static_header(image: &[u8]) -> Result<StaticHeader, MetablockError> {
    if (image.len() as u64) < STATIC_REGION_SIZE {
        return Err(MetablockError::InvalidStaticHeader(format!(
            "file is {} bytes, shorter than the static region",
            image.len()
        )));
    }
    encoding::unseal::<StaticHeader>(&image[..STATIC_HEADER_SIZE as usize])
        .map_err(|e| MetablockError::InvalidStaticHeader(e.to_string()))
}

// ------------------------------------------------------------------------------------------------
// Metablock
// ------------------------------------------------------------------------------------------------

/// Durable snapshot of the serializer's sub-managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metablock {
    pub block_sequence_id: u64,
    pub extent: ExtentMixin,
    pub lba: LbaMixin,
    pub data: DataBlockMixin,
}

impl Encode for Metablock {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        SLOT_MAGIC.encode_to(buf)?;
        FORMAT_VERSION.encode_to(buf)?;
        self.block_sequence_id.encode_to(buf)?;
        self.extent.encode_to(buf)?;
        self.lba.encode_to(buf)?;
        self.data.encode_to(buf)
    }
}

impl Decode for Metablock {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (magic, mut offset) = <[u8; 4]>::decode_from(buf)?;
        if magic != SLOT_MAGIC {
            return Err(EncodingError::InvalidTag {
                tag: u32::from_le_bytes(magic),
                type_name: "Metablock magic",
            });
        }
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        if version != FORMAT_VERSION {
            return Err(EncodingError::InvalidTag {
                tag: version,
                type_name: "Metablock version",
            });
        }
        let (block_sequence_id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (extent, n) = ExtentMixin::decode_from(&buf[offset..])?;
        offset += n;
        let (lba, n) = LbaMixin::decode_from(&buf[offset..])?;
        offset += n;
        let (data, n) = DataBlockMixin::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                block_sequence_id,
                extent,
                lba,
                data,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// MetablockManager
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
pub struct MetablockManager {
    next_slot: usize,
    last_written: Option<Metablock>,
}

fn slot_offset(slot: usize) -> u64 {
    STATIC_HEADER_SIZE + slot as u64 * METABLOCK_SLOT_SIZE
}

impl MetablockManager {
    /// Writes the static header, clears the ring and commits `initial` into
    /// slot 0. The file must already span the static region.
    pub fn create(
        file: &DbFile,
        header: &StaticHeader,
        initial: &Metablock,
    ) -> Result<Self, MetablockError> {
        let header_bytes = encoding::seal(header, STATIC_HEADER_SIZE as usize)?;
        file.write_at(0, &header_bytes)?;
        let ring = vec![0u8; (METABLOCK_SLOT_SIZE * METABLOCK_RING_SIZE as u64) as usize];
        file.write_at(STATIC_HEADER_SIZE, &ring)?;

        let mut manager = Self {
            next_slot: 0,
            last_written: None,
        };
        manager.write(file, initial)?;
        Ok(manager)
    }

    /// Scans every ring slot of a file image and returns the valid
    /// metablock with the highest block sequence id.
    pub fn read_latest(image: &[u8]) -> Result<(Self, Metablock), MetablockError> {
        if (image.len() as u64) < STATIC_REGION_SIZE {
            return Err(MetablockError::NoValidMetablock);
        }

        let mut best: Option<(usize, Metablock)> = None;
        for slot in 0..METABLOCK_RING_SIZE {
            let start = slot_offset(slot) as usize;
            let record = &image[start..start + METABLOCK_SLOT_SIZE as usize];
            if record.iter().all(|b| *b == 0) {
                continue;
            }
            match encoding::unseal::<Metablock>(record) {
                Ok(mb) => {
                    let newer = best
                        .as_ref()
                        .is_none_or(|(_, b)| mb.block_sequence_id > b.block_sequence_id);
                    if newer {
                        best = Some((slot, mb));
                    }
                }
                Err(e) => warn!(slot, error = %e, "skipping invalid metablock slot"),
            }
        }

        let (slot, mb) = best.ok_or(MetablockError::NoValidMetablock)?;
        debug!(slot, block_sequence_id = mb.block_sequence_id, "latest metablock selected");
        Ok((
            Self {
                next_slot: (slot + 1) % METABLOCK_RING_SIZE,
                last_written: Some(mb),
            },
            mb,
        ))
    }

    /// Writes `mb` into the next ring slot and waits until it is durable.
    pub fn write(&mut self, file: &DbFile, mb: &Metablock) -> Result<(), MetablockError> {
        let record = encoding::seal(mb, METABLOCK_SLOT_SIZE as usize)?;
        file.write_at(slot_offset(self.next_slot), &record)?;
        file.sync()?;
        debug!(
            slot = self.next_slot,
            block_sequence_id = mb.block_sequence_id,
            "metablock written"
        );
        self.next_slot = (self.next_slot + 1) % METABLOCK_RING_SIZE;
        self.last_written = Some(*mb);
        Ok(())
    }

    /// The most recently written (or recovered) metablock.
    pub fn last_written(&self) -> Option<&Metablock> {
        self.last_written.as_ref()
    }

    /// Ring slot the next write targets.
    pub fn next_slot(&self) -> usize {
        self.next_slot
    }
}
