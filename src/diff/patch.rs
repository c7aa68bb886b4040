//! Patch records and the log block container they are stored in.
//!
//! ```text
//! log block: "LOGB" | log_sequence u64 | patch… | 0u16
//! patch:     len u16 | block_id u64 | patch_counter u64 | offset u32 | data
//! ```
//!
//! `len` counts the whole patch record. A zero length terminates the list.

use super::DiffError;
use crate::encoding::{Decode, Encode, EncodingError};

pub(crate) const LOG_BLOCK_MAGIC: [u8; 4] = *b"LOGB";

/// Magic plus log sequence.
pub const LOG_BLOCK_HEADER_SIZE: usize = 12;

/// Zero length that ends the patch list.
pub(crate) const TERMINATOR_SIZE: usize = 2;

/// Fixed part of a patch record.
pub const PATCH_HEADER_SIZE: usize = 22;

/// An in-place mutation of `data.len()` bytes at `offset` inside a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufPatch {
    pub block_id: u64,
    /// Orders patches of the same block; higher counters apply later.
    pub patch_counter: u64,
    pub offset: u32,
    pub data: Vec<u8>,
}

impl BufPatch {
    pub fn new(block_id: u64, patch_counter: u64, offset: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            block_id,
            patch_counter,
            offset,
            data: data.into(),
        }
    }

    /// Size of the encoded record.
    pub fn serialized_size(&self) -> usize {
        PATCH_HEADER_SIZE + self.data.len()
    }

    /// Writes the patch into `buf`, which holds the target block.
    pub fn apply_to(&self, buf: &mut [u8]) -> Result<(), DiffError> {
        let start = self.offset as usize;
        let end = start + self.data.len();
        if end > buf.len() {
            return Err(DiffError::PatchOutOfBounds {
                block_id: self.block_id,
                end,
                block_size: buf.len(),
            });
        }
        buf[start..end].copy_from_slice(&self.data);
        Ok(())
    }
}

impl Encode for BufPatch {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let len = u16::try_from(self.serialized_size()).map_err(|_| {
            EncodingError::LengthOverflow(format!(
                "patch of {} bytes exceeds u16::MAX",
                self.serialized_size()
            ))
        })?;
        len.encode_to(buf)?;
        self.block_id.encode_to(buf)?;
        self.patch_counter.encode_to(buf)?;
        self.offset.encode_to(buf)?;
        buf.extend_from_slice(&self.data);
        Ok(())
    }
}

impl Decode for BufPatch {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (len, mut offset) = u16::decode_from(buf)?;
        let len = len as usize;
        if len < PATCH_HEADER_SIZE {
            return Err(EncodingError::LengthOverflow(format!(
                "patch length {len} shorter than its header"
            )));
        }
        if buf.len() < len {
            return Err(EncodingError::UnexpectedEof {
                needed: len,
                available: buf.len(),
            });
        }
        let (block_id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (patch_counter, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (patch_offset, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                block_id,
                patch_counter,
                offset: patch_offset,
                data: buf[offset..len].to_vec(),
            },
            len,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Log block images
// ------------------------------------------------------------------------------------------------

/// In-memory image of one log block.
#[derive(Debug, Clone)]
pub(crate) struct LogBlock {
    pub(crate) image: Vec<u8>,
    pub(crate) sequence: u64,
    /// First free byte (where the terminator sits).
    pub(crate) end: usize,
    pub(crate) patch_count: usize,
    pub(crate) dirty: bool,
}

impl LogBlock {
    /// Empty log block stamped with `sequence`.
    pub(crate) fn empty(block_size: usize, sequence: u64) -> Self {
        let mut image = vec![0u8; block_size];
        image[..4].copy_from_slice(&LOG_BLOCK_MAGIC);
        image[4..LOG_BLOCK_HEADER_SIZE].copy_from_slice(&sequence.to_le_bytes());
        Self {
            image,
            sequence,
            end: LOG_BLOCK_HEADER_SIZE,
            patch_count: 0,
            dirty: true,
        }
    }

    /// Parses a stored image. Returns `None` if it is not a log block.
    pub(crate) fn parse(
        block_id: u64,
        raw: &[u8],
        block_size: usize,
    ) -> Result<Option<(Self, Vec<BufPatch>)>, DiffError> {
        if raw.len() < LOG_BLOCK_HEADER_SIZE + TERMINATOR_SIZE || raw[..4] != LOG_BLOCK_MAGIC {
            return Ok(None);
        }
        let (sequence, _) = u64::decode_from(&raw[4..])?;

        let mut image = vec![0u8; block_size];
        let copy = raw.len().min(block_size);
        image[..copy].copy_from_slice(&raw[..copy]);

        let mut patches = Vec::new();
        let mut at = LOG_BLOCK_HEADER_SIZE;
        loop {
            if at + TERMINATOR_SIZE > block_size {
                return Err(DiffError::CorruptLogBlock {
                    block_id,
                    reason: "patch list runs past the end of the block".into(),
                });
            }
            let (len, _) = u16::decode_from(&image[at..])?;
            if len == 0 {
                break;
            }
            let (patch, n) =
                BufPatch::decode_from(&image[at..]).map_err(|e| DiffError::CorruptLogBlock {
                    block_id,
                    reason: format!("patch at byte {at}: {e}"),
                })?;
            patches.push(patch);
            at += n;
        }

        Ok(Some((
            Self {
                image,
                sequence,
                end: at,
                patch_count: patches.len(),
                dirty: false,
            },
            patches,
        )))
    }

    /// Whether a patch of `size` bytes still fits in front of the terminator.
    pub(crate) fn fits(&self, size: usize) -> bool {
        self.end + size + TERMINATOR_SIZE <= self.image.len()
    }

    /// Appends `patch`; the caller checked [`fits`](Self::fits).
    pub(crate) fn append(&mut self, patch: &BufPatch) -> Result<(), DiffError> {
        let mut bytes = Vec::with_capacity(patch.serialized_size());
        patch.encode_to(&mut bytes)?;
        let end = self.end + bytes.len();
        self.image[self.end..end].copy_from_slice(&bytes);
        self.image[end..end + TERMINATOR_SIZE].fill(0);
        self.end = end;
        self.patch_count += 1;
        self.dirty = true;
        Ok(())
    }

    /// Patches currently stored in the image.
    pub(crate) fn patches(&self) -> Result<Vec<BufPatch>, DiffError> {
        let mut patches = Vec::with_capacity(self.patch_count);
        let mut at = LOG_BLOCK_HEADER_SIZE;
        while at < self.end {
            let (patch, n) = BufPatch::decode_from(&self.image[at..])?;
            patches.push(patch);
            at += n;
        }
        Ok(patches)
    }
}
