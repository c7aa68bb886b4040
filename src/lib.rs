//! # logser
//!
//! A log-structured block store. Blocks are addressed by a 32-bit logical
//! id and written out of place: every write lands in a fresh slot of a data
//! extent, and an append-only LBA log maps ids to their current slot. A
//! ring of CRC-sealed metablocks records the committed state, so reopening
//! after a crash recovers exactly the transactions whose metablock reached
//! disk.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use logser::{BatchOp, DynamicConfig, IoAccount, LogSerializer, StaticConfig};
//!
//! let store = LogSerializer::create_new(
//!     "/tmp/blocks.db",
//!     &StaticConfig::default(),
//!     DynamicConfig::default(),
//! )
//! .unwrap();
//!
//! // Write and commit two blocks in one transaction.
//! let batch = store
//!     .write_batch(
//!         vec![
//!             BatchOp::Write { block_id: 0, data: b"hello".to_vec() },
//!             BatchOp::Write { block_id: 1, data: b"world".to_vec() },
//!         ],
//!         1,
//!         &IoAccount::default(),
//!     )
//!     .unwrap();
//! batch.wait().unwrap();
//!
//! // Read back through the index.
//! let token = store.index_read(0).unwrap().unwrap();
//! assert_eq!(store.block_read(&token, &IoAccount::default()).unwrap(), b"hello");
//!
//! drop(token);
//! drop(batch);
//! store.shutdown().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Ordered commits**: metablocks reach disk in submission order even when
//!   payload writes complete out of order.
//! - **Garbage collection**: live blocks of mostly-dead extents are relocated
//!   and the extents reused; outstanding block tokens follow the move.
//! - **Crash recovery**: the newest valid metablock wins; torn writes are
//!   detected by CRC32.
//! - **Diff log**: small in-place patches are stored in a log of reserved
//!   blocks instead of rewriting whole blocks ([`diff`]).

#![allow(dead_code)]

pub mod data_block;
pub mod diff;
pub mod encoding;
pub mod extent;
pub mod file;
pub mod io;
pub mod lba;
pub mod metablock;
pub mod serializer;
pub mod token;

pub use data_block::{GcConfig, Geometry};
pub use diff::{BufPatch, DiffCoreStorage, DiffError, DiffOocoreStorage, LogBlockSelection};
pub use file::{FilepathFileOpener, SerializerFileOpener};
pub use io::{IoAccount, IoCompletion};
pub use serializer::{
    BatchOp, BufWriteInfo, CommitHandle, GcStats, IndexWriteOp, LogSerializer, PendingBatch,
    ReadAheadCallback, ReadAheadCbId, Recency, SerializerError, SerializerState, SerializerStats,
    ShutdownHandle, ShutdownState, TokenUpdate,
};
pub use token::BlockToken;

use data_block::BLOCK_HEADER_SIZE;
use metablock::METABLOCK_SLOT_SIZE;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Geometry fixed when the file is created and persisted in its static
/// header.
///
/// # Example
///
/// ```rust
/// use logser::StaticConfig;
///
/// let config = StaticConfig {
///     block_size: 512,
///     blocks_per_extent: 16,
/// };
/// assert_eq!(config.geometry().extent_size(), (512 + 24) * 16);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticConfig {
    /// Largest payload a block can carry, in bytes.
    ///
    /// Default: 4 KiB. Must be ≥ 1.
    pub block_size: u32,

    /// Number of block slots in one extent.
    ///
    /// Default: 64. Must be ≥ 1, and the resulting extent must be at least
    /// one metablock slot (512 bytes) large.
    pub blocks_per_extent: u32,
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            blocks_per_extent: 64,
        }
    }
}

impl StaticConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), SerializerError> {
        if self.block_size < 1 {
            return Err(SerializerError::InvalidConfig(
                "block_size must be >= 1".into(),
            ));
        }
        if self.blocks_per_extent < 1 {
            return Err(SerializerError::InvalidConfig(
                "blocks_per_extent must be >= 1".into(),
            ));
        }
        let extent_size = (BLOCK_HEADER_SIZE + self.block_size as u64) * self.blocks_per_extent as u64;
        if extent_size < METABLOCK_SLOT_SIZE {
            return Err(SerializerError::InvalidConfig(format!(
                "extent size {extent_size} must be >= {METABLOCK_SLOT_SIZE}"
            )));
        }
        Ok(())
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            block_size: self.block_size,
            blocks_per_extent: self.blocks_per_extent,
        }
    }
}

/// Settings that may change between runs.
///
/// All fields have sensible defaults via [`DynamicConfig::default()`] and
/// are validated by [`LogSerializer::open`].
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicConfig {
    /// Garbage ratio of the data extents above which garbage collection
    /// starts after a commit.
    ///
    /// Default: 0.65. Must be in (0.0, 1.0].
    pub gc_high_ratio: f64,

    /// Garbage ratio at which a collection pass stops.
    ///
    /// Default: 0.5. Must be in [0.0, `gc_high_ratio`).
    pub gc_low_ratio: f64,

    /// Maximum number of extents relocated per round of a pass.
    ///
    /// Default: 4. Must be ≥ 1.
    pub gc_extents_per_pass: usize,

    /// The LBA log is compacted once its on-disk entries exceed this many
    /// times the live entries (plus one extent of slack).
    ///
    /// Default: 2.0. Must be ≥ 1.0.
    pub lba_compaction_ratio: f64,

    /// Upper bound on the file size in bytes; growing past it fails with
    /// [`SerializerError::OutOfSpace`].
    ///
    /// Default: 16 GiB.
    pub max_file_size: u64,

    /// Number of I/O worker threads.
    ///
    /// Default: 4. Must be ≥ 1.
    pub io_threads: usize,

    /// Offer the other blocks of an extent to read-ahead callbacks when a
    /// block is read.
    ///
    /// Default: true.
    pub read_ahead: bool,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            gc_high_ratio: 0.65,
            gc_low_ratio: 0.5,
            gc_extents_per_pass: 4,
            lba_compaction_ratio: 2.0,
            max_file_size: 16 << 30,
            io_threads: 4,
            read_ahead: true,
        }
    }
}

impl DynamicConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), SerializerError> {
        if self.gc_high_ratio <= 0.0 || self.gc_high_ratio > 1.0 {
            return Err(SerializerError::InvalidConfig(
                "gc_high_ratio must be in (0.0, 1.0]".into(),
            ));
        }
        if self.gc_low_ratio < 0.0 || self.gc_low_ratio >= self.gc_high_ratio {
            return Err(SerializerError::InvalidConfig(
                "gc_low_ratio must be in [0.0, gc_high_ratio)".into(),
            ));
        }
        if self.gc_extents_per_pass < 1 {
            return Err(SerializerError::InvalidConfig(
                "gc_extents_per_pass must be >= 1".into(),
            ));
        }
        if self.lba_compaction_ratio < 1.0 {
            return Err(SerializerError::InvalidConfig(
                "lba_compaction_ratio must be >= 1.0".into(),
            ));
        }
        if self.io_threads < 1 {
            return Err(SerializerError::InvalidConfig(
                "io_threads must be >= 1".into(),
            ));
        }
        Ok(())
    }

    pub fn gc_config(&self) -> GcConfig {
        GcConfig {
            high_ratio: self.gc_high_ratio,
            low_ratio: self.gc_low_ratio,
            extents_per_pass: self.gc_extents_per_pass,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
