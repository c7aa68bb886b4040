//! Serializer statistics.
//!
//! Running totals are kept in lock-free [`SerializerCounters`] owned by the
//! serializer; [`LogSerializer::stats`](super::LogSerializer::stats) combines
//! them with the space figures read under the state lock into one
//! [`SerializerStats`] snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of serializer statistics returned by
/// [`LogSerializer::stats`](super::LogSerializer::stats).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SerializerStats {
    /// Payload reads completed through `block_read`.
    pub block_reads: u64,
    /// Payload bytes returned by those reads.
    pub bytes_read: u64,
    /// Payload writes that reached the file.
    pub block_writes: u64,
    /// Payload bytes of those writes.
    pub bytes_written: u64,
    /// Blocks offered to read-ahead callbacks.
    pub read_ahead_offers: u64,
    /// Durable metablock writes, one per committed transaction or GC round.
    pub metablock_writes: u64,
    /// Garbage collection passes that ran to completion.
    pub gc_passes: u64,
    /// Blocks moved by garbage collection.
    pub blocks_relocated: u64,
    /// Extents in the file, the reserved static region included.
    pub total_extents: u64,
    /// Extents holding data blocks.
    pub data_extents: u64,
    /// Extents owned by the LBA index (superblock included).
    pub lba_extents: u64,
    /// Blocks with a live index entry.
    pub live_blocks: u64,
    /// Share of data slots that hold garbage.
    pub garbage_ratio: f64,
}

/// Running totals updated on the I/O and commit paths.
#[derive(Debug, Default)]
pub(crate) struct SerializerCounters {
    block_reads: AtomicU64,
    bytes_read: AtomicU64,
    block_writes: AtomicU64,
    bytes_written: AtomicU64,
    read_ahead_offers: AtomicU64,
    metablock_writes: AtomicU64,
    gc_passes: AtomicU64,
    blocks_relocated: AtomicU64,
}

impl SerializerCounters {
    pub(crate) fn record_read(&self, bytes: usize) {
        self.block_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: usize) {
        self.block_writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_read_ahead_offer(&self) {
        self.read_ahead_offers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_metablock_write(&self) {
        self.metablock_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_gc_pass(&self, relocated: usize) {
        self.gc_passes.fetch_add(1, Ordering::Relaxed);
        self.blocks_relocated
            .fetch_add(relocated as u64, Ordering::Relaxed);
    }

    /// Copies the running totals; the space figures are left at zero.
    pub(crate) fn snapshot(&self) -> SerializerStats {
        SerializerStats {
            block_reads: self.block_reads.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            block_writes: self.block_writes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            read_ahead_offers: self.read_ahead_offers.load(Ordering::Relaxed),
            metablock_writes: self.metablock_writes.load(Ordering::Relaxed),
            gc_passes: self.gc_passes.load(Ordering::Relaxed),
            blocks_relocated: self.blocks_relocated.load(Ordering::Relaxed),
            ..SerializerStats::default()
        }
    }
}
