//! Garbage collection of data extents.
//!
//! Runs on the commit thread, so the committed index cannot change while a
//! pass is relocating blocks. Slot reads and rewrites happen without the
//! state lock; only slot allocation and the final commit take it.

use super::txn::commit_entries;
use super::{SerializerError, Shared};
use crate::data_block::{self, BlockHeader, DataBlockError};
use crate::lba::LbaEntry;
use crate::token::OffsetPin;
use std::{collections::HashSet, sync::atomic::Ordering};
use tracing::{debug, info, warn};

/// Outcome of one garbage collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GcStats {
    pub extents_examined: usize,
    pub blocks_relocated: usize,
    pub garbage_ratio_before: f64,
    pub garbage_ratio_after: f64,
}

struct Relocation {
    entry: LbaEntry,
    from: u64,
    image: Vec<u8>,
}

/// Relocates the live blocks of the least utilised extents until the
/// garbage ratio drops below the low watermark. `force` runs at least one
/// round even when the ratio is already low.
pub(crate) fn run_gc_pass(shared: &Shared, force: bool) -> Result<GcStats, SerializerError> {
    if shared.failed.load(Ordering::Acquire) {
        return Err(SerializerError::Failed);
    }

    let mut stats = GcStats::default();
    {
        let mut inner = shared.lock()?;
        stats.garbage_ratio_before = inner.data.garbage_ratio();
        inner.data.set_gc_running(true);
    }

    let result = relocate_rounds(shared, force, &mut stats);

    let mut inner = shared.lock()?;
    inner.data.set_gc_running(false);
    stats.garbage_ratio_after = inner.data.garbage_ratio();
    drop(inner);

    result?;
    shared.counters.record_gc_pass(stats.blocks_relocated);
    if stats.blocks_relocated > 0 {
        info!(
            extents = stats.extents_examined,
            blocks = stats.blocks_relocated,
            before = stats.garbage_ratio_before,
            after = stats.garbage_ratio_after,
            "garbage collection pass finished"
        );
    }
    Ok(stats)
}

fn relocate_rounds(
    shared: &Shared,
    force: bool,
    stats: &mut GcStats,
) -> Result<(), SerializerError> {
    let mut tried = HashSet::new();
    let mut first = true;
    loop {
        let candidates = {
            let inner = shared.lock()?;
            if !inner.data.gc_should_continue() && !(force && first) {
                break;
            }
            inner.data.gc_candidates(&tried)
        };
        first = false;
        if candidates.is_empty() {
            break;
        }
        for extent in candidates {
            tried.insert(extent);
            stats.extents_examined += 1;
            stats.blocks_relocated += relocate_extent(shared, extent)?;
        }
    }
    Ok(())
}

/// Moves every index-live block out of `extent` and commits the new
/// locations. Returns the number of blocks moved.
fn relocate_extent(shared: &Shared, extent: u64) -> Result<usize, SerializerError> {
    let slot_size = shared.geometry.slot_size() as usize;

    let pins: Vec<OffsetPin> = {
        let mut inner = shared.lock()?;
        let offsets = inner.data.live_offsets(extent);
        offsets
            .into_iter()
            .map(|offset| inner.registry.pin(offset))
            .collect()
    };
    if pins.is_empty() {
        return Ok(0);
    }

    let mut blocks = Vec::with_capacity(pins.len());
    for pin in &pins {
        let raw = shared.file.read_at(pin.offset(), slot_size)?;
        match data_block::decode_block(pin.offset(), &raw) {
            Ok((header, payload)) => blocks.push((pin.offset(), header, payload)),
            Err(DataBlockError::Corrupt { offset, reason }) => {
                warn!(offset, %reason, "unreadable slot left in place");
            }
            Err(e) => return Err(e.into()),
        }
    }
    drop(pins);

    let mut relocations = Vec::with_capacity(blocks.len());
    {
        let mut guard = shared.lock()?;
        let inner = &mut *guard;
        for (from, header, payload) in blocks {
            let Some(location) = inner.lba.lookup(header.block_id) else {
                warn!(offset = from, block_id = header.block_id, "live slot has no index entry");
                continue;
            };
            if location.offset != from {
                warn!(
                    offset = from,
                    block_id = header.block_id,
                    indexed = location.offset,
                    "live slot does not match index, skipping"
                );
                continue;
            }
            let to = inner
                .data
                .allocate_slot(&mut inner.extents, &shared.file)?;
            let moved = BlockHeader {
                block_id: header.block_id,
                block_sequence_id: inner.next_sequence(),
                payload_len: header.payload_len,
            };
            relocations.push(Relocation {
                entry: LbaEntry {
                    block_id: header.block_id,
                    offset: Some(to),
                    recency: location.recency,
                    size: location.size,
                },
                from,
                image: data_block::encode_block(&moved, &payload)?,
            });
        }
    }

    for relocation in &relocations {
        if let Some(to) = relocation.entry.offset {
            shared.file.write_at(to, &relocation.image)?;
        }
    }

    if relocations.is_empty() {
        return Ok(0);
    }
    let entries: Vec<LbaEntry> = relocations.iter().map(|r| r.entry).collect();
    let remaps: Vec<(u64, u64)> = relocations
        .iter()
        .filter_map(|r| r.entry.offset.map(|to| (r.from, to)))
        .collect();

    let mut guard = shared.lock()?;
    let seq = commit_entries(shared, &mut guard, &entries, &remaps)?;
    debug!(extent, blocks = entries.len(), seq, "data extent relocated");
    Ok(entries.len())
}
