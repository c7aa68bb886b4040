//! In-core index of unresolved patches, keyed by target block.

use super::DiffError;
use super::patch::BufPatch;
use std::collections::HashMap;

/// Patches that have not yet been written into their target block.
///
/// Patches of one block are kept sorted by `patch_counter`.
#[derive(Debug, Default)]
pub struct DiffCoreStorage {
    patches: HashMap<u64, Vec<BufPatch>>,
}

impl DiffCoreStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `patch`. A patch with the same counter replaces the old one.
    pub fn store_patch(&mut self, patch: BufPatch) {
        let list = self.patches.entry(patch.block_id).or_default();
        match list.binary_search_by_key(&patch.patch_counter, |p| p.patch_counter) {
            Ok(at) => list[at] = patch,
            Err(at) => list.insert(at, patch),
        }
    }

    pub fn has_patches(&self, block_id: u64) -> bool {
        self.patches.contains_key(&block_id)
    }

    /// Unresolved patches of `block_id`, oldest first.
    pub fn patches_for(&self, block_id: u64) -> &[BufPatch] {
        self.patches.get(&block_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether this exact patch is still waiting to be written into its block.
    pub fn is_unresolved(&self, patch: &BufPatch) -> bool {
        self.patches_for(patch.block_id)
            .binary_search_by_key(&patch.patch_counter, |p| p.patch_counter)
            .is_ok()
    }

    /// Applies every unresolved patch of `block_id` to `buf` in counter
    /// order. Returns the number applied.
    pub fn apply_patches(&self, block_id: u64, buf: &mut [u8]) -> Result<usize, DiffError> {
        let patches = self.patches_for(block_id);
        for patch in patches {
            patch.apply_to(buf)?;
        }
        Ok(patches.len())
    }

    /// Forgets every patch of a block that was flushed or deleted.
    pub fn drop_patches(&mut self, block_id: u64) -> Vec<BufPatch> {
        self.patches.remove(&block_id).unwrap_or_default()
    }

    /// Forgets patches up to and including `through_counter`, which are now
    /// contained in the block itself. Returns how many were dropped.
    pub fn truncate_applied(&mut self, block_id: u64, through_counter: u64) -> usize {
        let Some(list) = self.patches.get_mut(&block_id) else {
            return 0;
        };
        let keep_from = list.partition_point(|p| p.patch_counter <= through_counter);
        list.drain(..keep_from);
        if list.is_empty() {
            self.patches.remove(&block_id);
        }
        keep_from
    }

    pub fn patch_count(&self) -> usize {
        self.patches.values().map(Vec::len).sum()
    }

    /// Number of blocks with at least one unresolved patch.
    pub fn block_count(&self) -> usize {
        self.patches.len()
    }

    /// Bytes the unresolved patches occupy in the log.
    pub fn serialized_size(&self) -> usize {
        self.patches
            .values()
            .flatten()
            .map(BufPatch::serialized_size)
            .sum()
    }
}
