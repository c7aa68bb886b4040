//! Out-of-core diff log tests against in-memory collaborators.
//!
//! Coverage:
//! - Stored patches survive writeback and reload, reproducing the patched blocks
//! - Reload drops patches already applied to, or aimed at deleted, blocks
//! - A full active block is replaced by compacting the selected log block
//! - OldestFirst and LeastLive choose different blocks
//! - flush_n_oldest_blocks moves patches forward or flushes targets,
//!   and fails when too few blocks are in use

#[cfg(test)]
mod tests {
    use crate::diff::{
        BufPatch, DiffCoreStorage, DiffError, DiffOocoreStorage, LogBlockDevice,
        LogBlockSelection, PatchOwner,
    };
    use std::collections::HashMap;
    use std::sync::Mutex;

    const FIRST: u64 = 1000;

    #[derive(Default)]
    struct MemDevice {
        blocks: Mutex<HashMap<u64, Vec<u8>>>,
        batches: Mutex<usize>,
    }

    impl LogBlockDevice for MemDevice {
        fn log_block_size(&self) -> usize {
            0
        }

        fn read_log_block(&self, block_id: u64) -> Result<Option<Vec<u8>>, DiffError> {
            Ok(self.blocks.lock().unwrap().get(&block_id).cloned())
        }

        fn write_log_blocks(&self, blocks: Vec<(u64, Vec<u8>)>) -> Result<(), DiffError> {
            *self.batches.lock().unwrap() += 1;
            self.blocks.lock().unwrap().extend(blocks);
            Ok(())
        }
    }

    /// Target blocks with the highest patch counter applied to each.
    #[derive(Default)]
    struct MemOwner {
        blocks: HashMap<u64, (Vec<u8>, u64)>,
        flushed: Vec<u64>,
    }

    impl MemOwner {
        fn with_blocks(ids: &[u64], size: usize) -> Self {
            let mut owner = Self::default();
            for id in ids {
                owner.blocks.insert(*id, (vec![0u8; size], 0));
            }
            owner
        }
    }

    impl PatchOwner for MemOwner {
        fn applied_patch_counter(&self, block_id: u64) -> Option<u64> {
            self.blocks.get(&block_id).map(|(_, counter)| *counter)
        }

        fn flush_block(&mut self, block_id: u64, patches: &[BufPatch]) -> Result<(), DiffError> {
            let (buf, counter) = self.blocks.get_mut(&block_id).ok_or(DiffError::Flush {
                block_id,
                reason: "unknown block".into(),
            })?;
            for patch in patches {
                patch.apply_to(buf)?;
                *counter = patch.patch_counter;
            }
            self.flushed.push(block_id);
            Ok(())
        }
    }

    fn put(log: &mut DiffOocoreStorage, core: &mut DiffCoreStorage, patch: BufPatch) -> bool {
        let stored = log.store_patch(&patch, core);
        if stored {
            core.store_patch(patch);
        }
        stored
    }

    /// Patch of 52 encoded bytes; two fit into a 128-byte log block.
    fn small(block_id: u64, counter: u64) -> BufPatch {
        BufPatch::new(block_id, counter, (counter % 4) as u32 * 8, vec![counter as u8; 30])
    }

    /// # Scenario
    /// Patches for three blocks are stored, written back, and loaded into a
    /// fresh storage instance.
    ///
    /// # Expected behavior
    /// Every patch is recovered, and replaying them onto the base images
    /// gives the same bytes as applying each patch directly.
    #[test]
    fn patches_survive_reload() {
        let device = MemDevice::default();
        let owner = MemOwner::with_blocks(&[1, 2, 3], 64);
        let mut log = DiffOocoreStorage::new(256, LogBlockSelection::OldestFirst);
        log.init(FIRST, 4).unwrap();
        let mut core = DiffCoreStorage::new();

        let mut expected: HashMap<u64, Vec<u8>> =
            [1, 2, 3].iter().map(|id| (*id, vec![0u8; 64])).collect();
        for counter in 1..=9u64 {
            let target = counter % 3 + 1;
            let patch = BufPatch::new(target, counter, (counter * 5) as u32, vec![counter as u8; 7]);
            patch.apply_to(expected.get_mut(&target).unwrap()).unwrap();
            assert!(put(&mut log, &mut core, patch));
        }
        assert!(log.writeback(&device).unwrap() > 0);
        assert_eq!(log.writeback(&device).unwrap(), 0);

        let mut reloaded = DiffOocoreStorage::new(256, LogBlockSelection::OldestFirst);
        reloaded.init(FIRST, 4).unwrap();
        let mut fresh = DiffCoreStorage::new();
        assert_eq!(reloaded.load_patches(&device, &owner, &mut fresh).unwrap(), 9);
        assert_eq!(reloaded.active_block(), log.active_block());

        for id in [1u64, 2, 3] {
            let mut buf = vec![0u8; 64];
            fresh.apply_patches(id, &mut buf).unwrap();
            assert_eq!(buf, expected[&id]);
        }
    }

    #[test]
    fn reload_skips_applied_and_deleted_targets() {
        let device = MemDevice::default();
        let mut log = DiffOocoreStorage::new(256, LogBlockSelection::OldestFirst);
        log.init(FIRST, 2).unwrap();
        let mut core = DiffCoreStorage::new();
        for counter in 1..=3 {
            assert!(put(&mut log, &mut core, BufPatch::new(1, counter, 0, vec![1; 4])));
        }
        assert!(put(&mut log, &mut core, BufPatch::new(2, 1, 0, vec![2; 4])));
        log.writeback(&device).unwrap();

        // Block 1 already contains patches 1 and 2; block 2 was deleted.
        let mut owner = MemOwner::with_blocks(&[1], 16);
        owner.blocks.get_mut(&1).unwrap().1 = 2;

        let mut reloaded = DiffOocoreStorage::new(256, LogBlockSelection::OldestFirst);
        reloaded.init(FIRST, 2).unwrap();
        let mut fresh = DiffCoreStorage::new();
        assert_eq!(reloaded.load_patches(&device, &owner, &mut fresh).unwrap(), 1);
        assert_eq!(fresh.patches_for(1)[0].patch_counter, 3);
        assert!(!fresh.has_patches(2));
    }

    /// # Scenario
    /// Both log blocks fill up while every patch is still unresolved, then
    /// one target is flushed.
    ///
    /// # Actions
    /// 1. Store four patches (two per block).
    /// 2. Store a fifth.
    /// 3. Drop the patches of block 1 from the in-core index, store again.
    ///
    /// # Expected behavior
    /// Step 2 fails without I/O; step 3 compacts the oldest block, which
    /// now only holds one live patch, and succeeds.
    #[test]
    fn full_log_compacts_oldest_block() {
        let mut log = DiffOocoreStorage::new(128, LogBlockSelection::OldestFirst);
        log.init(FIRST, 2).unwrap();
        let mut core = DiffCoreStorage::new();

        assert!(put(&mut log, &mut core, small(1, 1)));
        assert!(put(&mut log, &mut core, small(2, 1)));
        assert_eq!(log.active_block(), FIRST);
        assert!(put(&mut log, &mut core, small(3, 1)));
        assert_eq!(log.active_block(), FIRST + 1);
        assert!(put(&mut log, &mut core, small(3, 2)));

        assert!(!put(&mut log, &mut core, small(4, 1)));

        core.drop_patches(1);
        assert!(put(&mut log, &mut core, small(4, 1)));
        assert_eq!(log.active_block(), FIRST);
        assert_eq!(log.in_use_blocks(), 2);
    }

    #[test]
    fn selection_policies_differ() {
        let run = |selection| {
            let mut log = DiffOocoreStorage::new(128, selection);
            log.init(FIRST, 3).unwrap();
            let mut core = DiffCoreStorage::new();
            for (target, counter) in [(1, 1), (1, 2), (2, 1), (2, 2), (3, 1), (3, 2)] {
                assert!(put(&mut log, &mut core, small(target, counter)));
            }
            assert_eq!(log.active_block(), FIRST + 2);
            // Block 2 was flushed, so the middle log block holds only dead patches.
            core.drop_patches(2);
            let stored = put(&mut log, &mut core, small(4, 1));
            (stored, log.active_block())
        };

        assert_eq!(run(LogBlockSelection::OldestFirst), (false, FIRST + 2));
        assert_eq!(run(LogBlockSelection::LeastLive), (true, FIRST + 1));
    }

    #[test]
    fn flush_requires_enough_blocks() {
        let mut log = DiffOocoreStorage::new(256, LogBlockSelection::OldestFirst);
        log.init(FIRST, 3).unwrap();
        let mut core = DiffCoreStorage::new();
        let mut owner = MemOwner::with_blocks(&[1], 64);
        assert!(put(&mut log, &mut core, small(1, 1)));

        assert!(matches!(
            log.flush_n_oldest_blocks(2, &mut owner, &mut core),
            Err(DiffError::NotEnoughLogBlocks {
                requested: 2,
                in_use: 1
            })
        ));
    }

    /// # Scenario
    /// The oldest log block holds unresolved patches and the active block
    /// has room for them.
    ///
    /// # Expected behavior
    /// The patches move into the active block, no target is flushed, and
    /// exactly one log block leaves use.
    #[test]
    fn flush_moves_patches_forward() {
        let mut log = DiffOocoreStorage::new(128, LogBlockSelection::OldestFirst);
        log.init(FIRST, 3).unwrap();
        let mut core = DiffCoreStorage::new();
        let mut owner = MemOwner::with_blocks(&[1, 2], 64);

        assert!(put(&mut log, &mut core, small(1, 1)));
        assert!(put(&mut log, &mut core, small(2, 1)));
        assert!(put(&mut log, &mut core, small(2, 2)));
        assert_eq!(log.active_block(), FIRST + 1);
        // Patch 2/1 was superseded by a flush elsewhere.
        core.drop_patches(2);
        core.store_patch(small(2, 2));

        log.flush_n_oldest_blocks(1, &mut owner, &mut core).unwrap();
        assert_eq!(log.in_use_blocks(), 1);
        assert!(owner.flushed.is_empty());
        assert!(core.has_patches(1));
        assert_eq!(log.active_free_space(), 128 - 12 - 2 - 2 * 52);
    }

    #[test]
    fn flushing_active_block_flushes_targets() {
        let mut log = DiffOocoreStorage::new(256, LogBlockSelection::OldestFirst);
        log.init(FIRST, 2).unwrap();
        let mut core = DiffCoreStorage::new();
        let mut owner = MemOwner::with_blocks(&[1, 2], 64);

        let patches = [
            BufPatch::new(1, 1, 0, b"one".to_vec()),
            BufPatch::new(2, 1, 4, b"two".to_vec()),
            BufPatch::new(1, 2, 1, b"NE!".to_vec()),
        ];
        for patch in &patches {
            assert!(put(&mut log, &mut core, patch.clone()));
        }

        log.flush_n_oldest_blocks(1, &mut owner, &mut core).unwrap();
        assert_eq!(log.in_use_blocks(), 0);
        assert_eq!(core.patch_count(), 0);
        assert_eq!(owner.flushed, vec![1, 2]);
        assert_eq!(&owner.blocks[&1].0[..4], b"oNE!");
        assert_eq!(owner.blocks[&1].1, 2);
        assert_eq!(&owner.blocks[&2].0[4..7], b"two");
    }

    #[test]
    fn uninitialized_storage_rejects_work() {
        let mut log = DiffOocoreStorage::new(256, LogBlockSelection::OldestFirst);
        let core = DiffCoreStorage::new();
        assert!(!log.store_patch(&small(1, 1), &core));
        assert!(matches!(
            log.writeback(&MemDevice::default()),
            Err(DiffError::NotInitialized)
        ));
        assert!(matches!(log.init(FIRST, 0), Err(DiffError::InvalidRange(_))));
    }
}
