//! Metablock ring tests.
//!
//! Coverage:
//! - Recovery picks the highest block sequence id, across ring wrap-around
//! - A torn (corrupt) newest slot falls back to the previous metablock
//! - An empty ring yields `NoValidMetablock`
//! - Writes continue in the slot after the recovered one

#[cfg(test)]
mod tests {
    use crate::data_block::DataBlockMixin;
    use crate::extent::ExtentMixin;
    use crate::file::{DbFile, FilepathFileOpener, SerializerFileOpener};
    use crate::lba::LbaMixin;
    use crate::metablock::{
        METABLOCK_RING_SIZE, METABLOCK_SLOT_SIZE, Metablock, MetablockError, MetablockManager,
        STATIC_HEADER_SIZE, STATIC_REGION_SIZE, StaticHeader,
    };
    use tempfile::TempDir;

    const HEADER: StaticHeader = StaticHeader {
        block_size: 1024,
        blocks_per_extent: 16,
    };

    fn metablock(seq: u64) -> Metablock {
        Metablock {
            block_sequence_id: seq,
            extent: ExtentMixin {
                extent_count: 1 + seq,
            },
            lba: LbaMixin {
                max_block_id: seq * 10,
                ..LbaMixin::empty()
            },
            data: DataBlockMixin::empty(),
        }
    }

    fn fresh_file(tmp: &TempDir) -> DbFile {
        let mut opener = FilepathFileOpener::new(tmp.path().join("ring.db"));
        let file = opener.open_serializer_file_create_temporary().unwrap();
        file.set_len(STATIC_REGION_SIZE).unwrap();
        file
    }

    fn image(file: &DbFile) -> Vec<u8> {
        file.map_readonly().unwrap().to_vec()
    }

    #[test]
    fn latest_metablock_wins_after_wrap_around() {
        let tmp = TempDir::new().unwrap();
        let file = fresh_file(&tmp);
        let mut mgr = MetablockManager::create(&file, &HEADER, &metablock(1)).unwrap();
        let total = METABLOCK_RING_SIZE as u64 + 3;
        for seq in 2..=total {
            mgr.write(&file, &metablock(seq)).unwrap();
        }

        let (recovered, mb) = MetablockManager::read_latest(&image(&file)).unwrap();
        assert_eq!(mb, metablock(total));
        assert_eq!(recovered.last_written(), Some(&metablock(total)));
        assert_eq!(recovered.next_slot(), mgr.next_slot());
    }

    /// # Scenario
    /// The newest metablock write is torn: its slot holds garbage.
    ///
    /// # Actions
    /// 1. Write metablocks 1, 2, 3.
    /// 2. Scribble over the slot holding 3.
    /// 3. Recover.
    ///
    /// # Expected behavior
    /// Metablock 2 is returned; the next write reuses the damaged slot.
    #[test]
    fn torn_newest_slot_falls_back() {
        let tmp = TempDir::new().unwrap();
        let file = fresh_file(&tmp);
        let mut mgr = MetablockManager::create(&file, &HEADER, &metablock(1)).unwrap();
        mgr.write(&file, &metablock(2)).unwrap();
        mgr.write(&file, &metablock(3)).unwrap();

        let torn_slot = STATIC_HEADER_SIZE + 2 * METABLOCK_SLOT_SIZE;
        file.write_at(torn_slot + 20, &[0xAB; 40]).unwrap();

        let (recovered, mb) = MetablockManager::read_latest(&image(&file)).unwrap();
        assert_eq!(mb.block_sequence_id, 2);
        assert_eq!(recovered.next_slot(), 2);
    }

    #[test]
    fn empty_ring_has_no_metablock() {
        let tmp = TempDir::new().unwrap();
        let file = fresh_file(&tmp);
        assert!(matches!(
            MetablockManager::read_latest(&image(&file)),
            Err(MetablockError::NoValidMetablock)
        ));
    }

    #[test]
    fn writes_resume_after_recovered_slot() {
        let tmp = TempDir::new().unwrap();
        let file = fresh_file(&tmp);
        let mut mgr = MetablockManager::create(&file, &HEADER, &metablock(1)).unwrap();
        mgr.write(&file, &metablock(2)).unwrap();

        let (mut recovered, _) = MetablockManager::read_latest(&image(&file)).unwrap();
        assert_eq!(recovered.next_slot(), 2);
        recovered.write(&file, &metablock(3)).unwrap();

        let (_, mb) = MetablockManager::read_latest(&image(&file)).unwrap();
        assert_eq!(mb.block_sequence_id, 3);
    }
}
