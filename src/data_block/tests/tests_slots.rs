//! Slot format and placement tests.
//!
//! Coverage:
//! - Slot images decode back to header and payload
//! - Payload and header corruption is detected by the CRC
//! - Oversized payloads are rejected
//! - Slots are handed out sequentially, a new extent when one fills up

#[cfg(test)]
mod tests {
    use crate::data_block::{
        BLOCK_HEADER_SIZE, BlockHeader, DataBlockError, DataBlockManager, GcConfig, Geometry,
        decode_block, encode_block, read_block,
    };
    use crate::extent::ExtentManager;
    use crate::file::{FilepathFileOpener, SerializerFileOpener};
    use tempfile::TempDir;

    const GEOMETRY: Geometry = Geometry {
        block_size: 64,
        blocks_per_extent: 4,
    };

    const GC: GcConfig = GcConfig {
        high_ratio: 0.65,
        low_ratio: 0.5,
        extents_per_pass: 2,
    };

    #[test]
    fn geometry_sizes() {
        assert_eq!(GEOMETRY.slot_size(), BLOCK_HEADER_SIZE + 64);
        assert_eq!(GEOMETRY.extent_size(), 4 * (BLOCK_HEADER_SIZE + 64));
    }

    #[test]
    fn slot_image_decodes() {
        let header = BlockHeader {
            block_id: 42,
            block_sequence_id: 7,
            payload_len: 5,
        };
        let image = encode_block(&header, b"hello").unwrap();
        assert_eq!(image.len(), BLOCK_HEADER_SIZE as usize + 5);

        let (decoded, payload) = decode_block(0, &image).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn corruption_is_detected() {
        let header = BlockHeader {
            block_id: 1,
            block_sequence_id: 1,
            payload_len: 4,
        };
        let image = encode_block(&header, b"data").unwrap();

        let mut payload_flip = image.clone();
        payload_flip[BLOCK_HEADER_SIZE as usize + 1] ^= 0x01;
        assert!(matches!(
            decode_block(88, &payload_flip),
            Err(DataBlockError::Corrupt { offset: 88, .. })
        ));

        let mut id_flip = image.clone();
        id_flip[0] ^= 0x80;
        assert!(matches!(
            decode_block(88, &id_flip),
            Err(DataBlockError::Corrupt { .. })
        ));

        let mut truncated = image;
        truncated.truncate(BLOCK_HEADER_SIZE as usize + 2);
        assert!(matches!(
            decode_block(88, &truncated),
            Err(DataBlockError::Corrupt { .. })
        ));
    }

    #[test]
    fn read_block_checks_expected_length() {
        let tmp = TempDir::new().unwrap();
        let mut opener = FilepathFileOpener::new(tmp.path().join("slots.db"));
        let file = opener.open_serializer_file_create_temporary().unwrap();
        let header = BlockHeader {
            block_id: 3,
            block_sequence_id: 9,
            payload_len: 6,
        };
        file.write_at(1000, &encode_block(&header, b"abcdef").unwrap())
            .unwrap();

        let (read, payload) = read_block(&file, 1000, 6).unwrap();
        assert_eq!(read.block_id, 3);
        assert_eq!(payload, b"abcdef");
        assert!(read_block(&file, 1000, 4).is_err());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mgr = DataBlockManager::new(GEOMETRY, GC);
        assert_eq!(mgr.check_payload(64).unwrap(), 64);
        assert!(matches!(
            mgr.check_payload(65),
            Err(DataBlockError::PayloadTooLarge {
                len: 65,
                block_size: 64
            })
        ));
    }

    /// # Scenario
    /// More slots are requested than one extent holds.
    ///
    /// # Expected behavior
    /// The first four slots are consecutive in one extent; the fifth opens a
    /// new active extent and the mixin follows.
    #[test]
    fn slots_fill_extents_sequentially() {
        let tmp = TempDir::new().unwrap();
        let mut opener = FilepathFileOpener::new(tmp.path().join("fill.db"));
        let file = opener.open_serializer_file_create_temporary().unwrap();
        let extent_size = GEOMETRY.extent_size();
        file.set_len(extent_size).unwrap();
        let mut em = ExtentManager::new(extent_size, 1, 16 * extent_size);
        let mut mgr = DataBlockManager::new(GEOMETRY, GC);

        let offsets: Vec<u64> = (0..5)
            .map(|_| mgr.allocate_slot(&mut em, &file).unwrap())
            .collect();
        let first = offsets[0];
        assert_eq!(first, extent_size);
        for (i, offset) in offsets[..4].iter().enumerate() {
            assert_eq!(*offset, first + i as u64 * GEOMETRY.slot_size());
        }
        assert_eq!(offsets[4], 2 * extent_size);
        assert_eq!(mgr.extent_count(), 2);
        assert_eq!(mgr.active_extent(), Some(2 * extent_size));
        assert_eq!(mgr.mixin().next_slot, 1);
        assert_eq!(mgr.slot_offsets(first).collect::<Vec<_>>(), offsets[..4].to_vec());
    }
}
