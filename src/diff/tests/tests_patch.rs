//! Patch record and log block image tests.
//!
//! Coverage:
//! - Patches apply in place and reject out-of-range writes
//! - A log block image parses back into its patches
//! - Foreign blocks are not mistaken for log blocks
//! - A patch list running off the block is reported as corrupt

#[cfg(test)]
mod tests {
    use crate::diff::DiffError;
    use crate::diff::patch::{BufPatch, LOG_BLOCK_HEADER_SIZE, LogBlock, PATCH_HEADER_SIZE};

    const BLOCK: usize = 128;

    #[test]
    fn patch_applies_in_place() {
        let mut buf = vec![0u8; 16];
        BufPatch::new(1, 1, 4, b"abcd".to_vec()).apply_to(&mut buf).unwrap();
        assert_eq!(&buf[4..8], b"abcd");
        assert_eq!(buf[3], 0);
        assert_eq!(buf[8], 0);

        let err = BufPatch::new(1, 2, 14, b"xyz".to_vec()).apply_to(&mut buf);
        assert!(matches!(
            err,
            Err(DiffError::PatchOutOfBounds {
                block_id: 1,
                end: 17,
                block_size: 16
            })
        ));
    }

    #[test]
    fn log_block_image_parses_back() {
        let a = BufPatch::new(10, 1, 0, b"first".to_vec());
        let b = BufPatch::new(11, 7, 30, b"second!".to_vec());
        let mut block = LogBlock::empty(BLOCK, 5);
        assert!(block.fits(a.serialized_size()));
        block.append(&a).unwrap();
        block.append(&b).unwrap();
        assert_eq!(
            block.end,
            LOG_BLOCK_HEADER_SIZE + 2 * PATCH_HEADER_SIZE + 5 + 7
        );

        let (parsed, patches) = LogBlock::parse(99, &block.image, BLOCK).unwrap().unwrap();
        assert_eq!(parsed.sequence, 5);
        assert_eq!(parsed.patch_count, 2);
        assert_eq!(parsed.end, block.end);
        assert_eq!(patches, vec![a, b]);
        assert_eq!(parsed.patches().unwrap(), patches);
    }

    #[test]
    fn foreign_block_is_not_a_log_block() {
        let raw = vec![0x5Au8; BLOCK];
        assert!(LogBlock::parse(1, &raw, BLOCK).unwrap().is_none());
    }

    #[test]
    fn full_block_rejects_patch() {
        let mut block = LogBlock::empty(BLOCK, 1);
        let big = BufPatch::new(1, 1, 0, vec![7u8; 60]);
        block.append(&big).unwrap();
        assert!(!block.fits(big.serialized_size()));
    }

    /// # Scenario
    /// A patch length field is overwritten so the list no longer ends
    /// inside the block.
    ///
    /// # Expected behavior
    /// Parsing fails with `CorruptLogBlock` instead of reading past the end.
    #[test]
    fn runaway_patch_list_is_corrupt() {
        let mut block = LogBlock::empty(BLOCK, 1);
        block.append(&BufPatch::new(1, 1, 0, vec![1u8; 8])).unwrap();
        let mut raw = block.image.clone();
        raw[LOG_BLOCK_HEADER_SIZE..LOG_BLOCK_HEADER_SIZE + 2]
            .copy_from_slice(&(BLOCK as u16).to_le_bytes());

        assert!(matches!(
            LogBlock::parse(3, &raw, BLOCK),
            Err(DiffError::CorruptLogBlock { block_id: 3, .. })
        ));
    }
}
