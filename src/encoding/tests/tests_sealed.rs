//! Tests for fixed-size sealed records (`seal` / `unseal`).

use crate::encoding::*;

#[derive(Debug, PartialEq)]
struct Pair {
    a: u64,
    b: u32,
}

impl Encode for Pair {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.a.encode_to(buf)?;
        self.b.encode_to(buf)
    }
}

impl Decode for Pair {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (a, n1) = u64::decode_from(buf)?;
        let (b, n2) = u32::decode_from(&buf[n1..])?;
        Ok((Self { a, b }, n1 + n2))
    }
}

/// # Scenario
/// A sealed record is padded to its slot size and decodes back.
///
/// # Expected behavior
/// Length equals the slot size, trailing bytes are zero, value matches.
#[test]
fn seal_pads_and_unseals() {
    let record = seal(&Pair { a: 7, b: 9 }, 32).unwrap();
    assert_eq!(record.len(), 32);
    assert!(record[16..].iter().all(|b| *b == 0));
    let back: Pair = unseal(&record).unwrap();
    assert_eq!(back, Pair { a: 7, b: 9 });
}

/// # Scenario
/// A single flipped bit inside the body is detected.
///
/// # Expected behavior
/// `unseal` returns `ChecksumMismatch`.
#[test]
fn flipped_bit_is_detected() {
    let mut record = seal(&Pair { a: 1, b: 2 }, 32).unwrap();
    record[3] ^= 0x10;
    let err = unseal::<Pair>(&record).unwrap_err();
    assert!(matches!(err, EncodingError::ChecksumMismatch { .. }));
}

/// # Scenario
/// An all-zero slot (never written) is not mistaken for a valid record.
///
/// # Expected behavior
/// The zero CRC does not match the CRC of twelve zero bytes.
#[test]
fn zeroed_slot_is_invalid() {
    let record = vec![0u8; 32];
    assert!(unseal::<Pair>(&record).is_err());
}

#[test]
fn record_larger_than_slot_is_rejected() {
    let err = seal(&Pair { a: 1, b: 2 }, 15).unwrap_err();
    assert!(matches!(
        err,
        EncodingError::RecordTooLarge {
            len: 16,
            capacity: 15
        }
    ));
}
