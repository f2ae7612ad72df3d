//! Interleave ways and granularity encodings shared by every decoder level.

/// Maximum interleave ways a region or decoder can express.
pub const MAX_INTERLEAVE: usize = 16;
/// Smallest interleave granularity in bytes.
pub const MIN_GRANULARITY: u32 = 256;
/// Largest interleave granularity in bytes.
pub const MAX_GRANULARITY: u32 = 16 * 1024;
/// Address-space alignment unit for one interleave way.
pub const REGION_ALIGN: u64 = 256 * 1024 * 1024;
/// Every interleave ways value the decoders can express, ascending.
pub const VALID_WAYS: [u32; 8] = [1, 2, 3, 4, 6, 8, 12, 16];

const MAX_GRANULARITY_ENCODING: u8 = 6;

/// Decodes a hardware ways field into a ways count.
///
/// Encodings `0..=4` are powers of two, `8..=10` are the `3 * 2^n` family.
#[must_use]
pub const fn ways_from_encoding(eniw: u8) -> Option<u32> {
    match eniw {
        0..=4 => Some(1 << eniw),
        8..=10 => Some(3 << (eniw - 8)),
        _ => None,
    }
}

/// Encodes a ways count into the hardware ways field.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn encoding_from_ways(ways: u32) -> Option<u8> {
    if !is_valid_ways(ways) {
        return None;
    }
    if ways.is_power_of_two() {
        Some(ways.trailing_zeros() as u8)
    } else {
        Some((ways / 3).trailing_zeros() as u8 + 8)
    }
}

/// Decodes a hardware granularity field into bytes.
#[must_use]
pub const fn granularity_from_encoding(ig: u8) -> Option<u32> {
    if ig > MAX_GRANULARITY_ENCODING {
        return None;
    }
    Some(MIN_GRANULARITY << ig)
}

/// Encodes a byte granularity into the hardware granularity field.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn encoding_from_granularity(granularity: u32) -> Option<u8> {
    if !is_valid_granularity(granularity) {
        return None;
    }
    Some(granularity.trailing_zeros() as u8 - 8)
}

/// Returns `true` for ways values in [`VALID_WAYS`].
#[must_use]
pub const fn is_valid_ways(ways: u32) -> bool {
    matches!(ways, 1 | 2 | 3 | 4 | 6 | 8 | 12 | 16)
}

/// Returns `true` for power-of-two granularities in `256..=16384`.
#[must_use]
pub const fn is_valid_granularity(granularity: u32) -> bool {
    granularity.is_power_of_two()
        && granularity >= MIN_GRANULARITY
        && granularity <= MAX_GRANULARITY
}

/// Size alignment a region with `ways` interleave ways must respect.
#[must_use]
pub const fn region_alignment(ways: u32) -> u64 {
    REGION_ALIGN * ways as u64
}

/// Largest power of two not above `n`, or zero for `n == 0`.
#[must_use]
pub const fn floor_pow2(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - n.leading_zeros())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        encoding_from_granularity, encoding_from_ways, floor_pow2, granularity_from_encoding,
        is_valid_granularity, region_alignment, ways_from_encoding, REGION_ALIGN, VALID_WAYS,
    };

    #[test]
    fn ways_encoding_table_matches_hardware_layout() {
        let table = [
            (0, 1),
            (1, 2),
            (2, 4),
            (3, 8),
            (4, 16),
            (8, 3),
            (9, 6),
            (10, 12),
        ];
        for (eniw, ways) in table {
            assert_eq!(ways_from_encoding(eniw), Some(ways));
            assert_eq!(encoding_from_ways(ways), Some(eniw));
        }
    }

    #[test]
    fn reserved_ways_encodings_are_rejected() {
        for eniw in [5_u8, 6, 7, 11, 12, 15] {
            assert_eq!(ways_from_encoding(eniw), None, "eniw {eniw}");
        }
        for ways in [0_u32, 5, 7, 9, 10, 24, 32] {
            assert_eq!(encoding_from_ways(ways), None, "ways {ways}");
        }
    }

    #[test]
    fn granularity_encoding_covers_256_to_16k() {
        assert_eq!(granularity_from_encoding(0), Some(256));
        assert_eq!(granularity_from_encoding(6), Some(16 * 1024));
        assert_eq!(granularity_from_encoding(7), None);
        assert_eq!(encoding_from_granularity(4096), Some(4));
        assert_eq!(encoding_from_granularity(128), None);
        assert_eq!(encoding_from_granularity(768), None);
        assert!(!is_valid_granularity(32 * 1024));
    }

    #[test]
    fn valid_ways_table_is_exactly_the_encodable_set() {
        let encodable: Vec<u32> = (0..=u8::MAX).filter_map(ways_from_encoding).collect();
        let mut sorted = encodable;
        sorted.sort_unstable();
        assert_eq!(sorted, VALID_WAYS);
    }

    #[test]
    fn alignment_and_floor_pow2_helpers() {
        assert_eq!(region_alignment(3), 3 * REGION_ALIGN);
        assert_eq!(floor_pow2(0), 0);
        assert_eq!(floor_pow2(1), 1);
        assert_eq!(floor_pow2(3), 2);
        assert_eq!(floor_pow2(12), 8);
    }
}
