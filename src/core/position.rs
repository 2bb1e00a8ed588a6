//! Purpose: Pure arithmetic mapping (term id, term offset) to stream positions.
//! Exports: raw-tail packing/unpacking, position compose/decompose, partition indexing.
//! Role: Shared by the appender, publication, reader, and unblocker; no I/O, no state.
//! Invariants: Positions are non-negative and monotone for monotone (term id, offset).
//! Invariants: `term_length` is a power of two; shifts never exceed 30 bits.
pub const PARTITION_COUNT: usize = 3;

/// Number of bits to shift a term count to convert it into a stream position.
pub fn position_bits_to_shift(term_length: i32) -> u32 {
    (term_length as u32).trailing_zeros()
}

pub fn compute_position(
    term_id: i32,
    term_offset: i32,
    bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    compute_term_begin_position(term_id, bits_to_shift, initial_term_id) + term_offset as i64
}

pub fn compute_term_begin_position(term_id: i32, bits_to_shift: u32, initial_term_id: i32) -> i64 {
    let term_count = term_id.wrapping_sub(initial_term_id) as i64;
    term_count << bits_to_shift
}

pub fn compute_term_count(term_id: i32, initial_term_id: i32) -> i32 {
    term_id.wrapping_sub(initial_term_id)
}

pub fn index_by_term_count(term_count: i32) -> usize {
    (term_count as i64).rem_euclid(PARTITION_COUNT as i64) as usize
}

pub fn index_by_position(position: i64, bits_to_shift: u32) -> usize {
    ((position >> bits_to_shift) % PARTITION_COUNT as i64) as usize
}

pub fn term_id(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// Term offset from a raw tail, clamped to the term length once the term is full.
pub fn term_offset(raw_tail: i64, term_length: i64) -> i32 {
    let tail = raw_tail & 0xFFFF_FFFF;
    tail.min(term_length) as i32
}

pub fn pack_tail(term_id: i32, term_offset: i32) -> i64 {
    ((term_id as i64) << 32) | (term_offset as u32 as i64)
}

/// Highest position reachable before the 31-bit term count space is exhausted.
pub fn max_possible_position(term_length: i32) -> i64 {
    (term_length as i64) << 31
}

pub fn align(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Total reserved length for a message split into MTU-sized fragments.
pub fn compute_fragmented_frame_length(
    length: usize,
    max_payload: usize,
    header_length: usize,
    alignment: usize,
) -> usize {
    let full_frames = length / max_payload;
    let remainder = length % max_payload;
    let mut framed = full_frames * align(max_payload + header_length, alignment);
    if remainder > 0 {
        framed += align(remainder + header_length, alignment);
    }
    framed
}

#[cfg(test)]
mod tests {
    use super::*;

    struct XorShift64 {
        state: u64,
    }

    impl XorShift64 {
        fn new(seed: u64) -> Self {
            Self { state: seed }
        }

        fn next_u64(&mut self) -> u64 {
            let mut x = self.state;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.state = x;
            x
        }
    }

    #[test]
    fn bits_to_shift_is_log2_of_term_length() {
        assert_eq!(position_bits_to_shift(65536), 16);
        assert_eq!(position_bits_to_shift(1024 * 1024), 20);
        assert_eq!(position_bits_to_shift(1 << 30), 30);
    }

    #[test]
    fn position_composes_term_id_and_offset() {
        assert_eq!(compute_position(7, 0, 16, 7), 0);
        assert_eq!(compute_position(7, 100, 16, 7), 100);
        assert_eq!(compute_position(8, 64, 16, 7), 65536 + 64);
        assert_eq!(compute_position(10, 0, 16, 7), 3 * 65536);
    }

    #[test]
    fn partition_index_rotates_over_three() {
        assert_eq!(index_by_term_count(0), 0);
        assert_eq!(index_by_term_count(1), 1);
        assert_eq!(index_by_term_count(2), 2);
        assert_eq!(index_by_term_count(3), 0);
        assert_eq!(index_by_term_count(-1), 2);
    }

    #[test]
    fn index_by_position_matches_term_count() {
        let bits = position_bits_to_shift(65536);
        assert_eq!(index_by_position(0, bits), 0);
        assert_eq!(index_by_position(65535, bits), 0);
        assert_eq!(index_by_position(65536, bits), 1);
        assert_eq!(index_by_position(3 * 65536, bits), 0);
    }

    #[test]
    fn raw_tail_round_trips_through_pack() {
        let mut rng = XorShift64::new(42);
        for _ in 0..200 {
            let id = rng.next_u64() as i32;
            let offset = (rng.next_u64() % 65537) as i32;
            let raw = pack_tail(id, offset);
            assert_eq!(term_id(raw), id);
            assert_eq!(term_offset(raw, 65536), offset);
        }
    }

    #[test]
    fn term_offset_is_clamped_when_term_overflows() {
        let raw = pack_tail(3, 70000);
        assert_eq!(term_offset(raw, 65536), 65536);
    }

    #[test]
    fn position_round_trips_through_decomposition() {
        let bits = position_bits_to_shift(65536);
        let initial_term_id = 7;
        let mut rng = XorShift64::new(7);
        for _ in 0..200 {
            let term_count = (rng.next_u64() % 1000) as i32;
            let offset = (rng.next_u64() % 65536) as i32;
            let id = initial_term_id + term_count;
            let position = compute_position(id, offset, bits, initial_term_id);
            assert_eq!((position >> bits) as i32, term_count);
            assert_eq!((position & 65535) as i32, offset);
        }
    }

    #[test]
    fn alignment_is_32_bytes() {
        assert_eq!(align(0, 32), 0);
        assert_eq!(align(1, 32), 32);
        assert_eq!(align(32, 32), 32);
        assert_eq!(align(33, 32), 64);
        assert_eq!(align(100 + 32, 32), 160);
    }

    #[test]
    fn fragmented_length_counts_full_and_partial_frames() {
        // Two full 4064-byte payload frames plus one 72-byte remainder.
        let length = 2 * 4064 + 72;
        let framed = compute_fragmented_frame_length(length, 4064, 32, 32);
        assert_eq!(framed, 2 * 4096 + align(72 + 32, 32));
    }

    #[test]
    fn fragmented_length_exact_multiple_has_no_tail_frame() {
        let framed = compute_fragmented_frame_length(2 * 4064, 4064, 32, 32);
        assert_eq!(framed, 2 * 4096);
    }

    #[test]
    fn max_position_scales_with_term_length() {
        assert_eq!(max_possible_position(65536), 65536i64 << 31);
    }
}
