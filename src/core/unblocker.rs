//! Purpose: Rescue a stalled stream by padding over a claimed, never-written hole.
//! Exports: `unblock_at`, `UnblockOutcome`.
//! Role: Conductor-side recovery; runs only after the unblock timeout has armed.
//! Invariants: Only a region whose leading `frame_length` is still zero is padded;
//! a committed frame is never rewritten.
//! Invariants: Padding stops at the first committed frame after the hole, or at
//! the recorded tail when nothing was committed beyond it.
use crate::core::frame::{self, FRAME_ALIGNMENT, HEADER_LENGTH};
use crate::core::layout::{LogMetadata, TermBuffer};
use crate::core::position;

#[derive(Debug, Eq, PartialEq)]
pub enum UnblockOutcome {
    NoAction,
    Unblocked,
    UnblockedToEnd,
}

/// Attempt to pad over the hole at `blocked_position` (the stalled consumer
/// position). Returns what, if anything, was committed.
pub fn unblock_at(
    term: &TermBuffer<'_>,
    meta: &LogMetadata<'_>,
    blocked_position: i64,
    bits_to_shift: u32,
    initial_term_id: i32,
) -> UnblockOutcome {
    let term_length = term.len();
    let blocked_offset = (blocked_position & (term_length as i64 - 1)) as usize;
    let expected_term_count = (blocked_position >> bits_to_shift) as i32;
    let index = position::index_by_term_count(expected_term_count);
    let term_id = initial_term_id.wrapping_add(expected_term_count);

    // If the log has rotated past the blocked term, the whole remainder of
    // that term is claimable; otherwise only up to its recorded tail.
    let tail_offset = if meta.active_term_count() != expected_term_count {
        term_length
    } else {
        let raw_tail = meta.raw_tail_volatile(index);
        position::term_offset(raw_tail, term_length as i64) as usize
    };

    unblock(term, meta, blocked_offset, tail_offset, term_id)
}

fn unblock(
    term: &TermBuffer<'_>,
    meta: &LogMetadata<'_>,
    blocked_offset: usize,
    tail_offset: usize,
    term_id: i32,
) -> UnblockOutcome {
    if tail_offset <= blocked_offset || frame::frame_length_volatile(term, blocked_offset) != 0 {
        return UnblockOutcome::NoAction;
    }

    let limit = tail_offset.min(term.len());
    let mut pad_end = limit;
    let mut scan = blocked_offset + FRAME_ALIGNMENT;
    while scan < limit {
        if frame::frame_length_volatile(term, scan) != 0 {
            if !scan_back_confirms_zeroed(term, scan, blocked_offset) {
                return UnblockOutcome::NoAction;
            }
            pad_end = scan;
            break;
        }
        scan += FRAME_ALIGNMENT;
    }

    if pad_end <= blocked_offset || frame::frame_length_volatile(term, blocked_offset) != 0 {
        return UnblockOutcome::NoAction;
    }

    let template = meta.default_frame_header(HEADER_LENGTH);
    frame::write_pad_frame(term, blocked_offset, pad_end - blocked_offset, template, term_id);

    if pad_end == term.len() {
        UnblockOutcome::UnblockedToEnd
    } else {
        UnblockOutcome::Unblocked
    }
}

/// Re-walk the hole backwards to make sure no writer committed a frame inside
/// it between the forward scan and the pad.
fn scan_back_confirms_zeroed(term: &TermBuffer<'_>, from: usize, to: usize) -> bool {
    let mut offset = from - FRAME_ALIGNMENT;
    loop {
        if frame::frame_length_volatile(term, offset) != 0 {
            return false;
        }
        if offset == to {
            return true;
        }
        offset -= FRAME_ALIGNMENT;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::appender::TermAppender;
    use crate::core::frame::{default_frame_header, frame_length_volatile, is_padding};
    use crate::core::layout::{LogMetadata, TermBuffer, LOG_META_DATA_LENGTH};
    use crate::core::position::{pack_tail, position_bits_to_shift};
    use std::sync::atomic::{AtomicI64, Ordering};

    const TERM_LENGTH: usize = 65536;

    fn term_over(block: &mut [u8]) -> TermBuffer<'_> {
        unsafe { TermBuffer::new(block.as_mut_ptr(), block.len()) }
    }

    fn meta_over(block: &mut [u8]) -> LogMetadata<'_> {
        let meta = unsafe { LogMetadata::new(block.as_mut_ptr()) };
        meta.set_initial_term_id(7);
        meta.set_default_frame_header(&default_frame_header(17, 1001));
        meta.set_default_frame_header_length(HEADER_LENGTH as i32);
        meta
    }

    fn bits() -> u32 {
        position_bits_to_shift(TERM_LENGTH as i32)
    }

    #[test]
    fn dead_writer_hole_is_padded_to_the_tail() {
        let mut term_block = vec![0u8; TERM_LENGTH];
        let mut meta_block = vec![0u8; LOG_META_DATA_LENGTH];
        let term = term_over(&mut term_block);
        let meta = meta_over(&mut meta_block);
        // A writer reserved 4096 bytes at offset 0 and died before the header.
        meta.tail_counter(0)
            .store(pack_tail(7, 4096), Ordering::Release);

        let outcome = unblock_at(&term, &meta, 0, bits(), 7);
        assert_eq!(outcome, UnblockOutcome::Unblocked);
        assert!(is_padding(&term, 0));
        assert_eq!(frame_length_volatile(&term, 0), 4096);
    }

    #[test]
    fn padding_stops_at_the_first_committed_frame() {
        let mut term_block = vec![0u8; TERM_LENGTH];
        let mut meta_block = vec![0u8; LOG_META_DATA_LENGTH];
        let term = term_over(&mut term_block);
        let meta = meta_over(&mut meta_block);
        let template = default_frame_header(17, 1001);

        // A later writer committed at 4096 while the first claim stayed empty.
        let tail = AtomicI64::new(pack_tail(7, 4096));
        let appender = TermAppender::new(term, &tail);
        appender.append_unfragmented(&template, &[1; 64], 0);
        meta.tail_counter(0)
            .store(tail.load(Ordering::Relaxed), Ordering::Release);

        let outcome = unblock_at(&term, &meta, 0, bits(), 7);
        assert_eq!(outcome, UnblockOutcome::Unblocked);
        assert!(is_padding(&term, 0));
        assert_eq!(frame_length_volatile(&term, 0), 4096);
        // The committed frame is untouched.
        assert!(!is_padding(&term, 4096));
        assert_eq!(frame_length_volatile(&term, 4096), 96);
    }

    #[test]
    fn committed_frame_is_never_overwritten() {
        let mut term_block = vec![0u8; TERM_LENGTH];
        let mut meta_block = vec![0u8; LOG_META_DATA_LENGTH];
        let term = term_over(&mut term_block);
        let meta = meta_over(&mut meta_block);
        let template = default_frame_header(17, 1001);

        let tail = AtomicI64::new(pack_tail(7, 0));
        let appender = TermAppender::new(term, &tail);
        appender.append_unfragmented(&template, &[2; 64], 0);
        meta.tail_counter(0)
            .store(tail.load(Ordering::Relaxed), Ordering::Release);

        let outcome = unblock_at(&term, &meta, 0, bits(), 7);
        assert_eq!(outcome, UnblockOutcome::NoAction);
        assert!(!is_padding(&term, 0));
    }

    #[test]
    fn rotated_term_is_padded_to_its_end() {
        let mut term_block = vec![0u8; TERM_LENGTH];
        let mut meta_block = vec![0u8; LOG_META_DATA_LENGTH];
        let term = term_over(&mut term_block);
        let meta = meta_over(&mut meta_block);
        // The log moved on to term count 1; the blocked term's remainder is
        // claimable to the end.
        meta.active_term_count_release(1);
        meta.tail_counter(0)
            .store(pack_tail(7, TERM_LENGTH as i32 + 64), Ordering::Release);

        let outcome = unblock_at(&term, &meta, 0, bits(), 7);
        assert_eq!(outcome, UnblockOutcome::UnblockedToEnd);
        assert!(is_padding(&term, 0));
        assert_eq!(frame_length_volatile(&term, 0), TERM_LENGTH as i32);
    }

    #[test]
    fn no_hole_means_no_action() {
        let mut term_block = vec![0u8; TERM_LENGTH];
        let mut meta_block = vec![0u8; LOG_META_DATA_LENGTH];
        let term = term_over(&mut term_block);
        let meta = meta_over(&mut meta_block);
        meta.tail_counter(0).store(pack_tail(7, 0), Ordering::Release);

        let outcome = unblock_at(&term, &meta, 0, bits(), 7);
        assert_eq!(outcome, UnblockOutcome::NoAction);
    }

    #[test]
    fn hole_in_the_middle_of_a_term_is_padded() {
        let mut term_block = vec![0u8; TERM_LENGTH];
        let mut meta_block = vec![0u8; LOG_META_DATA_LENGTH];
        let term = term_over(&mut term_block);
        let meta = meta_over(&mut meta_block);
        let template = default_frame_header(17, 1001);

        let tail = AtomicI64::new(pack_tail(7, 0));
        let appender = TermAppender::new(term, &tail);
        appender.append_unfragmented(&template, &[3; 64], 0);
        // Second claim of 1024 bytes dies; third commits after it.
        tail.fetch_add(1024, Ordering::SeqCst);
        appender.append_unfragmented(&template, &[4; 64], 0);
        meta.tail_counter(0)
            .store(tail.load(Ordering::Relaxed), Ordering::Release);

        let blocked_position = 96;
        let outcome = unblock_at(&term, &meta, blocked_position, bits(), 7);
        assert_eq!(outcome, UnblockOutcome::Unblocked);
        assert!(is_padding(&term, 96));
        assert_eq!(frame_length_volatile(&term, 96), 1024);
        assert_eq!(frame_length_volatile(&term, 96 + 1024), 96);
    }
}
