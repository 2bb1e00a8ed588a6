//! Purpose: Scan committed frames in a term on behalf of a subscriber.
//! Exports: `read_frames`, `FrameRef`, `ReadOutcome`.
//! Role: Read-side primitive used by `Image::poll`; zero-copy payload borrows.
//! Invariants: A frame is consumed only after its `frame_length` reads non-zero
//! with acquire ordering; a zero length stops the scan at that offset.
//! Invariants: PAD frames advance the offset but never reach the handler.
use crate::core::frame::{
    self, FRAME_ALIGNMENT, HEADER_LENGTH,
};
use crate::core::layout::TermBuffer;
use crate::core::position::align;

/// A committed frame borrowed from the mapped term.
#[derive(Debug)]
pub struct FrameRef<'a> {
    pub position: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub term_offset: i32,
    pub flags: u8,
    pub reserved_value: i64,
    pub payload: &'a [u8],
}

#[derive(Debug, Eq, PartialEq)]
pub struct ReadOutcome {
    /// Term offset after the last consumed frame (or pad).
    pub offset: usize,
    /// Data frames delivered to the handler.
    pub frames_read: usize,
}

/// Read up to `limit` data frames starting at `offset`.
///
/// `term_base_position` is the stream position of the term's first byte, used
/// to stamp each frame with its stream position.
pub fn read_frames<'a, F>(
    term: &TermBuffer<'a>,
    offset: usize,
    term_base_position: i64,
    limit: usize,
    handler: &mut F,
) -> ReadOutcome
where
    F: FnMut(FrameRef<'a>),
{
    let capacity = term.len();
    let mut offset = offset;
    let mut frames_read = 0;

    while frames_read < limit && offset < capacity {
        let frame_length = frame::frame_length_volatile(term, offset);
        if frame_length <= 0 {
            break;
        }

        let aligned_length = align(frame_length as usize, FRAME_ALIGNMENT);
        if frame::is_padding(term, offset) {
            offset += aligned_length;
            continue;
        }

        handler(FrameRef {
            position: term_base_position + offset as i64,
            session_id: frame::frame_session_id(term, offset),
            stream_id: frame::frame_stream_id(term, offset),
            term_id: frame::frame_term_id(term, offset),
            term_offset: frame::frame_term_offset(term, offset),
            flags: frame::frame_flags(term, offset),
            reserved_value: frame::frame_reserved_value(term, offset),
            payload: term.bytes(offset + HEADER_LENGTH, frame_length as usize - HEADER_LENGTH),
        });

        offset += aligned_length;
        frames_read += 1;
    }

    ReadOutcome { offset, frames_read }
}
