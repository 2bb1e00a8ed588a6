//! Purpose: Define the 32-byte frame header and its commit protocol.
//! Exports: field offsets, flags, frame types, header mutators over a `TermBuffer`.
//! Role: Shared encoding primitives used by the appender, reader, and unblocker.
//! Invariants: All fields little-endian; `frame_length` is stored last, with release
//! ordering, and a frame is visible to readers only once it reads non-zero.
//! Invariants: Frames are 32-byte aligned; the unused tail of a term is one PAD frame.
use crate::core::layout::TermBuffer;

pub const FRAME_ALIGNMENT: usize = 32;
pub const HEADER_LENGTH: usize = 32;

pub const FRAME_LENGTH_FIELD_OFFSET: usize = 0;
pub const VERSION_FIELD_OFFSET: usize = 4;
pub const FLAGS_FIELD_OFFSET: usize = 5;
pub const TYPE_FIELD_OFFSET: usize = 6;
pub const TERM_OFFSET_FIELD_OFFSET: usize = 8;
pub const SESSION_ID_FIELD_OFFSET: usize = 12;
pub const STREAM_ID_FIELD_OFFSET: usize = 16;
pub const TERM_ID_FIELD_OFFSET: usize = 20;
pub const RESERVED_VALUE_FIELD_OFFSET: usize = 24;

pub const BEGIN_FRAG_FLAG: u8 = 0x80;
pub const END_FRAG_FLAG: u8 = 0x40;
pub const UNFRAGMENTED: u8 = BEGIN_FRAG_FLAG | END_FRAG_FLAG;

pub const HDR_TYPE_PAD: u16 = 0x00;
pub const HDR_TYPE_DATA: u16 = 0x01;

pub const CURRENT_VERSION: u8 = 0;

/// Header template stored in log metadata and prefilled into claimed frames.
/// `frame_length` is left zero so an uncommitted frame stays invisible.
pub fn default_frame_header(session_id: i32, stream_id: i32) -> [u8; HEADER_LENGTH] {
    let mut header = [0u8; HEADER_LENGTH];
    header[VERSION_FIELD_OFFSET] = CURRENT_VERSION;
    header[FLAGS_FIELD_OFFSET] = UNFRAGMENTED;
    header[TYPE_FIELD_OFFSET..TYPE_FIELD_OFFSET + 2].copy_from_slice(&HDR_TYPE_DATA.to_le_bytes());
    header[SESSION_ID_FIELD_OFFSET..SESSION_ID_FIELD_OFFSET + 4]
        .copy_from_slice(&session_id.to_le_bytes());
    header[STREAM_ID_FIELD_OFFSET..STREAM_ID_FIELD_OFFSET + 4]
        .copy_from_slice(&stream_id.to_le_bytes());
    header
}

pub fn frame_length_volatile(term: &TermBuffer<'_>, frame_offset: usize) -> i32 {
    term.get_i32_acquire(frame_offset + FRAME_LENGTH_FIELD_OFFSET)
}

pub fn frame_length_release(term: &TermBuffer<'_>, frame_offset: usize, length: i32) {
    term.put_i32_release(frame_offset + FRAME_LENGTH_FIELD_OFFSET, length)
}

pub fn frame_type(term: &TermBuffer<'_>, frame_offset: usize) -> u16 {
    term.get_u16(frame_offset + TYPE_FIELD_OFFSET)
}

pub fn is_padding(term: &TermBuffer<'_>, frame_offset: usize) -> bool {
    frame_type(term, frame_offset) == HDR_TYPE_PAD
}

pub fn frame_flags(term: &TermBuffer<'_>, frame_offset: usize) -> u8 {
    term.get_u8(frame_offset + FLAGS_FIELD_OFFSET)
}

pub fn set_frame_flags(term: &TermBuffer<'_>, frame_offset: usize, flags: u8) {
    term.put_u8(frame_offset + FLAGS_FIELD_OFFSET, flags)
}

pub fn set_frame_type(term: &TermBuffer<'_>, frame_offset: usize, frame_type: u16) {
    term.put_u16(frame_offset + TYPE_FIELD_OFFSET, frame_type)
}

pub fn frame_term_offset(term: &TermBuffer<'_>, frame_offset: usize) -> i32 {
    term.get_i32(frame_offset + TERM_OFFSET_FIELD_OFFSET)
}

pub fn frame_session_id(term: &TermBuffer<'_>, frame_offset: usize) -> i32 {
    term.get_i32(frame_offset + SESSION_ID_FIELD_OFFSET)
}

pub fn frame_stream_id(term: &TermBuffer<'_>, frame_offset: usize) -> i32 {
    term.get_i32(frame_offset + STREAM_ID_FIELD_OFFSET)
}

pub fn frame_term_id(term: &TermBuffer<'_>, frame_offset: usize) -> i32 {
    term.get_i32(frame_offset + TERM_ID_FIELD_OFFSET)
}

pub fn frame_reserved_value(term: &TermBuffer<'_>, frame_offset: usize) -> i64 {
    term.get_i64(frame_offset + RESERVED_VALUE_FIELD_OFFSET)
}

pub fn set_reserved_value(term: &TermBuffer<'_>, frame_offset: usize, value: i64) {
    term.put_i64(frame_offset + RESERVED_VALUE_FIELD_OFFSET, value)
}

/// Prefill a claimed slot from the metadata template and stamp its coordinates.
/// The slot stays invisible: the template's `frame_length` is zero.
pub fn apply_default_header(
    term: &TermBuffer<'_>,
    frame_offset: usize,
    template: &[u8],
    term_id: i32,
) {
    term.put_bytes(frame_offset, template);
    term.put_i32(frame_offset + TERM_OFFSET_FIELD_OFFSET, frame_offset as i32);
    term.put_i32(frame_offset + TERM_ID_FIELD_OFFSET, term_id);
}

/// Write and commit a PAD frame covering `[frame_offset, frame_offset + length)`.
pub fn write_pad_frame(
    term: &TermBuffer<'_>,
    frame_offset: usize,
    length: usize,
    template: &[u8],
    term_id: i32,
) {
    apply_default_header(term, frame_offset, template, term_id);
    set_frame_type(term, frame_offset, HDR_TYPE_PAD);
    set_frame_flags(term, frame_offset, UNFRAGMENTED);
    frame_length_release(term, frame_offset, length as i32);
}
