//! Purpose: Wait-free reservation and commit of frames in the active term.
//! Exports: `TermAppender`, `AppendOutcome`, `ClaimOutcome`, `BufferClaim`.
//! Role: Writer fast path; serialization comes solely from fetch-and-add on the
//! raw tail, never from locks.
//! Invariants: A claimed region is committed by exactly one release store of its
//! `frame_length`; until then readers treat it as absent.
//! Invariants: The first claimer past the end of a term pads the remainder; every
//! claimer past the end reports `Tripped` so the owner can rotate.
use std::sync::atomic::{AtomicI64, Ordering};

use crate::core::frame::{
    self, BEGIN_FRAG_FLAG, END_FRAG_FLAG, FRAME_ALIGNMENT, HEADER_LENGTH,
};
use crate::core::layout::TermBuffer;
use crate::core::position::align;

pub struct TermAppender<'a> {
    term: TermBuffer<'a>,
    tail: &'a AtomicI64,
}

#[derive(Debug, Eq, PartialEq)]
pub enum AppendOutcome {
    Appended { resulting_offset: i32 },
    Tripped,
}

pub enum ClaimOutcome<'a> {
    Claimed(BufferClaim<'a>),
    Tripped,
}

impl<'a> TermAppender<'a> {
    pub fn new(term: TermBuffer<'a>, tail: &'a AtomicI64) -> Self {
        Self { term, tail }
    }

    /// Append a message that fits in a single frame.
    pub fn append_unfragmented(
        &self,
        template: &[u8],
        message: &[u8],
        reserved_value: i64,
    ) -> AppendOutcome {
        let frame_length = message.len() + HEADER_LENGTH;
        let aligned_length = align(frame_length, FRAME_ALIGNMENT);
        let (term_offset, term_id) = self.reserve(aligned_length);

        let resulting_offset = term_offset + aligned_length as i64;
        if resulting_offset > self.term.len() as i64 {
            self.handle_end_of_term(term_offset, term_id, template);
            return AppendOutcome::Tripped;
        }

        let offset = term_offset as usize;
        frame::apply_default_header(&self.term, offset, template, term_id);
        self.term.put_bytes(offset + HEADER_LENGTH, message);
        frame::set_reserved_value(&self.term, offset, reserved_value);
        frame::frame_length_release(&self.term, offset, frame_length as i32);

        AppendOutcome::Appended {
            resulting_offset: resulting_offset as i32,
        }
    }

    /// Append a message as a chain of MTU-sized fragments reserved in one go.
    pub fn append_fragmented(
        &self,
        template: &[u8],
        message: &[u8],
        max_payload: usize,
        reserved_value: i64,
    ) -> AppendOutcome {
        let framed_length = crate::core::position::compute_fragmented_frame_length(
            message.len(),
            max_payload,
            HEADER_LENGTH,
            FRAME_ALIGNMENT,
        );
        let (term_offset, term_id) = self.reserve(framed_length);

        let resulting_offset = term_offset + framed_length as i64;
        if resulting_offset > self.term.len() as i64 {
            self.handle_end_of_term(term_offset, term_id, template);
            return AppendOutcome::Tripped;
        }

        let mut flags = BEGIN_FRAG_FLAG;
        let mut remaining = message.len();
        let mut frame_offset = term_offset as usize;
        loop {
            let bytes = remaining.min(max_payload);
            let frame_length = bytes + HEADER_LENGTH;
            let aligned_length = align(frame_length, FRAME_ALIGNMENT);
            if bytes == remaining {
                flags |= END_FRAG_FLAG;
            }

            frame::apply_default_header(&self.term, frame_offset, template, term_id);
            self.term.put_bytes(
                frame_offset + HEADER_LENGTH,
                &message[message.len() - remaining..message.len() - remaining + bytes],
            );
            frame::set_frame_flags(&self.term, frame_offset, flags);
            frame::set_reserved_value(&self.term, frame_offset, reserved_value);
            frame::frame_length_release(&self.term, frame_offset, frame_length as i32);

            remaining -= bytes;
            if remaining == 0 {
                break;
            }
            frame_offset += aligned_length;
            flags = 0;
        }

        AppendOutcome::Appended {
            resulting_offset: resulting_offset as i32,
        }
    }

    /// Reserve a region for a zero-copy write. The claim must be committed or
    /// aborted by the caller; an unfilled claim is eventually padded over by
    /// the conductor's unblocker.
    pub fn claim(&self, template: &[u8], length: usize) -> ClaimOutcome<'a> {
        let frame_length = length + HEADER_LENGTH;
        let aligned_length = align(frame_length, FRAME_ALIGNMENT);
        let (term_offset, term_id) = self.reserve(aligned_length);

        let resulting_offset = term_offset + aligned_length as i64;
        if resulting_offset > self.term.len() as i64 {
            self.handle_end_of_term(term_offset, term_id, template);
            return ClaimOutcome::Tripped;
        }

        let offset = term_offset as usize;
        frame::apply_default_header(&self.term, offset, template, term_id);

        ClaimOutcome::Claimed(BufferClaim {
            term: self.term,
            frame_offset: offset,
            frame_length,
            resulting_offset: resulting_offset as i32,
            position: 0,
        })
    }

    fn reserve(&self, aligned_length: usize) -> (i64, i32) {
        let raw_tail = self.tail.fetch_add(aligned_length as i64, Ordering::SeqCst);
        let term_offset = raw_tail & 0xFFFF_FFFF;
        let term_id = (raw_tail >> 32) as i32;
        (term_offset, term_id)
    }

    /// The claimer that crossed the boundary first owns the PAD frame; later
    /// claimers see an offset already past the end and write nothing.
    fn handle_end_of_term(&self, term_offset: i64, term_id: i32, template: &[u8]) {
        let term_length = self.term.len();
        if term_offset < term_length as i64 {
            let offset = term_offset as usize;
            frame::write_pad_frame(&self.term, offset, term_length - offset, template, term_id);
        }
    }
}

/// A reserved, headered, not-yet-visible frame for zero-copy writing.
#[derive(Debug)]
pub struct BufferClaim<'a> {
    term: TermBuffer<'a>,
    frame_offset: usize,
    frame_length: usize,
    resulting_offset: i32,
    position: i64,
}

impl<'a> BufferClaim<'a> {
    pub fn payload(&mut self) -> &mut [u8] {
        self.term
            .bytes_mut(self.frame_offset + HEADER_LENGTH, self.frame_length - HEADER_LENGTH)
    }

    pub fn length(&self) -> usize {
        self.frame_length - HEADER_LENGTH
    }

    /// Stream position the publication will report for this frame's end.
    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn set_reserved_value(&mut self, value: i64) {
        frame::set_reserved_value(&self.term, self.frame_offset, value);
    }

    /// Publish the frame to readers.
    pub fn commit(self) {
        frame::frame_length_release(&self.term, self.frame_offset, self.frame_length as i32);
    }

    /// Turn the reservation into padding so readers skip it.
    pub fn abort(self) {
        frame::set_frame_type(&self.term, self.frame_offset, frame::HDR_TYPE_PAD);
        frame::set_frame_flags(&self.term, self.frame_offset, frame::UNFRAGMENTED);
        frame::frame_length_release(&self.term, self.frame_offset, self.frame_length as i32);
    }

    pub(crate) fn resulting_offset(&self) -> i32 {
        self.resulting_offset
    }

    pub(crate) fn set_position(&mut self, position: i64) {
        self.position = position;
    }
}
