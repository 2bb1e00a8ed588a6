//! Purpose: Define the mapped log-file layout and raw views over its regions.
//! Exports: metadata field offsets, `LOG_META_DATA_LENGTH`, `TermBuffer`, `LogMetadata`.
//! Role: Single source of truth for the bit-exact shared layout; all little-endian.
//! Invariants: Three equal term buffers precede one metadata page.
//! Invariants: Tail counters and `active_term_count` are only accessed atomically.
//! Invariants: Offsets of atomic fields are naturally aligned for 32/64-bit access.
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use crate::core::position::PARTITION_COUNT;

pub const CACHE_LINE_LENGTH: usize = 64;
pub const LOG_META_DATA_LENGTH: usize = 4096;

// Per-partition tail counters, one 64-bit word each.
pub const TERM_TAIL_COUNTERS_OFFSET: usize = 0;
pub const LOG_ACTIVE_TERM_COUNT_OFFSET: usize = TERM_TAIL_COUNTERS_OFFSET + 8 * PARTITION_COUNT;

// Second cache-line block: fields mutated while the log is live.
pub const LOG_END_OF_STREAM_POSITION_OFFSET: usize = CACHE_LINE_LENGTH * 2;
pub const LOG_IS_CONNECTED_OFFSET: usize = LOG_END_OF_STREAM_POSITION_OFFSET + 8;
pub const LOG_ACTIVE_TRANSPORT_COUNT_OFFSET: usize = LOG_IS_CONNECTED_OFFSET + 4;

// Static fields, written once at creation.
pub const LOG_CORRELATION_ID_OFFSET: usize = CACHE_LINE_LENGTH * 4;
pub const LOG_INITIAL_TERM_ID_OFFSET: usize = LOG_CORRELATION_ID_OFFSET + 8;
pub const LOG_DEFAULT_FRAME_HEADER_LENGTH_OFFSET: usize = LOG_INITIAL_TERM_ID_OFFSET + 4;
pub const LOG_MTU_LENGTH_OFFSET: usize = LOG_DEFAULT_FRAME_HEADER_LENGTH_OFFSET + 4;
pub const LOG_TERM_LENGTH_OFFSET: usize = LOG_MTU_LENGTH_OFFSET + 4;
pub const LOG_PAGE_SIZE_OFFSET: usize = LOG_TERM_LENGTH_OFFSET + 4;
pub const LOG_PUBLICATION_WINDOW_LENGTH_OFFSET: usize = LOG_PAGE_SIZE_OFFSET + 4;
pub const LOG_RECEIVER_WINDOW_LENGTH_OFFSET: usize = LOG_PUBLICATION_WINDOW_LENGTH_OFFSET + 4;
pub const LOG_SOCKET_SNDBUF_LENGTH_OFFSET: usize = LOG_RECEIVER_WINDOW_LENGTH_OFFSET + 4;
pub const LOG_SOCKET_RCVBUF_LENGTH_OFFSET: usize = LOG_SOCKET_SNDBUF_LENGTH_OFFSET + 4;

// Template header copied into every claimed frame; frame_length stays zero.
pub const LOG_DEFAULT_FRAME_HEADER_OFFSET: usize = CACHE_LINE_LENGTH * 5;

pub fn compute_log_length(term_length: usize) -> usize {
    term_length * PARTITION_COUNT + LOG_META_DATA_LENGTH
}

pub fn tail_counter_offset(partition_index: usize) -> usize {
    TERM_TAIL_COUNTERS_OFFSET + partition_index * 8
}

/// Raw view over one mapped term partition. Copyable; the mapping outlives it.
///
/// Plain accessors are used for bytes that are published by a later release
/// store of `frame_length`; the atomic accessors carry the ordering itself.
#[derive(Clone, Copy, Debug)]
pub struct TermBuffer<'a> {
    ptr: *mut u8,
    len: usize,
    _marker: PhantomData<&'a ()>,
}

impl<'a> TermBuffer<'a> {
    /// Callers must guarantee `ptr..ptr+len` stays mapped for `'a` and is only
    /// written through the frame protocol (release-committed frame lengths).
    pub(crate) unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get_i32(&self, offset: usize) -> i32 {
        debug_assert!(offset + 4 <= self.len);
        unsafe { (self.ptr.add(offset) as *const i32).read_unaligned() }
    }

    pub fn put_i32(&self, offset: usize, value: i32) {
        debug_assert!(offset + 4 <= self.len);
        unsafe { (self.ptr.add(offset) as *mut i32).write_unaligned(value) }
    }

    pub fn get_i32_acquire(&self, offset: usize) -> i32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.len);
        unsafe { &*(self.ptr.add(offset) as *const AtomicI32) }.load(Ordering::Acquire)
    }

    pub fn put_i32_release(&self, offset: usize, value: i32) {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.len);
        unsafe { &*(self.ptr.add(offset) as *const AtomicI32) }.store(value, Ordering::Release)
    }

    pub fn get_i64(&self, offset: usize) -> i64 {
        debug_assert!(offset + 8 <= self.len);
        unsafe { (self.ptr.add(offset) as *const i64).read_unaligned() }
    }

    pub fn put_i64(&self, offset: usize, value: i64) {
        debug_assert!(offset + 8 <= self.len);
        unsafe { (self.ptr.add(offset) as *mut i64).write_unaligned(value) }
    }

    pub fn put_i64_release(&self, offset: usize, value: i64) {
        debug_assert!(offset % 8 == 0 && offset + 8 <= self.len);
        unsafe { &*(self.ptr.add(offset) as *const AtomicI64) }.store(value, Ordering::Release)
    }

    pub fn get_u16(&self, offset: usize) -> u16 {
        debug_assert!(offset + 2 <= self.len);
        unsafe { (self.ptr.add(offset) as *const u16).read_unaligned() }
    }

    pub fn put_u16(&self, offset: usize, value: u16) {
        debug_assert!(offset + 2 <= self.len);
        unsafe { (self.ptr.add(offset) as *mut u16).write_unaligned(value) }
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        debug_assert!(offset < self.len);
        unsafe { self.ptr.add(offset).read() }
    }

    pub fn put_u8(&self, offset: usize, value: u8) {
        debug_assert!(offset < self.len);
        unsafe { self.ptr.add(offset).write(value) }
    }

    pub fn put_bytes(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.len);
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(offset), src.len()) }
    }

    pub fn set_memory(&self, offset: usize, length: usize, value: u8) {
        debug_assert!(offset + length <= self.len);
        unsafe { std::ptr::write_bytes(self.ptr.add(offset), value, length) }
    }

    pub fn bytes(&self, offset: usize, length: usize) -> &'a [u8] {
        debug_assert!(offset + length <= self.len);
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), length) }
    }

    /// Mutable window for a zero-copy claim; valid while the claim is open.
    pub(crate) fn bytes_mut(&self, offset: usize, length: usize) -> &'a mut [u8] {
        debug_assert!(offset + length <= self.len);
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), length) }
    }
}

/// Raw view over the metadata page at the end of the mapped log.
#[derive(Clone, Copy)]
pub struct LogMetadata<'a> {
    base: *mut u8,
    _marker: PhantomData<&'a ()>,
}

impl<'a> LogMetadata<'a> {
    /// Callers must guarantee `base` points at a full metadata page that stays
    /// mapped for `'a`.
    pub(crate) unsafe fn new(base: *mut u8) -> Self {
        Self {
            base,
            _marker: PhantomData,
        }
    }

    fn atomic_i64(&self, offset: usize) -> &'a AtomicI64 {
        debug_assert!(offset % 8 == 0 && offset + 8 <= LOG_META_DATA_LENGTH);
        unsafe { &*(self.base.add(offset) as *const AtomicI64) }
    }

    fn atomic_i32(&self, offset: usize) -> &'a AtomicI32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= LOG_META_DATA_LENGTH);
        unsafe { &*(self.base.add(offset) as *const AtomicI32) }
    }

    fn get_i32(&self, offset: usize) -> i32 {
        unsafe { (self.base.add(offset) as *const i32).read_unaligned() }
    }

    fn put_i32(&self, offset: usize, value: i32) {
        unsafe { (self.base.add(offset) as *mut i32).write_unaligned(value) }
    }

    fn get_i64(&self, offset: usize) -> i64 {
        unsafe { (self.base.add(offset) as *const i64).read_unaligned() }
    }

    fn put_i64(&self, offset: usize, value: i64) {
        unsafe { (self.base.add(offset) as *mut i64).write_unaligned(value) }
    }

    pub fn tail_counter(&self, partition_index: usize) -> &'a AtomicI64 {
        self.atomic_i64(tail_counter_offset(partition_index))
    }

    pub fn raw_tail_volatile(&self, partition_index: usize) -> i64 {
        self.tail_counter(partition_index).load(Ordering::Acquire)
    }

    pub fn active_term_count(&self) -> i32 {
        self.atomic_i32(LOG_ACTIVE_TERM_COUNT_OFFSET)
            .load(Ordering::Acquire)
    }

    pub fn active_term_count_release(&self, value: i32) {
        self.atomic_i32(LOG_ACTIVE_TERM_COUNT_OFFSET)
            .store(value, Ordering::Release)
    }

    pub fn cas_active_term_count(&self, expected: i32, update: i32) -> bool {
        self.atomic_i32(LOG_ACTIVE_TERM_COUNT_OFFSET)
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_of_stream_position(&self) -> i64 {
        self.atomic_i64(LOG_END_OF_STREAM_POSITION_OFFSET)
            .load(Ordering::Acquire)
    }

    pub fn end_of_stream_position_release(&self, value: i64) {
        self.atomic_i64(LOG_END_OF_STREAM_POSITION_OFFSET)
            .store(value, Ordering::Release)
    }

    pub fn is_connected(&self) -> bool {
        self.atomic_i32(LOG_IS_CONNECTED_OFFSET).load(Ordering::Acquire) == 1
    }

    pub fn is_connected_release(&self, connected: bool) {
        self.atomic_i32(LOG_IS_CONNECTED_OFFSET)
            .store(i32::from(connected), Ordering::Release)
    }

    pub fn active_transport_count(&self) -> i32 {
        self.atomic_i32(LOG_ACTIVE_TRANSPORT_COUNT_OFFSET)
            .load(Ordering::Acquire)
    }

    pub fn active_transport_count_release(&self, value: i32) {
        self.atomic_i32(LOG_ACTIVE_TRANSPORT_COUNT_OFFSET)
            .store(value, Ordering::Release)
    }

    pub fn correlation_id(&self) -> i64 {
        self.get_i64(LOG_CORRELATION_ID_OFFSET)
    }

    pub fn set_correlation_id(&self, value: i64) {
        self.put_i64(LOG_CORRELATION_ID_OFFSET, value)
    }

    pub fn initial_term_id(&self) -> i32 {
        self.get_i32(LOG_INITIAL_TERM_ID_OFFSET)
    }

    pub fn set_initial_term_id(&self, value: i32) {
        self.put_i32(LOG_INITIAL_TERM_ID_OFFSET, value)
    }

    pub fn default_frame_header_length(&self) -> i32 {
        self.get_i32(LOG_DEFAULT_FRAME_HEADER_LENGTH_OFFSET)
    }

    pub fn set_default_frame_header_length(&self, value: i32) {
        self.put_i32(LOG_DEFAULT_FRAME_HEADER_LENGTH_OFFSET, value)
    }

    pub fn mtu_length(&self) -> i32 {
        self.get_i32(LOG_MTU_LENGTH_OFFSET)
    }

    pub fn set_mtu_length(&self, value: i32) {
        self.put_i32(LOG_MTU_LENGTH_OFFSET, value)
    }

    pub fn term_length(&self) -> i32 {
        self.get_i32(LOG_TERM_LENGTH_OFFSET)
    }

    pub fn set_term_length(&self, value: i32) {
        self.put_i32(LOG_TERM_LENGTH_OFFSET, value)
    }

    pub fn page_size(&self) -> i32 {
        self.get_i32(LOG_PAGE_SIZE_OFFSET)
    }

    pub fn set_page_size(&self, value: i32) {
        self.put_i32(LOG_PAGE_SIZE_OFFSET, value)
    }

    pub fn publication_window_length(&self) -> i32 {
        self.get_i32(LOG_PUBLICATION_WINDOW_LENGTH_OFFSET)
    }

    pub fn set_publication_window_length(&self, value: i32) {
        self.put_i32(LOG_PUBLICATION_WINDOW_LENGTH_OFFSET, value)
    }

    pub fn receiver_window_length(&self) -> i32 {
        self.get_i32(LOG_RECEIVER_WINDOW_LENGTH_OFFSET)
    }

    pub fn set_receiver_window_length(&self, value: i32) {
        self.put_i32(LOG_RECEIVER_WINDOW_LENGTH_OFFSET, value)
    }

    pub fn socket_sndbuf_length(&self) -> i32 {
        self.get_i32(LOG_SOCKET_SNDBUF_LENGTH_OFFSET)
    }

    pub fn set_socket_sndbuf_length(&self, value: i32) {
        self.put_i32(LOG_SOCKET_SNDBUF_LENGTH_OFFSET, value)
    }

    pub fn socket_rcvbuf_length(&self) -> i32 {
        self.get_i32(LOG_SOCKET_RCVBUF_LENGTH_OFFSET)
    }

    pub fn set_socket_rcvbuf_length(&self, value: i32) {
        self.put_i32(LOG_SOCKET_RCVBUF_LENGTH_OFFSET, value)
    }

    pub fn default_frame_header(&self, header_length: usize) -> &'a [u8] {
        debug_assert!(LOG_DEFAULT_FRAME_HEADER_OFFSET + header_length <= LOG_META_DATA_LENGTH);
        unsafe {
            std::slice::from_raw_parts(self.base.add(LOG_DEFAULT_FRAME_HEADER_OFFSET), header_length)
        }
    }

    pub fn set_default_frame_header(&self, header: &[u8]) {
        debug_assert!(LOG_DEFAULT_FRAME_HEADER_OFFSET + header.len() <= LOG_META_DATA_LENGTH);
        unsafe {
            std::ptr::copy_nonoverlapping(
                header.as_ptr(),
                self.base.add(LOG_DEFAULT_FRAME_HEADER_OFFSET),
                header.len(),
            )
        }
    }
}
