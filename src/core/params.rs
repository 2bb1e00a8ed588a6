//! Purpose: Publication parameters and their creation-time validation.
//! Exports: `PublicationParams`, term-length bounds, default timeouts.
//! Role: Cold-path configuration; a publication is never created from bad params.
//! Invariants: `term_length` is a power of two in [64 KiB, 1 GiB].
//! Invariants: `mtu_length` is frame-aligned and at most `term_length / 8`.
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{FRAME_ALIGNMENT, HEADER_LENGTH};

pub const TERM_MIN_LENGTH: i32 = 64 * 1024;
pub const TERM_MAX_LENGTH: i32 = 1024 * 1024 * 1024;
pub const PAGE_SIZE: i32 = 4096;

pub const DEFAULT_TERM_LENGTH: i32 = 64 * 1024;
pub const DEFAULT_MTU_LENGTH: i32 = 4096;
pub const DEFAULT_LIVENESS_TIMEOUT_NS: i64 = 5_000_000_000;
pub const DEFAULT_UNBLOCK_TIMEOUT_NS: i64 = 15_000_000_000;
pub const DEFAULT_UNTETHERED_WINDOW_LIMIT_TIMEOUT_NS: i64 = 5_000_000_000;
pub const DEFAULT_UNTETHERED_RESTING_TIMEOUT_NS: i64 = 10_000_000_000;

#[derive(Clone, Debug)]
pub struct PublicationParams {
    pub term_length: i32,
    pub mtu_length: i32,
    pub initial_term_id: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub is_exclusive: bool,
    /// Starting point for exclusive publications; ignored otherwise.
    pub has_position: bool,
    pub term_id: i32,
    pub term_offset: i32,
    pub publication_window_length: i32,
    pub liveness_timeout_ns: i64,
    pub unblock_timeout_ns: i64,
    pub untethered_window_limit_timeout_ns: i64,
    pub untethered_linger_timeout_ns: i64,
    pub untethered_resting_timeout_ns: i64,
    pub tag: i64,
    pub channel: String,
}

impl Default for PublicationParams {
    fn default() -> Self {
        Self {
            term_length: DEFAULT_TERM_LENGTH,
            mtu_length: DEFAULT_MTU_LENGTH,
            initial_term_id: 0,
            session_id: 0,
            stream_id: 0,
            is_exclusive: false,
            has_position: false,
            term_id: 0,
            term_offset: 0,
            publication_window_length: 0,
            liveness_timeout_ns: DEFAULT_LIVENESS_TIMEOUT_NS,
            unblock_timeout_ns: DEFAULT_UNBLOCK_TIMEOUT_NS,
            untethered_window_limit_timeout_ns: DEFAULT_UNTETHERED_WINDOW_LIMIT_TIMEOUT_NS,
            untethered_linger_timeout_ns: DEFAULT_UNTETHERED_WINDOW_LIMIT_TIMEOUT_NS,
            untethered_resting_timeout_ns: DEFAULT_UNTETHERED_RESTING_TIMEOUT_NS,
            tag: 0,
            channel: String::new(),
        }
    }
}

impl PublicationParams {
    pub fn validate(&self) -> Result<(), Error> {
        if !is_power_of_two(self.term_length)
            || self.term_length < TERM_MIN_LENGTH
            || self.term_length > TERM_MAX_LENGTH
        {
            return Err(usage("term length must be a power of two in [64 KiB, 1 GiB]", self));
        }
        if self.mtu_length as usize % FRAME_ALIGNMENT != 0 {
            return Err(usage("mtu length must be a multiple of frame alignment", self));
        }
        if self.mtu_length as usize <= HEADER_LENGTH {
            return Err(usage("mtu length must exceed the frame header", self));
        }
        if self.mtu_length > self.term_length / 8 {
            return Err(usage("mtu length must not exceed term length / 8", self));
        }
        if self.publication_window_length < 0
            || self.publication_window_length > self.term_length
        {
            return Err(usage("publication window must fit within a term", self));
        }
        if self.has_position {
            if !self.is_exclusive {
                return Err(usage("starting position requires an exclusive publication", self));
            }
            if self.term_offset as usize % FRAME_ALIGNMENT != 0 {
                return Err(usage("starting term offset must be frame-aligned", self));
            }
            if self.term_offset < 0 || self.term_offset >= self.term_length {
                return Err(usage("starting term offset must lie within the term", self));
            }
        }
        Ok(())
    }

    /// Producer flow-control window; defaults to half a term.
    pub fn term_window_length(&self) -> i32 {
        if self.publication_window_length > 0 {
            self.publication_window_length
        } else {
            self.term_length / 2
        }
    }

    pub fn starting_term_id(&self) -> i32 {
        if self.has_position {
            self.term_id
        } else {
            self.initial_term_id
        }
    }

    pub fn starting_term_offset(&self) -> i32 {
        if self.has_position {
            self.term_offset
        } else {
            0
        }
    }
}

fn is_power_of_two(value: i32) -> bool {
    value > 0 && (value & (value - 1)) == 0
}

fn usage(message: &str, params: &PublicationParams) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(message)
        .with_channel(params.channel.clone())
}
