//! Purpose: Define the stable public Rust API boundary for rillite.
//! Exports: Core types and operations needed by a driver conductor and clients.
//! Role: Public, additive-only surface; hides internal log-buffer modules.
//! Invariants: This module is the only public path to engine primitives.
//! Invariants: Internal modules remain private and are not directly exposed.

pub use crate::core::appender::BufferClaim;
pub use crate::core::counters::{CounterId, CountersManager, Position, ReadablePosition};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::params::{
    PublicationParams, DEFAULT_MTU_LENGTH, DEFAULT_TERM_LENGTH, TERM_MAX_LENGTH, TERM_MIN_LENGTH,
};
pub use crate::core::publication::{
    ClaimResult, Image, LifecycleListener, NoopListener, Publication, PublicationState, Publisher,
    SystemCounters, TetherEvent, ADMIN_ACTION, BACK_PRESSURED, CLOSED, MAX_POSITION_EXCEEDED,
    NOT_CONNECTED,
};
pub use crate::core::reader::FrameRef;
pub use crate::core::subscribable::TetherState;
pub use crate::log_paths::{default_log_dir, log_file_path, LOG_FILE_EXTENSION};
