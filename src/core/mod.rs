// Core modules implementing the mapped log, append protocol, and lifecycle.
pub mod appender;
pub mod counters;
pub mod error;
pub mod frame;
pub mod layout;
pub mod log_buffer;
pub mod params;
pub mod position;
pub mod publication;
pub mod reader;
pub mod subscribable;
pub mod unblocker;
