//! Foundational low-level utilities shared across Warden crates.
//!
//! Provides atomic file-write helpers and unix-time utilities used by store
//! snapshots and flow-expiry checks.

pub mod atomic_io;
pub mod time_utils;

pub use atomic_io::{write_json_atomic, write_text_atomic};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, is_older_than};
