//! Fast Path Common - shared vocabulary for the IPv4 flow accelerator
//!
//! This crate provides the small value types that both the connection
//! manager side and the data plane speak:
//! - 5-tuples and endpoints
//! - MAC addresses
//! - Rule and packet error taxonomy
//! - Nanosecond timestamps

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod flow;

pub use error::*;
pub use flow::*;

/// Nanosecond wall-clock timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Get current timestamp (nanoseconds since epoch)
    #[inline(always)]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self(nanos)
    }

    /// Build from a raw nanosecond count
    #[inline(always)]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Get nanoseconds value
    #[inline(always)]
    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Time elapsed between `earlier` and `self`, zero if the clock went backwards
    #[inline(always)]
    pub fn duration_since(&self, earlier: Timestamp) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}
