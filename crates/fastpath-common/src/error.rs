//! Error types for the fast path

use thiserror::Error;

/// Rule management errors, returned synchronously to the connection manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    /// A connection with the same tuple is already accelerated
    #[error("connection already exists")]
    Duplicate,

    /// No room for another connection
    #[error("connection table exhausted")]
    ResourceExhausted,

    /// Interface index unknown or not registered
    #[error("bad interface: {0}")]
    BadInterface(u32),

    /// No connection with that tuple
    #[error("connection not found")]
    NotFound,
}

/// Packet buffer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Access past the end of the packet data
    #[error("packet truncated: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes present
        available: usize,
    },

    /// Could not make room in front of the packet
    #[error("no headroom for {0} byte header")]
    NoHeadroom(usize),

    /// Private copy of a shared buffer could not be allocated
    #[error("failed to copy shared packet")]
    CopyFailed,
}

/// Engine configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds an unusable value
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Result type for rule management
pub type RuleResult<T> = Result<T, RuleError>;
