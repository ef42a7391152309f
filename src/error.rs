//! Error types for the store.

use thiserror::Error;

/// Errors surfaced by store operations.
///
/// Capacity errors are configuration errors: the store cannot make progress
/// until it is configured with larger buffers, so callers should treat them as
/// fatal. They are never retried internally and the store is left unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A buffer of the required size would exceed the configured maximum.
    #[error("minimum new buffer size ({needed} elements) exceeds max size ({max} elements)")]
    CapacityExceeded {
        /// Elements the new buffer would need.
        needed: u64,
        /// Configured maximum elements per buffer.
        max: u64,
    },

    /// Every buffer id is in use.
    #[error("no free buffer id (all {max_buffers} buffers in use)")]
    NoFreeBuffer {
        /// Configured number of buffer ids.
        max_buffers: usize,
    },

    /// Serialized input is truncated or malformed.
    #[error("corrupt serialized input at byte {offset}: {reason}")]
    Corrupt {
        /// Byte offset of the offending record.
        offset: usize,
        /// What was wrong.
        reason: &'static str,
    },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
