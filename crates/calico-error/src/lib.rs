//! The error type shared by every engine layer.
//!
//! One enum, one kind per failure class. Fallible operations return
//! [`Result`] and propagate with `?`; the pager additionally latches the
//! first non-OK result it observes and short-circuits until the
//! transaction finishes.

use std::fmt;

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T, E = CalicoError> = std::result::Result<T, E>;

/// Every failure the engine can surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalicoError {
    /// A requested key, bucket, or file does not exist.
    #[error("not found")]
    NotFound,

    /// A caller-supplied argument is malformed, or a file is not a
    /// database of a supported format.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An on-disk invariant does not hold.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The environment reported an I/O failure.
    #[error("i/o error: {0}")]
    Io(String),

    /// A lock could not be acquired. `retry` asks the caller to consult
    /// its busy handler before giving up.
    #[error("busy (retry={retry})")]
    Busy { retry: bool },

    /// The operation is not supported by this build or configuration.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// An allocation failed or an internal resource pool is exhausted.
    #[error("out of memory: {0}")]
    NoMemory(String),
}

impl CalicoError {
    pub fn invalid_argument(msg: impl fmt::Display) -> Self {
        Self::InvalidArgument(msg.to_string())
    }

    pub fn corruption(msg: impl fmt::Display) -> Self {
        Self::Corruption(msg.to_string())
    }

    pub fn io(msg: impl fmt::Display) -> Self {
        Self::Io(msg.to_string())
    }

    pub fn not_supported(msg: impl fmt::Display) -> Self {
        Self::NotSupported(msg.to_string())
    }

    pub fn no_memory(msg: impl fmt::Display) -> Self {
        Self::NoMemory(msg.to_string())
    }

    /// Busy without a retry hint.
    #[must_use]
    pub const fn busy() -> Self {
        Self::Busy { retry: false }
    }

    /// Busy with a hint that the caller's busy handler should decide.
    #[must_use]
    pub const fn retry() -> Self {
        Self::Busy { retry: true }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    #[must_use]
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }

    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }

    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    #[must_use]
    pub const fn is_retry(&self) -> bool {
        matches!(self, Self::Busy { retry: true })
    }

    #[must_use]
    pub const fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }

    #[must_use]
    pub const fn is_no_memory(&self) -> bool {
        matches!(self, Self::NoMemory(_))
    }
}

impl From<std::io::Error> for CalicoError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_predicates() {
        assert!(CalicoError::NotFound.is_not_found());
        assert!(CalicoError::corruption("bad header").is_corruption());
        assert!(CalicoError::busy().is_busy());
        assert!(!CalicoError::busy().is_retry());
        assert!(CalicoError::retry().is_busy());
        assert!(CalicoError::retry().is_retry());
        assert!(CalicoError::no_memory("pool exhausted").is_no_memory());
    }

    #[test]
    fn display_includes_detail() {
        let err = CalicoError::corruption("freelist length mismatch");
        assert_eq!(err.to_string(), "corruption: freelist length mismatch");
        assert_eq!(CalicoError::retry().to_string(), "busy (retry=true)");
        assert_eq!(CalicoError::busy().to_string(), "busy (retry=false)");
    }

    #[test]
    fn io_error_conversion() {
        let io = std::io::Error::other("disk gone");
        let err = CalicoError::from(io);
        assert!(err.is_io());
    }
}
