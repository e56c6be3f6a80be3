// src/error.rs
//! Error types for pool and primitive operations with conversion support.
//!
//! Only *resource* failures are representable here: allocation failure,
//! capacity exhaustion, missing hardware support. Precondition violations
//! (recycling a foreign pointer, lane index out of range, more than
//! [`MAX_USERS`](crate::pool::MAX_USERS) concurrent guard threads) are
//! programmer bugs and panic with a diagnostic naming the violated
//! invariant — they are never surfaced as an `Err`.

use std::fmt;

/// Errors that can occur during pool and primitive operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool has reached its maximum encodable capacity and cannot grow.
    CapacityExhausted,
    /// The global allocator failed to provide a block or cache array.
    AllocationFailed,
    /// The CPU lacks the 16-byte compare-exchange instruction.
    DwcasUnsupported,
    /// Invalid pool state.
    InvalidState(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExhausted => write!(f, "Pool capacity exhausted"),
            Self::AllocationFailed => write!(f, "Allocation failed"),
            Self::DwcasUnsupported => {
                write!(f, "16-byte compare-exchange not supported on this platform")
            }
            Self::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for PoolError {}

// ============================================================================
// ERROR CONVERSION
// ============================================================================

/// Convert PoolError to std::io::Error
impl From<PoolError> for std::io::Error {
    fn from(err: PoolError) -> Self {
        use std::io::ErrorKind;
        match err {
            PoolError::CapacityExhausted | PoolError::AllocationFailed => {
                std::io::Error::new(ErrorKind::OutOfMemory, err)
            }
            PoolError::DwcasUnsupported => std::io::Error::new(ErrorKind::Unsupported, err),
            _ => std::io::Error::new(ErrorKind::Other, err),
        }
    }
}

/// Convert PoolError to anyhow::Error
#[cfg(feature = "anyhow")]
impl From<PoolError> for anyhow::Error {
    fn from(err: PoolError) -> Self {
        anyhow::anyhow!("{}", err)
    }
}

/// Allow using ? with anyhow::Error
#[cfg(feature = "anyhow")]
impl From<anyhow::Error> for PoolError {
    fn from(err: anyhow::Error) -> Self {
        PoolError::InvalidState(err.to_string())
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type alias for pool operations.
///
/// Note: When using with other Result types (like anyhow::Result),
/// either qualify the type (`guardpool::Result<T>`) or use the conversion traits.
pub type Result<T> = std::result::Result<T, PoolError>;

// ============================================================================
// EXTENSION TRAIT FOR EASY CONVERSION
// ============================================================================

/// Extension trait for converting Results between different error types.
pub trait ResultExt<T> {
    /// Convert to anyhow::Result
    #[cfg(feature = "anyhow")]
    fn into_anyhow(self) -> anyhow::Result<T>;

    /// Convert to io::Result
    fn into_io(self) -> std::io::Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    #[cfg(feature = "anyhow")]
    fn into_anyhow(self) -> anyhow::Result<T> {
        self.map_err(|e| e.into())
    }

    fn into_io(self) -> std::io::Result<T> {
        self.map_err(|e| e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion_io() {
        let err = PoolError::CapacityExhausted;
        let io_err: std::io::Error = err.into();
        assert_eq!(io_err.kind(), std::io::ErrorKind::OutOfMemory);
    }

    #[test]
    fn test_result_ext() {
        let result: Result<u32> = Ok(42);
        let io_result = result.into_io();
        assert_eq!(io_result.unwrap(), 42);
    }

    #[cfg(feature = "anyhow")]
    #[test]
    fn test_anyhow_conversion() {
        let err = PoolError::AllocationFailed;
        let anyhow_err: anyhow::Error = err.into();
        assert!(anyhow_err.to_string().contains("Allocation failed"));
    }
}
