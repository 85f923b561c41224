//! Error types for the `strata` memory layer.
//!
//! Lookup misses are never errors; they are `None`. Everything here is a
//! condition the caller has to decide about: running out of memory, bad
//! construction arguments, or a region handle that outlived its epoch.

use std::fmt;

/// Errors reported by allocators and tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// The memory manager could not supply a block.
    OutOfMemory {
        /// Bytes requested by the failing allocation.
        requested: usize,
    },

    /// A constructor was given an unusable argument.
    InvalidArgument {
        /// Which argument was rejected.
        what: &'static str,
    },

    /// Alignment is zero or not a power of two.
    InvalidAlignment {
        /// The requested alignment.
        alignment: usize,
    },

    /// A region handle from a generation that has since been reset.
    StaleHandle {
        /// Generation recorded in the handle.
        handle_generation: u64,
        /// Generation of the region now.
        current: u64,
    },
}

impl MemError {
    /// Returns true for conditions with no sensible continuation.
    ///
    /// Callers that do not handle memory exhaustion themselves should treat
    /// these as unrecoverable.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, MemError::OutOfMemory { .. })
    }
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::OutOfMemory { requested } => {
                write!(f, "Out of memory: failed to allocate {requested} bytes")
            }
            MemError::InvalidArgument { what } => {
                write!(f, "Invalid argument: {what}")
            }
            MemError::InvalidAlignment { alignment } => {
                write!(
                    f,
                    "Invalid alignment: {alignment} is not a power of two"
                )
            }
            MemError::StaleHandle {
                handle_generation,
                current,
            } => {
                write!(
                    f,
                    "Stale region handle: generation {handle_generation}, region is at {current}"
                )
            }
        }
    }
}

impl std::error::Error for MemError {}

/// Result type for memory layer operations.
pub type Result<T> = std::result::Result<T, MemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            MemError::OutOfMemory { requested: 64 }.to_string(),
            "Out of memory: failed to allocate 64 bytes"
        );
        assert_eq!(
            MemError::InvalidAlignment { alignment: 3 }.to_string(),
            "Invalid alignment: 3 is not a power of two"
        );
        assert_eq!(
            MemError::StaleHandle {
                handle_generation: 1,
                current: 2
            }
            .to_string(),
            "Stale region handle: generation 1, region is at 2"
        );
    }

    #[test]
    fn test_only_oom_is_fatal() {
        assert!(MemError::OutOfMemory { requested: 1 }.is_fatal());
        assert!(!MemError::InvalidArgument { what: "capacity" }.is_fatal());
        assert!(
            !MemError::StaleHandle {
                handle_generation: 0,
                current: 1
            }
            .is_fatal()
        );
    }
}
