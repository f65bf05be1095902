#![forbid(unsafe_code)]
//! Error types for the shale block allocator.
//!
//! # Error Taxonomy
//!
//! `AllocError` is the single error type crossing the public allocator
//! boundary. Caller-input problems are validated at the facade and returned
//! as `Err`; internal invariant breaches are **not** represented here — they
//! panic by design (see below).
//!
//! | Variant | Meaning | Typical source |
//! |---------|---------|----------------|
//! | `Io` | opaque error from the disk-I/O collaborator | submit/complete loop |
//! | `InvalidBlockIndex` | index outside `[offset, offset + total)` | facade validation |
//! | `InvalidBlockRange` | zero count, end out of bounds, or arithmetic overflow | facade validation |
//! | `InvalidBlockState` | state above `num_block_states`, or FREE where a non-free state is required | facade validation |
//! | `NoSpace` | no contiguous free range fits the request | allocator |
//! | `DoubleFree` | freed range intersects a range already recorded free | free-space index |
//! | `Unsupported` | optional capability not implemented by this allocator | capability table defaults |
//! | `Config` | invalid configuration rejected at open time | registry/factory |
//!
//! ## Fatal-by-design conditions
//!
//! Dirty-queue overflow, in-flight-guard double insertion, and overlapping
//! free intervals indicate metadata corruption in flight. They panic rather
//! than return: letting them propagate as recoverable errors risks flushing
//! corrupt state to disk.
//!
//! ## Not errors
//!
//! "No submittable flush task right now" is ordinary flow control — the
//! scheduler returns `Option::None` and the caller polls again. It is never
//! surfaced through this type and never logged as an error.
//!
//! ## Design constraints
//!
//! - This crate depends on no other workspace crate (no cyclic deps).
//! - All payloads are owned values; no lifetimes cross the error boundary.

use thiserror::Error;

/// Unified error type for all allocator operations.
#[derive(Debug, Error)]
pub enum AllocError {
    /// Operating system I/O error surfaced from the external I/O collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Block index outside the configured logical range.
    #[error("invalid block index {index}: valid range is [{start}, {end})")]
    InvalidBlockIndex { index: u64, start: u64, end: u64 },

    /// Block range is empty, overflows, or runs past the logical range.
    #[error("invalid block range [{start}, {start}+{count}): {detail}")]
    InvalidBlockRange {
        start: u64,
        count: u64,
        detail: &'static str,
    },

    /// Block state outside `[0, num_block_states]`, or FREE passed where a
    /// non-free state is required.
    #[error("invalid block state {state} (max {max})")]
    InvalidBlockState { state: u64, max: u64 },

    /// No contiguous free range satisfies the request.
    ///
    /// Surfaced to the storage engine as an out-of-space condition; never
    /// retried inside the allocator.
    #[error("no space: no free range of {count} blocks")]
    NoSpace { count: u64 },

    /// The freed range intersects blocks already recorded as free.
    #[error("double free: range [{start}, {start}+{count}) intersects a free interval")]
    DoubleFree { start: u64, count: u64 },

    /// Optional capability not implemented by the selected allocator.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Configuration rejected at open time.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias using `AllocError`.
pub type Result<T> = std::result::Result<T, AllocError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = AllocError::InvalidBlockIndex {
            index: 99,
            start: 0,
            end: 64,
        };
        assert_eq!(err.to_string(), "invalid block index 99: valid range is [0, 64)");

        let err = AllocError::InvalidBlockRange {
            start: 10,
            count: 0,
            detail: "count must be non-zero",
        };
        assert_eq!(
            err.to_string(),
            "invalid block range [10, 10+0): count must be non-zero"
        );

        let err = AllocError::NoSpace { count: 400 };
        assert_eq!(err.to_string(), "no space: no free range of 400 blocks");

        let err = AllocError::DoubleFree { start: 5, count: 3 };
        assert_eq!(
            err.to_string(),
            "double free: range [5, 5+3) intersects a free interval"
        );

        let err = AllocError::Unsupported("print_stats");
        assert_eq!(err.to_string(), "unsupported operation: print_stats");
    }

    #[test]
    fn io_error_converts() {
        fn returns_io() -> Result<()> {
            Err(std::io::Error::other("boom"))?;
            Ok(())
        }
        assert!(matches!(returns_io(), Err(AllocError::Io(_))));
    }
}
