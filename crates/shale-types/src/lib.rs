#![forbid(unsafe_code)]
//! Typed identifiers and checked arithmetic for the block allocator.
//!
//! Block indices, drive LBAs, and block states are all `u64` on the wire;
//! these wrappers keep them from being mixed at compile time. Logical
//! allocator blocks and physical drive blocks in particular use different
//! units (`allocator_block_size` vs `disk_block_size`), so a bare `u64`
//! crossing that boundary is almost always a bug.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Logical block index in allocator-block units.
///
/// Valid indices live in `[logical_start_offset, logical_start_offset +
/// total_blocks)`; the facade validates this before any delegate sees one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u64);

/// Physical drive block address in disk-block units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DriveLba(pub u64);

/// Per-block allocation state.
///
/// `0` is FREE; values in `[1, num_block_states]` carry caller-defined
/// meaning (allocated, pinned, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockState(pub u64);

impl BlockState {
    /// The free state. Stamped with [`BlockState::is_free`] everywhere the
    /// distinction matters.
    pub const FREE: Self = Self(0);

    #[must_use]
    pub fn is_free(self) -> bool {
        self.0 == 0
    }
}

impl BlockIndex {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Subtract a block count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, count: u64) -> Option<Self> {
        self.0.checked_sub(count).map(Self)
    }
}

impl DriveLba {
    /// Add a drive-block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Byte offset of this LBA for a given drive block size.
    ///
    /// Returns `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self, drive_block_size: u64) -> Option<u64> {
        self.0.checked_mul(drive_block_size)
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DriveLba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Integer narrowing failed; `field` labels the value for diagnostics.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("integer conversion failed: {field}")]
pub struct ConversionError {
    pub field: &'static str,
}

/// Narrow a `u64` to `usize` with an explicit error path.
///
/// Infallible on 64-bit platforms; the `field` label is included in the
/// error for diagnostics on 32-bit.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ConversionError> {
    usize::try_from(value).map_err(|_| ConversionError { field })
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ConversionError> {
    u32::try_from(value).map_err(|_| ConversionError { field })
}

/// End of the half-open range `[start, start + count)`, or `None` on
/// overflow.
#[must_use]
pub fn checked_end(start: u64, count: u64) -> Option<u64> {
    start.checked_add(count)
}

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_state_free() {
        assert!(BlockState::FREE.is_free());
        assert!(BlockState(0).is_free());
        assert!(!BlockState(1).is_free());
        assert!(!BlockState(u64::MAX).is_free());
    }

    #[test]
    fn block_index_checked_ops() {
        assert_eq!(BlockIndex(10).checked_add(5), Some(BlockIndex(15)));
        assert_eq!(BlockIndex(u64::MAX).checked_add(1), None);
        assert_eq!(BlockIndex(10).checked_sub(3), Some(BlockIndex(7)));
        assert_eq!(BlockIndex(0).checked_sub(1), None);
    }

    #[test]
    fn drive_lba_byte_offset() {
        assert_eq!(DriveLba(0).to_byte_offset(4096), Some(0));
        assert_eq!(DriveLba(3).to_byte_offset(4096), Some(12288));
        assert_eq!(DriveLba(u64::MAX).to_byte_offset(4096), None);
    }

    #[test]
    fn checked_end_overflow() {
        assert_eq!(checked_end(10, 5), Some(15));
        assert_eq!(checked_end(u64::MAX, 1), None);
        assert_eq!(checked_end(u64::MAX - 4, 4), Some(u64::MAX));
    }

    #[test]
    fn align_helpers() {
        assert_eq!(align_down(4097, 4096), Some(4096));
        assert_eq!(align_down(4096, 4096), Some(4096));
        assert_eq!(align_up(4097, 4096), Some(8192));
        assert_eq!(align_up(0, 4096), Some(0));
        assert_eq!(align_up(u64::MAX, 4096), None);
        // Invalid alignments.
        assert_eq!(align_down(100, 0), None);
        assert_eq!(align_up(100, 3), None);
    }

    #[test]
    fn narrowing_errors_carry_field() {
        assert_eq!(u64_to_u32(42, "x"), Ok(42));
        let err = u64_to_u32(u64::MAX, "word_count").unwrap_err();
        assert_eq!(err.field, "word_count");
        assert_eq!(err.to_string(), "integer conversion failed: word_count");
    }

    #[test]
    fn display_formats() {
        assert_eq!(BlockIndex(7).to_string(), "7");
        assert_eq!(DriveLba(8192).to_string(), "8192");
        assert_eq!(BlockState(2).to_string(), "2");
    }
}
