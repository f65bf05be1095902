//! Allocator configuration.
//!
//! [`default_config`] produces the stock layout for a device: 4 KiB
//! allocator blocks over 4 KiB drive blocks, an 8192-block reserved
//! superblock region with the bitmap metadata region directly behind it,
//! and 128 KiB metadata-write shards.

use serde::{Deserialize, Serialize};
use shale_error::{AllocError, Result};

/// Which registered allocator implementation to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorKind {
    /// Packed bitmap + free-space interval index + flush scheduler.
    Bitmap,
    /// Linear-scan reference implementation for testing.
    Reference,
}

/// Device geometry the configuration is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Device capacity in allocator blocks.
    pub total_blocks: u64,
    /// Drive block size in bytes.
    pub disk_block_size: u32,
}

/// Full allocator-context configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    pub kind: AllocatorKind,
    /// Number of allocator blocks tracked.
    pub total_blocks: u64,
    /// Highest caller-defined state value; valid states are
    /// `[0, num_block_states]` with 0 = FREE.
    pub num_block_states: u64,
    /// Allocator block size in bytes.
    pub allocator_block_size: u32,
    /// Max contiguous bytes per metadata write op.
    pub shard_size: u64,
    /// First valid logical block index.
    pub logical_start_block_offset: u64,
    /// Drive block size in bytes.
    pub disk_block_size: u32,
    /// Drive blocks reserved for superblocks ahead of the bitmap
    /// metadata region.
    pub num_super_blocks: u64,
    /// Reserved data-region start, -1 when unused.
    pub reserved_data_blocks_start_index: i64,
    /// Reserved data-region length in blocks.
    pub reserved_data_blocks: u64,
    /// Hard cap on dirty ranges queued between flush drains.
    pub max_dirty_segments: usize,
}

/// Stock configuration for `device`.
#[must_use]
pub fn default_config(device: &DeviceSpec) -> AllocatorConfig {
    AllocatorConfig {
        kind: AllocatorKind::Bitmap,
        total_blocks: device.total_blocks,
        num_block_states: 1,
        allocator_block_size: 4096,
        shard_size: 131_072,
        logical_start_block_offset: 0,
        disk_block_size: device.disk_block_size,
        num_super_blocks: 8192,
        reserved_data_blocks_start_index: -1,
        reserved_data_blocks: 0,
        max_dirty_segments: 4096,
    }
}

impl AllocatorConfig {
    /// Reject degenerate configurations before any structure is built.
    ///
    /// # Errors
    ///
    /// `Config` with a description of the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.total_blocks == 0 {
            return Err(AllocError::Config("total_blocks must be > 0".into()));
        }
        if self.num_block_states == 0 {
            return Err(AllocError::Config(
                "num_block_states must be > 0 (state 0 is FREE)".into(),
            ));
        }
        for (field, value) in [
            ("allocator_block_size", self.allocator_block_size),
            ("disk_block_size", self.disk_block_size),
        ] {
            if value < 512 || !value.is_power_of_two() {
                return Err(AllocError::Config(format!(
                    "{field} must be a power of two >= 512, got {value}"
                )));
            }
        }
        if self.shard_size < u64::from(self.disk_block_size) {
            return Err(AllocError::Config(format!(
                "shard_size {} below disk_block_size {}",
                self.shard_size, self.disk_block_size
            )));
        }
        if self.max_dirty_segments == 0 {
            return Err(AllocError::Config("max_dirty_segments must be > 0".into()));
        }
        if self
            .logical_start_block_offset
            .checked_add(self.total_blocks)
            .is_none()
        {
            return Err(AllocError::Config(
                "logical_start_block_offset + total_blocks overflows".into(),
            ));
        }
        Ok(())
    }

    /// Smallest supported cell width able to hold every state value:
    /// the least power-of-two width with `2^width > num_block_states`.
    #[must_use]
    pub fn bits_per_cell(&self) -> u32 {
        let needed = 64 - self.num_block_states.leading_zeros();
        needed.next_power_of_two()
    }

    /// First drive block of the bitmap metadata region, directly behind
    /// the reserved superblocks.
    #[must_use]
    pub fn meta_start_lba(&self) -> u64 {
        self.num_super_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceSpec {
        DeviceSpec {
            total_blocks: 65536,
            disk_block_size: 4096,
        }
    }

    #[test]
    fn defaults_match_stock_layout() {
        let config = default_config(&device());
        assert_eq!(config.kind, AllocatorKind::Bitmap);
        assert_eq!(config.allocator_block_size, 4096);
        assert_eq!(config.shard_size, 131_072);
        assert_eq!(config.logical_start_block_offset, 0);
        assert_eq!(config.disk_block_size, 4096);
        assert_eq!(config.num_super_blocks, 8192);
        assert_eq!(config.reserved_data_blocks_start_index, -1);
        assert_eq!(config.reserved_data_blocks, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bits_per_cell_widths() {
        let mut config = default_config(&device());
        let expectations = [
            (1_u64, 1_u32),
            (2, 2),
            (3, 2),
            (4, 4),
            (15, 4),
            (16, 8),
            (255, 8),
            (256, 16),
            (u64::from(u32::MAX), 32),
            (u64::MAX, 64),
        ];
        for (states, width) in expectations {
            config.num_block_states = states;
            assert_eq!(
                config.bits_per_cell(),
                width,
                "num_block_states = {states}"
            );
        }
    }

    #[test]
    fn validate_rejects_degenerate_fields() {
        let base = default_config(&device());

        let mut config = base.clone();
        config.total_blocks = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.num_block_states = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.disk_block_size = 100;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.shard_size = 512;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.max_dirty_segments = 0;
        assert!(config.validate().is_err());

        let mut config = base;
        config.logical_start_block_offset = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_serde_round_trip() {
        let config = default_config(&device());
        let json = serde_json::to_string(&config).unwrap();
        let back: AllocatorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        assert!(json.contains("\"kind\":\"bitmap\""));
    }
}
