//! Linear-scan reference allocator.
//!
//! [`RefAllocator`] implements the capability table with the simplest
//! correct strategy: the same packed bitmap storage as the production
//! allocator, but placement by scanning for an empty cell run instead of
//! consulting an interval index. It exists for testing — differential
//! checks against [`BitmapAllocator`](crate::BitmapAllocator) and as the
//! smallest implementation of the trait contract.
//!
//! It keeps no flush pipeline: nothing is persisted, `physical_size` is
//! zero, and the flush-cycle methods are inert.

use crate::AllocatorOps;
use crate::config::AllocatorConfig;
use shale_bitmap::PackedBitmap;
use shale_error::{AllocError, Result};
use shale_flush::FlushTask;
use shale_types::{BlockIndex, BlockState};

/// Reference allocator: packed bitmap storage, linear-scan placement.
#[derive(Debug)]
pub struct RefAllocator {
    bitmap: PackedBitmap,
    offset: u64,
    total_blocks: u64,
    free_blocks: u64,
}

impl RefAllocator {
    pub fn new(config: &AllocatorConfig) -> Result<Self> {
        config.validate()?;
        let offset = config.logical_start_block_offset;
        Ok(Self {
            bitmap: PackedBitmap::with_offset(
                config.total_blocks,
                config.bits_per_cell(),
                offset,
            ),
            offset,
            total_blocks: config.total_blocks,
            free_blocks: config.total_blocks,
        })
    }

    fn end(&self) -> u64 {
        self.offset + self.total_blocks
    }

    fn stamp(&mut self, start: u64, count: u64, state: BlockState) {
        for block in start..start + count {
            self.bitmap.set(block, state.0);
        }
    }
}

impl AllocatorOps for RefAllocator {
    fn is_block_free(&self, index: BlockIndex) -> bool {
        self.bitmap.get(index.0) == 0
    }

    fn get_block_state(&self, index: BlockIndex) -> BlockState {
        BlockState(self.bitmap.get(index.0))
    }

    fn set_blocks_state(&mut self, index: BlockIndex, count: u64, state: BlockState) -> Result<()> {
        let newly_taken = (index.0..index.0 + count)
            .filter(|&block| self.bitmap.get(block) == 0)
            .count() as u64;
        self.stamp(index.0, count, state);
        self.free_blocks -= newly_taken;
        Ok(())
    }

    fn clear_blocks(&mut self, index: BlockIndex, count: u64) -> Result<()> {
        for block in index.0..index.0 + count {
            if self.bitmap.get(block) == 0 {
                return Err(AllocError::DoubleFree {
                    start: index.0,
                    count,
                });
            }
        }
        self.stamp(index.0, count, BlockState::FREE);
        self.free_blocks += count;
        Ok(())
    }

    fn alloc_blocks_contig(
        &mut self,
        state: BlockState,
        hint: BlockIndex,
        count: u64,
    ) -> Result<BlockIndex> {
        if count > self.free_blocks {
            return Err(AllocError::NoSpace { count });
        }

        // The hint position first, then a full scan from the start.
        let fits_at = |bitmap: &PackedBitmap, start: u64| {
            start + count <= self.end() && bitmap.seek_empty_cell_range(start, count)
        };
        let mut placed = None;
        if fits_at(&self.bitmap, hint.0) {
            placed = Some(hint.0);
        } else {
            let mut start = self.offset;
            while start + count <= self.end() {
                if fits_at(&self.bitmap, start) {
                    placed = Some(start);
                    break;
                }
                start += 1;
            }
        }

        let start = placed.ok_or(AllocError::NoSpace { count })?;
        self.stamp(start, count, state);
        self.free_blocks -= count;
        Ok(BlockIndex(start))
    }

    fn physical_size(&self) -> u64 {
        0
    }

    fn queue_sync_meta_io_tasks(&mut self) -> Option<u64> {
        None
    }

    fn get_next_submit_meta_io_tasks(&mut self) -> Option<FlushTask> {
        None
    }

    fn complete_meta_sync(&mut self, _task: &FlushTask) {
        // No flush pipeline, nothing to release.
    }

    fn block_counts(&self) -> (u64, u64, u64) {
        (
            self.total_blocks,
            self.free_blocks,
            self.total_blocks - self.free_blocks,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AllocatorKind, DeviceSpec, default_config};

    fn allocator(total_blocks: u64) -> RefAllocator {
        let mut config = default_config(&DeviceSpec {
            total_blocks,
            disk_block_size: 4096,
        });
        config.kind = AllocatorKind::Reference;
        RefAllocator::new(&config).unwrap()
    }

    #[test]
    fn hint_honored_when_free() {
        let mut alloc = allocator(1000);
        let start = alloc
            .alloc_blocks_contig(BlockState(1), BlockIndex(500), 10)
            .unwrap();
        assert_eq!(start, BlockIndex(500));
        assert_eq!(alloc.block_counts(), (1000, 990, 10));
    }

    #[test]
    fn scan_falls_back_from_occupied_hint() {
        let mut alloc = allocator(100);
        alloc
            .set_blocks_state(BlockIndex(40), 60, BlockState(1))
            .unwrap();
        let start = alloc
            .alloc_blocks_contig(BlockState(1), BlockIndex(50), 10)
            .unwrap();
        assert_eq!(start, BlockIndex(0));
    }

    #[test]
    fn no_space_when_fragmented() {
        let mut alloc = allocator(100);
        // Occupy every other 10-block stripe: largest free run is 10.
        for start in (0..100).step_by(20) {
            alloc
                .set_blocks_state(BlockIndex(start + 10), 10, BlockState(1))
                .unwrap();
        }
        assert!(matches!(
            alloc.alloc_blocks_contig(BlockState(1), BlockIndex(0), 11),
            Err(AllocError::NoSpace { count: 11 })
        ));
        let start = alloc
            .alloc_blocks_contig(BlockState(1), BlockIndex(0), 10)
            .unwrap();
        assert_eq!(start, BlockIndex(0));
    }

    #[test]
    fn clear_detects_double_free() {
        let mut alloc = allocator(100);
        alloc
            .alloc_blocks_contig(BlockState(1), BlockIndex(0), 10)
            .unwrap();
        alloc.clear_blocks(BlockIndex(0), 10).unwrap();
        assert!(matches!(
            alloc.clear_blocks(BlockIndex(0), 10),
            Err(AllocError::DoubleFree { .. })
        ));
        assert_eq!(alloc.block_counts(), (100, 100, 0));
    }

    #[test]
    fn default_check_blocks_state_counts_contiguous_run() {
        let mut alloc = allocator(100);
        alloc
            .set_blocks_state(BlockIndex(10), 5, BlockState(1))
            .unwrap();
        assert_eq!(
            alloc
                .check_blocks_state(BlockIndex(10), 10, BlockState(1))
                .unwrap(),
            5
        );
        assert_eq!(
            alloc
                .check_blocks_state(BlockIndex(9), 10, BlockState(1))
                .unwrap(),
            0
        );
        assert_eq!(
            alloc
                .check_blocks_state(BlockIndex(0), 10, BlockState::FREE)
                .unwrap(),
            10
        );
    }

    #[test]
    fn logical_offset_respected() {
        let mut config = default_config(&DeviceSpec {
            total_blocks: 100,
            disk_block_size: 4096,
        });
        config.kind = AllocatorKind::Reference;
        config.logical_start_block_offset = 5000;
        let mut alloc = RefAllocator::new(&config).unwrap();

        let start = alloc
            .alloc_blocks_contig(BlockState(1), BlockIndex(5050), 10)
            .unwrap();
        assert_eq!(start, BlockIndex(5050));
        // A hint too close to the end falls back to the scan.
        let start = alloc
            .alloc_blocks_contig(BlockState(1), BlockIndex(5095), 20)
            .unwrap();
        assert_eq!(start, BlockIndex(5000));
    }

    #[test]
    fn flush_surface_is_inert() {
        let mut alloc = allocator(100);
        alloc
            .alloc_blocks_contig(BlockState(1), BlockIndex(0), 10)
            .unwrap();
        assert_eq!(alloc.physical_size(), 0);
        assert!(alloc.queue_sync_meta_io_tasks().is_none());
        assert!(alloc.get_next_submit_meta_io_tasks().is_none());
    }
}
