//! Bitmap-backed allocator implementation.
//!
//! [`BitmapAllocator`] wires the three core structures together: the
//! [`PackedBitmap`] records every block's state and is the on-disk format,
//! the [`FreeSpaceIndex`] answers hint-based placement without scanning,
//! and the [`FlushScheduler`] turns mutations into conflict-free metadata
//! writes.
//!
//! ## Metadata layout
//!
//! The bitmap words live in a reserved region starting `meta_start_lba`
//! drive blocks into the device. A dirty logical block range maps to the
//! word range covering its cells, widened to drive-block boundaries:
//!
//! ```text
//! logical blocks  [lba, lba+n)
//!   → cells       (1:1)
//!   → words       [first_cell/cells_per_word, last_cell/cells_per_word]
//!   → bytes       [word*8 …)
//!   → drive LBAs  meta_start + byte/disk_block_size, rounded outward
//! ```

use crate::config::AllocatorConfig;
use crate::{AllocatorOps, AllocatorStats};
use shale_bitmap::PackedBitmap;
use shale_error::{AllocError, Result};
use shale_extent::FreeSpaceIndex;
use shale_flush::{FlushConfig, FlushScheduler, FlushTask, MetaLayout, PhysRange};
use shale_types::{BlockIndex, BlockState, DriveLba, align_up};
use tracing::debug;

/// Where the bitmap words sit on the drive.
#[derive(Debug, Clone, Copy)]
struct MetaRegion {
    meta_start_lba: u64,
    drive_block_size: u64,
}

/// Borrowed view pairing the live bitmap with its on-disk placement;
/// implements the translation/snapshot injection for the scheduler.
struct BitmapLayoutView<'a> {
    bitmap: &'a PackedBitmap,
    region: MetaRegion,
}

impl MetaLayout for BitmapLayoutView<'_> {
    fn translate(&self, lba: u64, num_blocks: u64) -> PhysRange {
        debug_assert!(num_blocks > 0);
        let first_word = self.bitmap.word_of(lba);
        let last_word = self.bitmap.word_of(lba + num_blocks - 1);
        let byte_lo = first_word * 8;
        let byte_hi = (last_word + 1) * 8;
        let lba_lo = byte_lo / self.region.drive_block_size;
        let lba_hi = byte_hi.div_ceil(self.region.drive_block_size);
        PhysRange {
            lba: DriveLba(self.region.meta_start_lba + lba_lo),
            num_blocks: lba_hi - lba_lo,
        }
    }

    fn serialize(&self, range: PhysRange) -> Vec<u8> {
        let rel_byte = (range.lba.0 - self.region.meta_start_lba) * self.region.drive_block_size;
        let num_bytes = range.num_blocks * self.region.drive_block_size;
        let word_begin = rel_byte / 8;
        let want_words = num_bytes / 8;

        // The last drive block may extend past the final bitmap word;
        // pad the tail with zeros to keep the buffer block-aligned.
        let available = self.bitmap.total_words().saturating_sub(word_begin);
        let copy_words = want_words.min(available);
        let mut out = if copy_words > 0 {
            self.bitmap.serialize_range(word_begin, copy_words)
        } else {
            Vec::new()
        };
        out.resize(usize::try_from(num_bytes).expect("shard bytes fit usize"), 0);
        out
    }
}

/// Packed bitmap + free-space index + flush scheduler.
#[derive(Debug)]
pub struct BitmapAllocator {
    bitmap: PackedBitmap,
    index: FreeSpaceIndex,
    scheduler: FlushScheduler,
    region: MetaRegion,
}

impl BitmapAllocator {
    /// Build a fresh, fully-free context from `config`.
    pub fn new(config: &AllocatorConfig) -> Result<Self> {
        config.validate()?;
        let bits_per_cell = config.bits_per_cell();
        let offset = config.logical_start_block_offset;
        let bitmap = PackedBitmap::with_offset(config.total_blocks, bits_per_cell, offset);
        let index = FreeSpaceIndex::new(config.total_blocks, offset);
        let region = MetaRegion {
            meta_start_lba: config.meta_start_lba(),
            drive_block_size: u64::from(config.disk_block_size),
        };
        let scheduler = FlushScheduler::new(FlushConfig {
            max_dirty_segments: config.max_dirty_segments,
            shard_size: config.shard_size,
            drive_block_size: region.drive_block_size,
        });
        debug!(
            target: "shale::alloc",
            total_blocks = config.total_blocks,
            bits_per_cell,
            words = bitmap.total_words(),
            meta_start_lba = region.meta_start_lba,
            "bitmap allocator ready"
        );
        Ok(Self {
            bitmap,
            index,
            scheduler,
            region,
        })
    }

    /// Cell width chosen for this context.
    #[must_use]
    pub fn bits_per_cell(&self) -> u32 {
        self.bitmap.bits_per_cell()
    }

    fn stamp(&mut self, start: u64, count: u64, state: BlockState) {
        for block in start..start + count {
            self.bitmap.set(block, state.0);
        }
        self.scheduler.mark_dirty(start, count);
    }
}

impl AllocatorOps for BitmapAllocator {
    fn is_block_free(&self, index: BlockIndex) -> bool {
        self.bitmap.get(index.0) == 0
    }

    fn get_block_state(&self, index: BlockIndex) -> BlockState {
        BlockState(self.bitmap.get(index.0))
    }

    fn set_blocks_state(&mut self, index: BlockIndex, count: u64, state: BlockState) -> Result<()> {
        self.index.reserve(index.0, count);
        self.stamp(index.0, count, state);
        Ok(())
    }

    fn clear_blocks(&mut self, index: BlockIndex, count: u64) -> Result<()> {
        // Rejects double frees before anything is stamped.
        self.index.free(index.0, count)?;
        self.stamp(index.0, count, BlockState::FREE);
        Ok(())
    }

    fn alloc_blocks_contig(
        &mut self,
        state: BlockState,
        hint: BlockIndex,
        count: u64,
    ) -> Result<BlockIndex> {
        let start = self
            .index
            .allocate(hint.0, count)
            .ok_or(AllocError::NoSpace { count })?;
        self.stamp(start, count, state);
        Ok(BlockIndex(start))
    }

    fn print_stats(&self) -> Result<String> {
        let (total_blocks, free_blocks, allocated_blocks) = self.block_counts();
        let stats = AllocatorStats {
            total_blocks,
            free_blocks,
            allocated_blocks,
            dirty_segments: self.scheduler.dirty_len(),
            pending_tasks: self.scheduler.pending_len(),
            in_flight_ranges: self.scheduler.in_flight_len(),
        };
        serde_json::to_string_pretty(&stats).map_err(|error| {
            AllocError::Io(std::io::Error::other(error))
        })
    }

    fn physical_size(&self) -> u64 {
        align_up(self.bitmap.total_words() * 8, self.region.drive_block_size)
            .expect("metadata region size fits u64")
    }

    fn queue_sync_meta_io_tasks(&mut self) -> Option<u64> {
        let view = BitmapLayoutView {
            bitmap: &self.bitmap,
            region: self.region,
        };
        self.scheduler.drain_to_task(&view)
    }

    fn get_next_submit_meta_io_tasks(&mut self) -> Option<FlushTask> {
        self.scheduler.next_submittable()
    }

    fn complete_meta_sync(&mut self, task: &FlushTask) {
        self.scheduler.on_complete(task);
    }

    fn block_counts(&self) -> (u64, u64, u64) {
        (
            self.index.total_blocks(),
            self.index.free_blocks(),
            self.index.allocated_blocks(),
        )
    }
}
