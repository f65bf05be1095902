#![forbid(unsafe_code)]
//! Block allocator facade and capability table.
//!
//! ## Layering
//!
//! 1. **[`AllocatorOps`]** — the capability table a concrete allocator
//!    implements. `check_blocks_state` and `print_stats` are optional
//!    (default bodies: per-block iteration, `Unsupported`).
//! 2. **[`AllocatorRegistry`]** — explicit factory map from
//!    [`AllocatorKind`] to constructor, populated at process start and
//!    injected into [`BlockAllocator::open`]. No ambient globals, no
//!    load-time registration side effects.
//! 3. **[`BlockAllocator`]** — the validating facade. Every public call
//!    checks index/range/state bounds and returns `Err` on caller
//!    mistakes; delegates only see validated input.
//!
//! Two implementations ship: [`BitmapAllocator`] (packed bitmap +
//! free-interval index + flush scheduler) and [`RefAllocator`] (linear
//! scan, for testing and differential checks).
//!
//! ## Flush cycle
//!
//! ```text
//! set/clear/alloc        → bitmap stamped, range marked dirty
//! queue_sync_meta_io_tasks  → dirty ranges drained into a FlushTask
//! get_next_submit_meta_io_tasks → Some(task) when the head task's
//!                             physical ranges are clear of in-flight
//!                             writes; None = poll again later
//! complete_meta_sync     → releases the task's guarded ranges
//! ```

mod bitmap_alloc;
mod config;
mod ref_alloc;

pub use bitmap_alloc::BitmapAllocator;
pub use config::{AllocatorConfig, AllocatorKind, DeviceSpec, default_config};
pub use ref_alloc::RefAllocator;

use serde::Serialize;
use shale_error::{AllocError, Result};
use shale_flush::FlushTask;
use shale_types::{BlockIndex, BlockState};
use std::collections::BTreeMap;
use tracing::debug;

/// Capability table implemented by each concrete allocator.
///
/// All block parameters arrive pre-validated by the [`BlockAllocator`]
/// facade: indices and ranges are in bounds, counts are non-zero, states
/// are within `[0, num_block_states]`.
pub trait AllocatorOps: Send {
    /// Whether the block is FREE.
    fn is_block_free(&self, index: BlockIndex) -> bool;

    /// Current state of the block.
    fn get_block_state(&self, index: BlockIndex) -> BlockState;

    /// Count how many blocks from `index` hold `expected` contiguously,
    /// stopping at the first mismatch.
    ///
    /// Default: per-block iteration via [`AllocatorOps::get_block_state`].
    fn check_blocks_state(
        &self,
        index: BlockIndex,
        count: u64,
        expected: BlockState,
    ) -> Result<u64> {
        let mut matched = 0_u64;
        for block in index.0..index.0 + count {
            if self.get_block_state(BlockIndex(block)) != expected {
                break;
            }
            matched += 1;
        }
        Ok(matched)
    }

    /// Stamp `[index, index + count)` with the non-free `state`.
    ///
    /// Blocks already allocated change state in place; free blocks leave
    /// the free set.
    fn set_blocks_state(&mut self, index: BlockIndex, count: u64, state: BlockState) -> Result<()>;

    /// Return `[index, index + count)` to FREE.
    fn clear_blocks(&mut self, index: BlockIndex, count: u64) -> Result<()>;

    /// Reserve `count` contiguous blocks near `hint` and stamp them with
    /// `state`, returning the placed start.
    fn alloc_blocks_contig(
        &mut self,
        state: BlockState,
        hint: BlockIndex,
        count: u64,
    ) -> Result<BlockIndex>;

    /// Human-readable statistics. Default: unsupported.
    fn print_stats(&self) -> Result<String> {
        Err(AllocError::Unsupported("print_stats"))
    }

    /// Size in bytes of the on-disk metadata region, drive-block aligned.
    fn physical_size(&self) -> u64;

    /// Drain accumulated dirty ranges into a pending flush task.
    ///
    /// Returns the new task's id, or `None` when nothing was dirty.
    fn queue_sync_meta_io_tasks(&mut self) -> Option<u64>;

    /// Hand out the oldest flush task whose physical ranges are clear of
    /// in-flight writes. `None` means "not yet" — poll again after the
    /// next completion.
    fn get_next_submit_meta_io_tasks(&mut self) -> Option<FlushTask>;

    /// Release the guarded ranges of a completed task. Exactly once per
    /// task handed out.
    fn complete_meta_sync(&mut self, task: &FlushTask);

    /// O(1) block counters: (total, free, allocated).
    fn block_counts(&self) -> (u64, u64, u64);
}

/// Constructor signature registered per [`AllocatorKind`].
pub type AllocatorFactory = fn(&AllocatorConfig) -> Result<Box<dyn AllocatorOps>>;

/// Explicit allocator-implementation registry.
///
/// Built once at process start and injected wherever a context is opened;
/// replaces constructor-attribute self-registration with plain data.
#[derive(Debug, Default)]
pub struct AllocatorRegistry {
    factories: BTreeMap<AllocatorKind, AllocatorFactory>,
}

impl AllocatorRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with both built-in implementations.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(AllocatorKind::Bitmap, |config| {
            Ok(Box::new(BitmapAllocator::new(config)?))
        });
        registry.register(AllocatorKind::Reference, |config| {
            Ok(Box::new(RefAllocator::new(config)?))
        });
        registry
    }

    /// Register (or replace) the factory for `kind`.
    pub fn register(&mut self, kind: AllocatorKind, factory: AllocatorFactory) {
        self.factories.insert(kind, factory);
    }

    /// Instantiate the allocator selected by `config.kind`.
    ///
    /// # Errors
    ///
    /// `Config` if no factory is registered for the kind, plus whatever
    /// the factory itself rejects.
    pub fn create(&self, config: &AllocatorConfig) -> Result<Box<dyn AllocatorOps>> {
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            AllocError::Config(format!("no allocator registered for {:?}", config.kind))
        })?;
        factory(config)
    }
}

/// Counters and queue depths for one allocator context.
#[derive(Debug, Clone, Serialize)]
pub struct AllocatorStats {
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub allocated_blocks: u64,
    pub dirty_segments: usize,
    pub pending_tasks: usize,
    pub in_flight_ranges: usize,
}

/// Validating facade over one allocator context.
///
/// Owns the concrete allocator for the lifetime of the context; dropping
/// the facade tears the whole context down.
pub struct BlockAllocator {
    offset: u64,
    total_blocks: u64,
    num_block_states: u64,
    inner: Box<dyn AllocatorOps>,
}

impl std::fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("offset", &self.offset)
            .field("total_blocks", &self.total_blocks)
            .field("num_block_states", &self.num_block_states)
            .finish_non_exhaustive()
    }
}

impl BlockAllocator {
    /// Open an allocator context: validate `config`, then build the
    /// implementation `config.kind` selects through `registry`.
    pub fn open(registry: &AllocatorRegistry, config: &AllocatorConfig) -> Result<Self> {
        config.validate()?;
        let inner = registry.create(config)?;
        debug!(
            target: "shale::alloc",
            kind = ?config.kind,
            total_blocks = config.total_blocks,
            offset = config.logical_start_block_offset,
            num_block_states = config.num_block_states,
            "open allocator context"
        );
        Ok(Self {
            offset: config.logical_start_block_offset,
            total_blocks: config.total_blocks,
            num_block_states: config.num_block_states,
            inner,
        })
    }

    fn end(&self) -> u64 {
        self.offset + self.total_blocks
    }

    fn check_index(&self, index: BlockIndex) -> Result<()> {
        if index.0 < self.offset || index.0 >= self.end() {
            return Err(AllocError::InvalidBlockIndex {
                index: index.0,
                start: self.offset,
                end: self.end(),
            });
        }
        Ok(())
    }

    fn check_range(&self, index: BlockIndex, count: u64) -> Result<()> {
        self.check_index(index)?;
        if count == 0 {
            return Err(AllocError::InvalidBlockRange {
                start: index.0,
                count,
                detail: "count must be non-zero",
            });
        }
        let end = index.0.checked_add(count).ok_or(AllocError::InvalidBlockRange {
            start: index.0,
            count,
            detail: "range end overflows",
        })?;
        if end > self.end() {
            return Err(AllocError::InvalidBlockRange {
                start: index.0,
                count,
                detail: "range runs past the last block",
            });
        }
        Ok(())
    }

    fn check_state(&self, state: BlockState) -> Result<()> {
        if state.0 > self.num_block_states {
            return Err(AllocError::InvalidBlockState {
                state: state.0,
                max: self.num_block_states,
            });
        }
        Ok(())
    }

    /// Whether `index` is FREE.
    pub fn is_block_free(&self, index: BlockIndex) -> Result<bool> {
        self.check_index(index)?;
        Ok(self.inner.is_block_free(index))
    }

    /// Current state of `index`.
    pub fn get_block_state(&self, index: BlockIndex) -> Result<BlockState> {
        self.check_index(index)?;
        Ok(self.inner.get_block_state(index))
    }

    /// Count of blocks from `index` contiguously holding `expected`
    /// (0 if `index` itself mismatches).
    pub fn check_blocks_state(
        &self,
        index: BlockIndex,
        count: u64,
        expected: BlockState,
    ) -> Result<u64> {
        self.check_range(index, count)?;
        self.check_state(expected)?;
        self.inner.check_blocks_state(index, count, expected)
    }

    /// Stamp `[index, index + count)` with a non-free `state`.
    ///
    /// # Errors
    ///
    /// `InvalidBlockState` for `state == FREE` (use
    /// [`BlockAllocator::clear_blocks`]) or a state above the maximum;
    /// range errors as usual.
    pub fn set_blocks_state(
        &mut self,
        index: BlockIndex,
        count: u64,
        state: BlockState,
    ) -> Result<()> {
        self.check_range(index, count)?;
        self.check_state(state)?;
        if state.is_free() {
            return Err(AllocError::InvalidBlockState {
                state: state.0,
                max: self.num_block_states,
            });
        }
        self.inner.set_blocks_state(index, count, state)
    }

    /// Return `[index, index + count)` to FREE.
    pub fn clear_blocks(&mut self, index: BlockIndex, count: u64) -> Result<()> {
        self.check_range(index, count)?;
        self.inner.clear_blocks(index, count)
    }

    /// Reserve `count` contiguous blocks near `hint`, stamped with
    /// `state`.
    ///
    /// With `want_output` the placed start is returned (`Ok(Some(start))`,
    /// possibly relocated away from `hint`). Without it the caller never
    /// learns the placement, so the call only succeeds when the request
    /// fits **exactly at `hint`** — any relocation is rolled back and
    /// reported as `NoSpace`.
    pub fn alloc_blocks_contig(
        &mut self,
        state: BlockState,
        hint: BlockIndex,
        count: u64,
        want_output: bool,
    ) -> Result<Option<BlockIndex>> {
        self.check_index(hint)?;
        self.check_state(state)?;
        if state.is_free() {
            return Err(AllocError::InvalidBlockState {
                state: state.0,
                max: self.num_block_states,
            });
        }
        if count == 0 || count > self.total_blocks {
            return Err(AllocError::InvalidBlockRange {
                start: hint.0,
                count,
                detail: "count must be in [1, total_blocks]",
            });
        }

        let start = self.inner.alloc_blocks_contig(state, hint, count)?;
        if want_output {
            return Ok(Some(start));
        }
        if start == hint {
            return Ok(None);
        }
        // The caller opted out of learning the placement, so a relocated
        // reservation is useless to it: roll back and report no-space.
        self.inner.clear_blocks(start, count)?;
        Err(AllocError::NoSpace { count })
    }

    /// Statistics rendered by the implementation, when supported.
    pub fn print_stats(&self) -> Result<String> {
        self.inner.print_stats()
    }

    /// Size in bytes of the on-disk metadata region.
    #[must_use]
    pub fn physical_size(&self) -> u64 {
        self.inner.physical_size()
    }

    /// Drain dirty metadata ranges into a pending flush task.
    pub fn queue_sync_meta_io_tasks(&mut self) -> Option<u64> {
        self.inner.queue_sync_meta_io_tasks()
    }

    /// Next flush task safe to submit, if any.
    pub fn get_next_submit_meta_io_tasks(&mut self) -> Option<FlushTask> {
        self.inner.get_next_submit_meta_io_tasks()
    }

    /// Deliver the completion for a previously handed-out task.
    pub fn complete_meta_sync(&mut self, task: &FlushTask) {
        self.inner.complete_meta_sync(task);
    }

    /// O(1) context counters.
    #[must_use]
    pub fn block_counts(&self) -> (u64, u64, u64) {
        self.inner.block_counts()
    }
}
