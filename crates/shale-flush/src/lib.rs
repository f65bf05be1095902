#![forbid(unsafe_code)]
//! Metadata flush scheduling.
//!
//! The allocator mutates its packed bitmap in memory and records which
//! logical block ranges went stale. [`FlushScheduler`] turns those dirty
//! ranges into [`FlushTask`]s — batches of serialized, drive-block-aligned
//! writes — and hands them out one head-of-queue task at a time, under the
//! guarantee that **no two outstanding tasks touch overlapping or adjacent
//! physical ranges**.
//!
//! The flush cycle:
//!
//! 1. mutation paths call [`FlushScheduler::mark_dirty`];
//! 2. a background step calls [`FlushScheduler::drain_to_task`], which
//!    translates dirty logical ranges to physical drive ranges through the
//!    injected [`MetaLayout`], coalesces them, chunks them to the shard
//!    size, snapshots the bitmap bytes, and queues the task;
//! 3. the submit loop polls [`FlushScheduler::next_submittable`] — `None`
//!    means "head conflicts with an in-flight write, try again later"
//!    (normal flow control, not an error);
//! 4. when the external I/O completes, [`FlushScheduler::on_complete`]
//!    releases the guarded ranges. Exactly once per task.
//!
//! Ordering is strict FIFO: only the head of the pending queue is ever
//! examined, so a blocked head stalls younger tasks even when they would
//! not conflict. That trades parallelism for a queue whose oldest write
//! can never be starved.
//!
//! Dirty-queue overflow and guard double-insertion panic: both indicate
//! either a mis-sized configuration or a scheduler bug, and continuing
//! would let overlapping metadata writes race on disk.

pub mod io_engine;

use shale_ordmap::OrderedMap;
use shale_types::DriveLba;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// A contiguous physical drive-block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    pub lba: DriveLba,
    pub num_blocks: u64,
}

impl PhysRange {
    /// One past the last drive block.
    #[must_use]
    pub fn end(self) -> u64 {
        self.lba.0 + self.num_blocks
    }

    /// Whether two ranges overlap or touch.
    ///
    /// Adjacency counts as conflict for submission gating: translation
    /// rounds to drive blocks, so ranges sharing a boundary may share a
    /// drive block's worth of bitmap words.
    #[must_use]
    pub fn conflicts_with(self, other: PhysRange) -> bool {
        self.lba.0 <= other.end() && other.lba.0 <= self.end()
    }

    /// Whether two ranges share at least one drive block.
    #[must_use]
    pub fn overlaps(self, other: PhysRange) -> bool {
        self.lba.0 < other.end() && other.lba.0 < self.end()
    }
}

/// On-disk layout knowledge injected by the concrete allocator.
///
/// Only the bitmap implementation knows where its words live inside the
/// reserved metadata region, so translation and snapshotting are supplied
/// from there.
pub trait MetaLayout {
    /// Map a dirty logical block range to the physical drive range whose
    /// bitmap words cover it.
    fn translate(&self, lba: u64, num_blocks: u64) -> PhysRange;

    /// Snapshot the bitmap bytes backing `range`.
    ///
    /// Must return exactly `range.num_blocks * drive_block_size` bytes,
    /// zero-padded past the end of the bitmap.
    fn serialize(&self, range: PhysRange) -> Vec<u8>;
}

/// A single serialized metadata write.
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub range: PhysRange,
    pub data: Vec<u8>,
}

/// A batch of metadata writes handed to the I/O collaborator as a unit.
///
/// The task is the completion unit: every op must be durably written
/// before [`FlushScheduler::on_complete`] is called with the task.
#[derive(Debug, Clone)]
pub struct FlushTask {
    id: u64,
    ops: Vec<WriteOp>,
}

impl FlushTask {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Physical ranges of all ops.
    pub fn ranges(&self) -> impl Iterator<Item = PhysRange> + '_ {
        self.ops.iter().map(|op| op.range)
    }
}

/// Scheduler sizing and geometry.
#[derive(Debug, Clone, Copy)]
pub struct FlushConfig {
    /// Hard cap on queued dirty ranges between drains. Exceeding it is a
    /// fatal configuration error.
    pub max_dirty_segments: usize,
    /// Maximum contiguous bytes per metadata write op. Coalesced ranges
    /// larger than this are chunked within the same task.
    pub shard_size: u64,
    /// Drive block size in bytes.
    pub drive_block_size: u64,
}

impl FlushConfig {
    fn shard_blocks(&self) -> u64 {
        (self.shard_size / self.drive_block_size).max(1)
    }
}

/// Dirty-range queue, pending-task FIFO, and in-flight physical guard.
#[derive(Debug)]
pub struct FlushScheduler {
    config: FlushConfig,
    dirty: Vec<(u64, u64)>,
    pending: VecDeque<FlushTask>,
    /// In-flight guard: physical start LBA → block count. Entries exist
    /// only between submission and completion.
    in_flight: OrderedMap<u64, u64>,
    next_task_id: u64,
}

impl FlushScheduler {
    /// # Panics
    ///
    /// Panics if the configuration is degenerate (zero cap, zero or
    /// non-power-of-two drive block size).
    #[must_use]
    pub fn new(config: FlushConfig) -> Self {
        assert!(config.max_dirty_segments > 0, "max_dirty_segments must be > 0");
        assert!(
            config.drive_block_size > 0 && config.drive_block_size.is_power_of_two(),
            "drive_block_size must be a non-zero power of two"
        );
        Self {
            config,
            dirty: Vec::with_capacity(config.max_dirty_segments),
            pending: VecDeque::new(),
            in_flight: OrderedMap::new(),
            next_task_id: 0,
        }
    }

    #[must_use]
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Record that `[lba, lba + num_blocks)` was mutated since the last
    /// drain. Called once per mutating bitmap operation.
    ///
    /// # Panics
    ///
    /// Panics when the dirty queue is full: `max_dirty_segments` must be
    /// sized for the worst-case dirty ranges per flush interval, so
    /// overflow is a configuration error, not a runtime condition.
    pub fn mark_dirty(&mut self, lba: u64, num_blocks: u64) {
        assert!(num_blocks > 0, "dirty range must be non-empty");
        assert!(
            self.dirty.len() < self.config.max_dirty_segments,
            "dirty queue overflow: {} segments queued, cap {}",
            self.dirty.len(),
            self.config.max_dirty_segments
        );
        self.dirty.push((lba, num_blocks));
        trace!(target: "shale::flush", lba, num_blocks, queued = self.dirty.len(), "mark_dirty");
    }

    /// Translate and snapshot all queued dirty ranges into one pending
    /// [`FlushTask`], clearing the dirty queue.
    ///
    /// Physical ranges are coalesced (overlapping or adjacent translations
    /// merge) and then chunked to at most `shard_size` bytes per op, so a
    /// task's ranges are disjoint and each op is boundedly sized.
    ///
    /// Returns the task id, or `None` when nothing was dirty.
    pub fn drain_to_task(&mut self, layout: &dyn MetaLayout) -> Option<u64> {
        if self.dirty.is_empty() {
            return None;
        }

        let mut phys: Vec<PhysRange> = self
            .dirty
            .iter()
            .map(|&(lba, num_blocks)| layout.translate(lba, num_blocks))
            .collect();
        phys.sort_by_key(|range| range.lba);

        // Coalesce overlapping/adjacent translations so the in-flight
        // guard holds disjoint entries.
        let mut merged: Vec<PhysRange> = Vec::with_capacity(phys.len());
        for range in phys {
            match merged.last_mut() {
                Some(last) if range.lba.0 <= last.end() => {
                    last.num_blocks = last.num_blocks.max(range.end() - last.lba.0);
                }
                _ => merged.push(range),
            }
        }

        let shard_blocks = self.config.shard_blocks();
        let mut ops = Vec::new();
        for range in merged {
            let mut lba = range.lba.0;
            let mut remaining = range.num_blocks;
            while remaining > 0 {
                let chunk = remaining.min(shard_blocks);
                let piece = PhysRange {
                    lba: DriveLba(lba),
                    num_blocks: chunk,
                };
                ops.push(WriteOp {
                    range: piece,
                    data: layout.serialize(piece),
                });
                lba += chunk;
                remaining -= chunk;
            }
        }

        let id = self.next_task_id;
        self.next_task_id += 1;
        debug!(
            target: "shale::flush",
            task = id,
            dirty = self.dirty.len(),
            ops = ops.len(),
            "drain_to_task"
        );
        self.dirty.clear();
        self.pending.push_back(FlushTask { id, ops });
        Some(id)
    }

    /// Whether `range` conflicts with any guarded in-flight range.
    ///
    /// One floor probe catches overlap from below and immediate
    /// predecessors; one ceiling probe catches successors. Adjacency
    /// counts as conflict.
    fn guard_conflicts(&self, range: PhysRange) -> bool {
        if let Some((lba, &num_blocks)) = self.in_flight.floor(range.lba.0)
            && lba + num_blocks >= range.lba.0
        {
            return true;
        }
        if let Some((lba, _)) = self.in_flight.ceiling(range.lba.0)
            && lba <= range.end()
        {
            return true;
        }
        false
    }

    /// Pop and return the oldest pending task iff none of its physical
    /// ranges conflicts with an in-flight write.
    ///
    /// `None` means "not yet": either nothing is pending, or the head is
    /// blocked behind an in-flight range. Callers poll again after the
    /// next completion. Only the head is examined — strict FIFO.
    pub fn next_submittable(&mut self) -> Option<FlushTask> {
        let head = self.pending.front()?;
        for range in head.ranges() {
            if self.guard_conflicts(range) {
                trace!(
                    target: "shale::flush",
                    task = head.id,
                    lba = range.lba.0,
                    num_blocks = range.num_blocks,
                    "head blocked behind in-flight range"
                );
                return None;
            }
        }

        let task = self.pending.pop_front().expect("head exists");
        for range in task.ranges() {
            self.guard_insert(range);
        }
        debug!(
            target: "shale::flush",
            task = task.id,
            ops = task.ops.len(),
            in_flight = self.in_flight.len(),
            "submit"
        );
        Some(task)
    }

    /// Insert a range into the guard.
    ///
    /// # Panics
    ///
    /// Panics if the range overlaps an existing guard entry — possible
    /// only if a completion was skipped or doubled, or two overlapping
    /// tasks were handed out. Chunks of one task are adjacent, never
    /// overlapping, so exact-overlap is the invariant checked.
    fn guard_insert(&mut self, range: PhysRange) {
        if let Some((lba, &num_blocks)) = self.in_flight.floor(range.lba.0) {
            assert!(
                lba + num_blocks <= range.lba.0,
                "in-flight guard overlap: [{lba}, {}) vs [{}, {})",
                lba + num_blocks,
                range.lba.0,
                range.end()
            );
        }
        if let Some((lba, _)) = self.in_flight.ceiling(range.lba.0) {
            assert!(
                lba >= range.end(),
                "in-flight guard overlap: [{}, {}) vs existing at {lba}",
                range.lba.0,
                range.end()
            );
        }
        self.in_flight.insert(range.lba.0, range.num_blocks);
    }

    /// Release the guarded ranges of a completed task.
    ///
    /// Must be called exactly once per task returned by
    /// [`FlushScheduler::next_submittable`].
    ///
    /// # Panics
    ///
    /// Panics if any range is not guarded — the completion was already
    /// delivered, or the task never came from this scheduler.
    pub fn on_complete(&mut self, task: &FlushTask) {
        for range in task.ranges() {
            let removed = self.in_flight.remove(range.lba.0);
            assert_eq!(
                removed,
                Some(range.num_blocks),
                "completion for unguarded range [{}, {}) (task {} completed twice?)",
                range.lba.0,
                range.end(),
                task.id
            );
        }
        debug!(
            target: "shale::flush",
            task = task.id,
            in_flight = self.in_flight.len(),
            "complete"
        );
    }
}
