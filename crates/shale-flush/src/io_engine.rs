//! Pluggable I/O engine stub for the external disk-I/O collaborator.
//!
//! The allocator core never performs disk I/O itself — it only builds
//! [`FlushTask`](crate::FlushTask)s and expects the surrounding engine to
//! submit them and deliver exactly one completion per task. This module
//! provides the submission-side abstraction used by tests and harnesses:
//!
//! - **[`MemIoEngine`]**: in-memory buffer, for tests.
//! - **[`FileIoEngine`]**: `pread`/`pwrite` syscalls against a backing file.
//!
//! Engines accept a batch of [`IoOp`] requests and return [`IoCompletion`]
//! results in order, which models both synchronous backends and
//! submission/completion-queue backends.

use crate::FlushTask;
use std::path::Path;
use std::sync::Arc;

/// A single I/O operation in a batch.
#[derive(Debug)]
pub enum IoOp {
    /// Read `buf.len()` bytes from `offset` into the provided buffer.
    Read { offset: u64, buf: Vec<u8> },
    /// Write `data` at `offset`.
    Write { offset: u64, data: Vec<u8> },
    /// Sync to stable storage.
    Sync,
}

/// Result of a completed I/O operation.
#[derive(Debug)]
pub enum IoCompletion {
    /// Read completed: the filled buffer.
    Read(Vec<u8>),
    /// Write completed.
    Write,
    /// Sync completed.
    Sync,
    /// Operation failed.
    Error(std::io::Error),
}

/// I/O engine statistics.
#[derive(Debug, Clone, Default)]
pub struct IoEngineStats {
    pub reads: u64,
    pub writes: u64,
    pub syncs: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub batches: u64,
}

/// Batch I/O submission interface.
pub trait IoEngine: Send + Sync {
    /// Submit a batch and return completions in the same order.
    fn submit_batch(&self, ops: Vec<IoOp>) -> Vec<IoCompletion>;

    /// Engine name for diagnostics.
    fn name(&self) -> &'static str;

    /// Current statistics.
    fn stats(&self) -> IoEngineStats;
}

/// Convert a flush task into the write batch that persists it, placing
/// each op at its physical byte offset.
#[must_use]
pub fn task_write_batch(task: &FlushTask, drive_block_size: u64) -> Vec<IoOp> {
    task.ops()
        .iter()
        .map(|op| IoOp::Write {
            offset: op.range.lba.0 * drive_block_size,
            data: op.data.clone(),
        })
        .collect()
}

// ── In-memory engine ────────────────────────────────────────────────────────

/// In-memory I/O engine for tests: all I/O lands in one `Vec<u8>`.
pub struct MemIoEngine {
    data: parking_lot::Mutex<Vec<u8>>,
    stats: parking_lot::Mutex<IoEngineStats>,
}

impl MemIoEngine {
    /// Create an engine backed by `size` zeroed bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            data: parking_lot::Mutex::new(vec![0_u8; size]),
            stats: parking_lot::Mutex::new(IoEngineStats::default()),
        }
    }

    /// Snapshot the backing buffer.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl std::fmt::Debug for MemIoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemIoEngine")
            .field("size", &self.data.lock().len())
            .finish_non_exhaustive()
    }
}

impl IoEngine for MemIoEngine {
    #[expect(clippy::cast_possible_truncation)] // 64-bit offsets in memory engine
    fn submit_batch(&self, ops: Vec<IoOp>) -> Vec<IoCompletion> {
        let mut data = self.data.lock();
        self.stats.lock().batches += 1;

        ops.into_iter()
            .map(|op| match op {
                IoOp::Read { offset, mut buf } => {
                    let start = offset as usize;
                    let end = start + buf.len();
                    if end > data.len() {
                        return IoCompletion::Error(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "read past end of memory",
                        ));
                    }
                    buf.copy_from_slice(&data[start..end]);
                    let n = buf.len() as u64;
                    let mut stats = self.stats.lock();
                    stats.reads += 1;
                    stats.bytes_read += n;
                    drop(stats);
                    IoCompletion::Read(buf)
                }
                IoOp::Write { offset, data: payload } => {
                    let start = offset as usize;
                    let end = start + payload.len();
                    if end > data.len() {
                        return IoCompletion::Error(std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            "write past end of memory",
                        ));
                    }
                    data[start..end].copy_from_slice(&payload);
                    let mut stats = self.stats.lock();
                    stats.writes += 1;
                    stats.bytes_written += payload.len() as u64;
                    drop(stats);
                    IoCompletion::Write
                }
                IoOp::Sync => {
                    self.stats.lock().syncs += 1;
                    IoCompletion::Sync
                }
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn stats(&self) -> IoEngineStats {
        self.stats.lock().clone()
    }
}

// ── File-backed engine ──────────────────────────────────────────────────────

/// `pread`/`pwrite` engine over a backing file.
///
/// Each operation is a single syscall via `FileExt`; no shared seek
/// position, safe for concurrent submitters.
pub struct FileIoEngine {
    file: Arc<std::fs::File>,
    stats: parking_lot::Mutex<IoEngineStats>,
}

impl FileIoEngine {
    /// Open `path` read-write, falling back to read-only.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .or_else(|_| std::fs::OpenOptions::new().read(true).open(path))?;
        Ok(Self {
            file: Arc::new(file),
            stats: parking_lot::Mutex::new(IoEngineStats::default()),
        })
    }

    /// Wrap an already-open file.
    #[must_use]
    pub fn from_file(file: Arc<std::fs::File>) -> Self {
        Self {
            file,
            stats: parking_lot::Mutex::new(IoEngineStats::default()),
        }
    }
}

impl std::fmt::Debug for FileIoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIoEngine")
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

impl IoEngine for FileIoEngine {
    fn submit_batch(&self, ops: Vec<IoOp>) -> Vec<IoCompletion> {
        use std::os::unix::fs::FileExt;

        self.stats.lock().batches += 1;

        ops.into_iter()
            .map(|op| match op {
                IoOp::Read { offset, mut buf } => match self.file.read_exact_at(&mut buf, offset) {
                    Ok(()) => {
                        let n = buf.len() as u64;
                        let mut stats = self.stats.lock();
                        stats.reads += 1;
                        stats.bytes_read += n;
                        drop(stats);
                        IoCompletion::Read(buf)
                    }
                    Err(error) => IoCompletion::Error(error),
                },
                IoOp::Write { offset, data } => match self.file.write_all_at(&data, offset) {
                    Ok(()) => {
                        let mut stats = self.stats.lock();
                        stats.writes += 1;
                        stats.bytes_written += data.len() as u64;
                        drop(stats);
                        IoCompletion::Write
                    }
                    Err(error) => IoCompletion::Error(error),
                },
                IoOp::Sync => {
                    self.stats.lock().syncs += 1;
                    match self.file.sync_all() {
                        Ok(()) => IoCompletion::Sync,
                        Err(error) => IoCompletion::Error(error),
                    }
                }
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "pread/pwrite"
    }

    fn stats(&self) -> IoEngineStats {
        self.stats.lock().clone()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
