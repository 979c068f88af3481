//! Fixed-size chunk pool with per-subsystem quotas.
//!
//! Every buffer in the pipeline (reader ring slots, the parser LWN heap,
//! per-transaction lists, builder output nodes) is a chunk from this pool.
//! Exhaustion is back-pressure, not an error: callers block on their
//! subsystem's condition until another stage releases. A wait that exceeds
//! the sanity timeout surfaces as a runtime error carrying the live
//! counters, which is how a cross-stage allocation deadlock is reported.

use crate::context::Ctx;
use crate::error::{RedoError, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sanity timeout for quota waits; a wait this long means the pipeline is
/// wedged and the allocator reports a deadlock instead of sleeping forever.
pub const QUOTA_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Subsystems with independent chunk quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Reader,
    Parser,
    Transactions,
    Builder,
    Writer,
}

impl MemoryKind {
    pub const COUNT: usize = 5;

    fn index(self) -> usize {
        match self {
            MemoryKind::Reader => 0,
            MemoryKind::Parser => 1,
            MemoryKind::Transactions => 2,
            MemoryKind::Builder => 3,
            MemoryKind::Writer => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MemoryKind::Reader => "reader",
            MemoryKind::Parser => "parser",
            MemoryKind::Transactions => "transactions",
            MemoryKind::Builder => "builder",
            MemoryKind::Writer => "writer",
        }
    }
}

/// One fixed-size byte buffer. Ownership is exclusive: exactly one subsystem
/// holds a chunk at any moment and handoff goes through the pool.
pub struct Chunk {
    data: Box<[u8]>,
    /// Bytes in use; meaning is owner-defined (the reader tracks positions
    /// externally, transaction chunks embed their own header).
    pub len: usize,
}

impl Chunk {
    fn new(size: usize) -> Self {
        Chunk { data: vec![0u8; size].into_boxed_slice(), len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("capacity", &self.data.len())
            .field("len", &self.len)
            .finish()
    }
}

/// Live allocation counters, also the payload of the deadlock diagnostic.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub acquires: AtomicU64,
    pub releases: AtomicU64,
    pub quota_waits: AtomicU64,
    pub allocated_total: AtomicUsize,
}

/// The pool: one chunk size, per-subsystem caps, a recycled free list.
pub struct ChunkPool {
    chunk_size: usize,
    caps: [usize; MemoryKind::COUNT],
    used: [AtomicUsize; MemoryKind::COUNT],
    free: (Sender<Chunk>, Receiver<Chunk>),
    quota_mtx: Mutex<()>,
    quota_conds: [Arc<Condvar>; MemoryKind::COUNT],
    stats: PoolStats,
}

impl ChunkPool {
    pub fn new(chunk_size: usize, caps: [usize; MemoryKind::COUNT]) -> Arc<Self> {
        let total: usize = caps.iter().sum();
        let free = bounded(total.max(1));
        Arc::new(ChunkPool {
            chunk_size,
            caps,
            used: Default::default(),
            free,
            quota_mtx: Mutex::new(()),
            quota_conds: std::array::from_fn(|_| Arc::new(Condvar::new())),
            stats: PoolStats::default(),
        })
    }

    /// Register the quota condvars with the context so a shutdown unblocks
    /// every stage stuck on memory.
    pub fn register_wakers(&self, ctx: &Ctx) {
        for cond in &self.quota_conds {
            ctx.register_waker(cond.clone());
        }
    }

    pub fn from_config(cfg: &crate::config::MemoryConfig) -> Arc<Self> {
        ChunkPool::new(
            cfg.chunk_size(),
            [
                cfg.reader_chunks,
                cfg.parser_chunks,
                cfg.transaction_chunks,
                cfg.builder_chunks,
                cfg.writer_chunks,
            ],
        )
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn cap(&self, kind: MemoryKind) -> usize {
        self.caps[kind.index()]
    }

    pub fn used(&self, kind: MemoryKind) -> usize {
        self.used[kind.index()].load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Non-blocking acquire. `None` means the subsystem's quota is exhausted
    /// and the caller should wait for a release.
    pub fn acquire(&self, kind: MemoryKind) -> Option<Chunk> {
        let idx = kind.index();
        let cap = self.caps[idx];
        // Reserve a quota slot first, then find a buffer.
        let reserved = self.used[idx]
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                if used < cap {
                    Some(used + 1)
                } else {
                    None
                }
            })
            .is_ok();
        if !reserved {
            return None;
        }

        self.stats.acquires.fetch_add(1, Ordering::Relaxed);
        let mut chunk = match self.free.1.try_recv() {
            Ok(chunk) => chunk,
            Err(_) => {
                self.stats.allocated_total.fetch_add(1, Ordering::Relaxed);
                Chunk::new(self.chunk_size)
            }
        };
        chunk.len = 0;
        Some(chunk)
    }

    /// Blocking acquire with the deadlock sanity timeout. Returns a runtime
    /// error when the process is shutting down or the wait times out.
    pub fn acquire_wait(&self, kind: MemoryKind, ctx: &Ctx) -> Result<Chunk> {
        loop {
            if ctx.hard_shutdown() {
                return Err(RedoError::runtime(50003, "shutdown while waiting for memory"));
            }
            if let Some(chunk) = self.acquire(kind) {
                return Ok(chunk);
            }

            self.stats.quota_waits.fetch_add(1, Ordering::Relaxed);
            let mut guard = self.quota_mtx.lock();
            // Re-check under the lock so a release between the failed acquire
            // and the wait is not lost.
            if let Some(chunk) = self.acquire(kind) {
                return Ok(chunk);
            }
            let timed_out = self.quota_conds[kind.index()]
                .wait_for(&mut guard, QUOTA_WAIT_TIMEOUT)
                .timed_out();
            drop(guard);

            if timed_out && !ctx.hard_shutdown() {
                return Err(RedoError::runtime(
                    50004,
                    format!(
                        "memory deadlock suspected: no {} chunk freed within {:?} \
                         (used: reader={} parser={} transactions={} builder={} writer={})",
                        kind.name(),
                        QUOTA_WAIT_TIMEOUT,
                        self.used(MemoryKind::Reader),
                        self.used(MemoryKind::Parser),
                        self.used(MemoryKind::Transactions),
                        self.used(MemoryKind::Builder),
                        self.used(MemoryKind::Writer),
                    ),
                ));
            }
        }
    }

    /// Return a chunk and wake waiters of that subsystem.
    pub fn release(&self, kind: MemoryKind, chunk: Chunk) {
        debug_assert_eq!(chunk.capacity(), self.chunk_size);
        self.stats.releases.fetch_add(1, Ordering::Relaxed);
        match self.free.0.try_send(chunk) {
            Ok(()) => {}
            // Free list full: drop the buffer, the quota slot still opens.
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
        self.used[kind.index()].fetch_sub(1, Ordering::SeqCst);
        let _guard = self.quota_mtx.lock();
        self.quota_conds[kind.index()].notify_all();
    }
}
