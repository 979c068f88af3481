//! Background spill of transaction chunks to per-XID files.
//!
//! The swap manager keeps the disk region of every transaction a contiguous
//! middle slab: `[0, swapped_min)` resident, `[swapped_min, swapped_max]`
//! on disk at `offset = index * chunk_size`, the tail resident. The last
//! chunk never swaps so appends always have a resident target.
//!
//! Write path discipline: the chunk pointer is taken (left `None`) under
//! the swap mutex for the duration of the I/O, the file is fsynced before
//! `swapped_max` is published, and truncate/unlink only ever happen under
//! the swap mutex. Stale `*.swap` files are erased at startup.

use super::{Transaction, TransactionBuffer, TxHandle, TxState};
use crate::error::{RedoError, Result};
use crate::memory::MemoryKind;
use crate::types::Xid;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const IDLE_WAIT: Duration = Duration::from_secs(10);

/// The memory-manager thread driving swap-out and swap-in.
pub struct SwapManager {
    buffer: Arc<TransactionBuffer>,
    /// Cleared at runtime when the kernel rejects unaligned direct I/O
    direct_io: std::sync::atomic::AtomicBool,
}

/// What the next loop iteration should do, decided under the swap mutex.
enum Work {
    Flush(Xid),
    Shrink(Xid),
    SwapOut,
    Idle,
}

impl SwapManager {
    pub fn new(buffer: Arc<TransactionBuffer>, direct_io: bool) -> Self {
        SwapManager { buffer, direct_io: std::sync::atomic::AtomicBool::new(direct_io) }
    }

    fn direct_io(&self) -> bool {
        self.direct_io.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Direct I/O needs sector-aligned buffers; when the kernel says EINVAL
    /// we drop to buffered I/O for the rest of the run.
    fn disable_direct_io(&self) {
        if self.direct_io.swap(false, std::sync::atomic::Ordering::Relaxed) {
            tracing::warn!(code = 60031u32, "direct swap I/O rejected by the kernel, using buffered I/O");
        }
    }

    fn is_alignment_error(e: &RedoError) -> bool {
        match e {
            RedoError::Io(io) => io.raw_os_error() == Some(libc::EINVAL),
            _ => false,
        }
    }

    /// Remove swap files left behind by a previous run. Any tail garbage
    /// from a crash dies here.
    pub fn cleanup_stale(&self) -> Result<()> {
        let path = self.buffer.swap_path();
        std::fs::create_dir_all(path)?;
        let mut removed = 0usize;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if entry.path().extension().is_some_and(|e| e == "swap") {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, path = %path.display(), "removed stale swap files");
        }
        Ok(())
    }

    pub fn spawn(self) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("memory-manager".into())
            .spawn(move || self.run())
            .expect("spawn memory manager thread")
    }

    pub fn run(self) {
        let ctx = self.buffer.ctx().clone();
        loop {
            if ctx.hard_shutdown() {
                break;
            }
            let work = {
                let mut arena = self.buffer.arena.lock();
                if let Some(xid) = arena.flush_xid {
                    Work::Flush(xid)
                } else if let Some(xid) = arena.shrink_xid {
                    Work::Shrink(xid)
                } else if arena.pressure {
                    Work::SwapOut
                } else {
                    if ctx.soft_shutdown() {
                        break;
                    }
                    self.buffer.cond_swap.wait_for(&mut arena, IDLE_WAIT);
                    Work::Idle
                }
            };
            let outcome = match work {
                Work::Flush(xid) => self.swap_in(xid, UnswapKind::Flush),
                Work::Shrink(xid) => self.swap_in(xid, UnswapKind::Shrink),
                Work::SwapOut => self.swap_out_one(),
                Work::Idle => Ok(()),
            };
            if let Err(e) = outcome {
                tracing::error!(code = e.code(), error = %e, "swap operation failed");
                ctx.stop_hard();
                break;
            }
        }
        // Wake anyone still waiting for chunks we will never restore.
        let _arena = self.buffer.arena.lock();
        self.buffer.cond_swap_done.notify_all();
    }

    fn open_swap_file(&self, path: &Path, create: bool) -> Result<File> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(create);
        #[cfg(target_os = "linux")]
        if self.direct_io() {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }
        options.open(path).map_err(|e| {
            RedoError::runtime(50014, format!("swap file {}: {e}", path.display()))
        })
    }

    /// Pick a spill victim and move one chunk to disk. The chosen chunk is
    /// never the last one and never belongs to a closed transaction.
    fn swap_out_one(&self) -> Result<()> {
        let chunk_size = self.buffer.pool().chunk_size();
        let picked = {
            let mut guard = self.buffer.arena.lock();
            // Split the guard so the slot iteration and the swapping marker
            // borrow disjoint fields.
            let arena = &mut *guard;
            let flush = arena.flush_xid;
            let shrink = arena.shrink_xid;
            let mut picked = None;
            for (handle, slot) in arena.slots.iter_mut().enumerate() {
                let Some(tx) = slot.as_mut() else { continue };
                if !matches!(tx.state, TxState::New | TxState::Updated | TxState::Prepared) {
                    continue;
                }
                if Some(tx.xid) == flush || Some(tx.xid) == shrink {
                    continue;
                }
                if tx.chunks.len() < 2 {
                    continue;
                }
                let next = (tx.swapped_max + 1) as usize;
                if next + 1 >= tx.chunks.len() || tx.chunks[next].is_none() {
                    continue;
                }
                let chunk = tx.chunks[next].take().expect("checked resident");
                arena.swapping = Some((tx.xid, next));
                picked = Some((handle as TxHandle, tx.xid, next, chunk));
                break;
            }
            picked
        };

        let Some((handle, xid, index, chunk)) = picked else {
            // Nothing to spill; drop the pressure flag so we go idle until
            // the next allocation failure.
            let mut arena = self.buffer.arena.lock();
            arena.pressure = false;
            return Ok(());
        };

        let path = self.buffer.swap_file(xid);
        let do_write = || -> Result<()> {
            let file = self.open_swap_file(&path, true)?;
            file.write_all_at(chunk.bytes(), (index * chunk_size) as u64)?;
            file.sync_all()?;
            Ok(())
        };
        let write = match do_write() {
            Err(e) if Self::is_alignment_error(&e) => {
                self.disable_direct_io();
                do_write()
            }
            other => other,
        };

        match write {
            Ok(()) => {
                {
                    let mut arena = self.buffer.arena.lock();
                    if let Some(tx) = arena.get_mut(handle).filter(|tx| tx.xid == xid) {
                        tx.swapped_max = index as i32;
                        if tx.swapped_min < 0 {
                            tx.swapped_min = index as i32;
                        }
                    }
                    arena.swapping = None;
                    self.buffer.cond_swap_done.notify_all();
                }
                metrics::counter!("redoflow_swap_out_total").increment(1);
                tracing::debug!(xid = %xid, index, "swapped chunk out");
                self.buffer.pool().release(MemoryKind::Transactions, chunk);
                Ok(())
            }
            Err(e) => {
                // Put the chunk back; the caller treats swap I/O as fatal.
                let mut arena = self.buffer.arena.lock();
                if let Some(tx) = arena.get_mut(handle).filter(|tx| tx.xid == xid) {
                    tx.chunks[index] = Some(chunk);
                }
                arena.swapping = None;
                self.buffer.cond_swap_done.notify_all();
                Err(e)
            }
        }
    }

    /// Spill the oldest resident tail chunk of a committed transaction to
    /// make room for a flush swap-in. Extends the disk slab upward, so the
    /// contiguity invariant holds.
    fn swap_out_tail_of(&self, handle: TxHandle, xid: Xid) -> Result<()> {
        let chunk_size = self.buffer.pool().chunk_size();
        let picked = {
            let mut arena = self.buffer.arena.lock();
            if arena.swapping.is_some() {
                return Ok(());
            }
            let Some(tx) = arena.get_mut(handle).filter(|tx| tx.xid == xid) else {
                return Ok(());
            };
            let index = (tx.swapped_max + 1) as usize;
            if index >= tx.chunks.len() || tx.chunks[index].is_none() {
                return Ok(());
            }
            let chunk = tx.chunks[index].take().expect("checked resident");
            arena.swapping = Some((xid, index));
            Some((index, chunk))
        };
        let Some((index, chunk)) = picked else { return Ok(()) };

        let path = self.buffer.swap_file(xid);
        let do_write = || -> Result<()> {
            let file = self.open_swap_file(&path, true)?;
            file.write_all_at(chunk.bytes(), (index * chunk_size) as u64)?;
            file.sync_all()?;
            Ok(())
        };
        let write = match do_write() {
            Err(e) if Self::is_alignment_error(&e) => {
                self.disable_direct_io();
                do_write()
            }
            other => other,
        };
        let mut arena = self.buffer.arena.lock();
        match write {
            Ok(()) => {
                if let Some(tx) = arena.get_mut(handle).filter(|tx| tx.xid == xid) {
                    tx.swapped_max = index as i32;
                    if tx.swapped_min < 0 {
                        tx.swapped_min = index as i32;
                    }
                }
                arena.swapping = None;
                self.buffer.cond_swap_done.notify_all();
                drop(arena);
                self.buffer.pool().release(MemoryKind::Transactions, chunk);
                Ok(())
            }
            Err(e) => {
                if let Some(tx) = arena.get_mut(handle).filter(|tx| tx.xid == xid) {
                    tx.chunks[index] = Some(chunk);
                }
                arena.swapping = None;
                self.buffer.cond_swap_done.notify_all();
                Err(e)
            }
        }
    }

    fn swap_in(&self, xid: Xid, kind: UnswapKind) -> Result<()> {
        let chunk_size = self.buffer.pool().chunk_size();
        let Some(handle) = self.buffer.handle_of(xid) else {
            let mut arena = self.buffer.arena.lock();
            Self::clear_request(&mut arena, xid, kind);
            self.buffer.cond_swap_done.notify_all();
            return Ok(());
        };

        // Which index to restore, under the lock.
        let index = {
            let mut arena = self.buffer.arena.lock();
            let Some(tx) = arena.get(handle) else {
                Self::clear_request(&mut arena, xid, kind);
                self.buffer.cond_swap_done.notify_all();
                return Ok(());
            };
            if !tx.has_swapped_chunks() {
                Self::clear_request(&mut arena, xid, kind);
                self.buffer.cond_swap_done.notify_all();
                return Ok(());
            }
            match kind {
                UnswapKind::Flush => tx.swapped_min as usize,
                UnswapKind::Shrink => tx.swapped_max as usize,
            }
        };

        // Chunk acquisition must not deadlock against the quota this
        // transaction itself is holding: spill from open transactions
        // first, then from this transaction's own resident tail, then wait
        // for the builder to release what it is walking.
        let mut chunk = match self.buffer.pool().acquire(MemoryKind::Transactions) {
            Some(chunk) => chunk,
            None => {
                self.swap_out_one()?;
                match self.buffer.pool().acquire(MemoryKind::Transactions) {
                    Some(chunk) => chunk,
                    None => {
                        self.swap_out_tail_of(handle, xid)?;
                        self.buffer
                            .pool()
                            .acquire_wait(MemoryKind::Transactions, self.buffer.ctx())?
                    }
                }
            }
        };

        let path = self.buffer.swap_file(xid);
        let mut do_read = |chunk: &mut crate::memory::Chunk| -> Result<()> {
            let file = self.open_swap_file(&path, false)?;
            file.read_exact_at(chunk.bytes_mut(), (index * chunk_size) as u64)?;
            Ok(())
        };
        let read = match do_read(&mut chunk) {
            Err(e) if Self::is_alignment_error(&e) => {
                self.disable_direct_io();
                do_read(&mut chunk)
            }
            other => other,
        };
        if let Err(e) = read {
            self.buffer.pool().release(MemoryKind::Transactions, chunk);
            return Err(e);
        }
        chunk.len = Transaction::chunk_used(&chunk);

        let mut arena = self.buffer.arena.lock();
        let tx = match arena.get_mut(handle) {
            // Guard against handle reuse while the I/O ran.
            Some(tx) if tx.xid == xid => tx,
            _ => {
                drop(arena);
                self.buffer.pool().release(MemoryKind::Transactions, chunk);
                return Ok(());
            }
        };
        tx.chunks[index] = Some(chunk);
        let empty = match kind {
            UnswapKind::Flush => {
                tx.swapped_min += 1;
                tx.swapped_min > tx.swapped_max
            }
            UnswapKind::Shrink => {
                tx.swapped_max -= 1;
                tx.swapped_min > tx.swapped_max
            }
        };
        let truncate_to = (tx.swapped_max + 1) as u64 * chunk_size as u64;
        if empty {
            tx.swapped_min = -1;
            tx.swapped_max = -1;
            Self::clear_request(&mut arena, xid, kind);
            // Unlink under the swap mutex.
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(code = 60030u32, file = %path.display(), error = %e, "cannot remove swap file");
                }
            }
        } else if matches!(kind, UnswapKind::Shrink) {
            // The tail came back; give the space back to the file system.
            if let Ok(file) = OpenOptions::new().write(true).open(&path) {
                let _ = file.set_len(truncate_to);
            }
        }
        metrics::counter!("redoflow_swap_in_total").increment(1);
        self.buffer.cond_swap_done.notify_all();
        Ok(())
    }

    fn clear_request(arena: &mut super::TxArena, xid: Xid, kind: UnswapKind) {
        match kind {
            UnswapKind::Flush => {
                if arena.flush_xid == Some(xid) {
                    arena.flush_xid = None;
                }
            }
            UnswapKind::Shrink => {
                if arena.shrink_xid == Some(xid) {
                    arena.shrink_xid = None;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnswapKind {
    Flush,
    Shrink,
}
