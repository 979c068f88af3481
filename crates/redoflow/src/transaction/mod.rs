//! Per-transaction assembly of interleaved redo records.
//!
//! Transactions live in an arena indexed by a 32-bit handle; the XID map
//! and the chunk lists are guarded by two separate mutexes (`map` and
//! `swap`) and no call path holds both at once. Records append into a
//! singly-grown chunk list; the swap manager may move the middle of that
//! list to disk, leaving `None` holes that are always brought back before
//! the builder walks the transaction.
//!
//! Commit pushes an event into a channel the builder drains in commit
//! order; rollback frees everything; a partial rollback marks the latest
//! matching row operation dead so the net change set survives.

pub mod swap;

use crate::context::Ctx;
use crate::error::{RedoError, Result};
use crate::memory::{Chunk, ChunkPool, MemoryKind};
use crate::parser::record::{
    decode_entry_header, encode_entry, RecordMeta, RedoOp, ENTRY_FLAG_DEAD, ENTRY_HEADER_SIZE,
};
use crate::types::{FileOffset, Scn, Seq, Xid};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Embedded header at the start of every transaction chunk: total used
/// bytes (header included) and entry count. Survives the swap round trip.
pub const TX_CHUNK_HEADER: usize = 16;

const SWAP_WAIT: Duration = Duration::from_secs(10);

pub type TxHandle = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    New,
    Updated,
    Prepared,
    Committed,
    RolledBack,
    Processed,
    Bad,
}

/// Commit notification consumed by the builder, in commit order.
#[derive(Debug, Clone)]
pub struct CommitEvent {
    pub handle: TxHandle,
    pub xid: Xid,
    pub commit_scn: Scn,
    pub start_scn: Scn,
    pub sequence: Seq,
    /// Session user recorded by the begin record
    pub name: String,
}

/// One in-flight transaction.
pub struct Transaction {
    pub xid: Xid,
    pub state: TxState,
    pub start_scn: Scn,
    pub commit_scn: Scn,
    pub start_sequence: Seq,
    pub start_offset: FileOffset,
    pub name: String,
    /// Chunk list; `None` marks a chunk currently on disk (or in flight)
    pub chunks: Vec<Option<Chunk>>,
    /// Disk slab bounds; both are -1 when nothing is swapped
    pub swapped_min: i32,
    pub swapped_max: i32,
    pub objs_used: HashSet<u32>,
    pub op_count: u64,
    pub begin_seen: bool,
    /// Output cursor: chunks below this index were handed to the builder
    pub consumed: usize,
}

impl Transaction {
    fn new(xid: Xid, scn: Scn, sequence: Seq, offset: FileOffset) -> Self {
        Transaction {
            xid,
            state: TxState::New,
            start_scn: scn,
            commit_scn: Scn::NONE,
            start_sequence: sequence,
            start_offset: offset,
            name: String::new(),
            chunks: Vec::new(),
            swapped_min: -1,
            swapped_max: -1,
            objs_used: HashSet::new(),
            op_count: 0,
            begin_seen: false,
            consumed: 0,
        }
    }

    pub fn has_swapped_chunks(&self) -> bool {
        self.swapped_min >= 0
    }

    /// Resident chunk count, for quota decisions and tests.
    pub fn resident_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    fn chunk_used(chunk: &Chunk) -> usize {
        u64::from_le_bytes(chunk.bytes()[0..8].try_into().expect("chunk header")) as usize
    }

    fn set_chunk_used(chunk: &mut Chunk, used: usize, entries: u32) {
        chunk.bytes_mut()[0..8].copy_from_slice(&(used as u64).to_le_bytes());
        chunk.bytes_mut()[8..12].copy_from_slice(&entries.to_le_bytes());
        chunk.len = used;
    }

    fn chunk_entries(chunk: &Chunk) -> u32 {
        u32::from_le_bytes(chunk.bytes()[8..12].try_into().expect("chunk header"))
    }

    fn init_chunk(chunk: &mut Chunk) {
        Self::set_chunk_used(chunk, TX_CHUNK_HEADER, 0);
    }

    /// Try to append into the last chunk; false means a new chunk is needed.
    fn try_append(&mut self, bytes: &[u8]) -> bool {
        let Some(Some(chunk)) = self.chunks.last_mut() else {
            return false;
        };
        let used = Self::chunk_used(chunk);
        if used + bytes.len() > chunk.capacity() {
            return false;
        }
        chunk.bytes_mut()[used..used + bytes.len()].copy_from_slice(bytes);
        let entries = Self::chunk_entries(chunk) + 1;
        Self::set_chunk_used(chunk, used + bytes.len(), entries);
        true
    }

    /// Walk resident chunks from the tail and mark the latest live entry
    /// matching `(obj, dba, slot)` dead. Returns whether a match was found.
    fn kill_matching(&mut self, obj: u32, dba: u32, slot: u16) -> bool {
        for chunk in self.chunks.iter_mut().rev().flatten() {
            let used = Self::chunk_used(chunk);
            // Offsets first; entries are forward-linked inside the chunk.
            let mut offsets = Vec::new();
            let mut pos = TX_CHUNK_HEADER;
            while pos + ENTRY_HEADER_SIZE <= used {
                let header = match decode_entry_header(&chunk.bytes()[pos..]) {
                    Ok(h) => h,
                    Err(_) => break,
                };
                offsets.push((pos, header));
                pos += header.len as usize;
            }
            for (pos, header) in offsets.into_iter().rev() {
                let is_row_op = matches!(header.kind, 4..=6);
                if is_row_op
                    && header.flags & ENTRY_FLAG_DEAD == 0
                    && header.obj == obj
                    && header.dba == dba
                    && header.slot == slot
                {
                    chunk.bytes_mut()[pos + 5] |= ENTRY_FLAG_DEAD;
                    return true;
                }
            }
        }
        false
    }
}

/// Arena state guarded by the swap mutex.
pub struct TxArena {
    pub slots: Vec<Option<Transaction>>,
    free: Vec<TxHandle>,
    /// Transaction being flushed back from disk for the builder
    pub flush_xid: Option<Xid>,
    /// Transaction whose newest swapped chunk should come back
    pub shrink_xid: Option<Xid>,
    /// `(xid, chunk index)` currently being written to disk
    pub swapping: Option<(Xid, usize)>,
    /// Set by append paths when the quota ran dry
    pub pressure: bool,
}

impl TxArena {
    pub fn get(&self, handle: TxHandle) -> Option<&Transaction> {
        self.slots.get(handle as usize).and_then(|t| t.as_ref())
    }

    pub fn get_mut(&mut self, handle: TxHandle) -> Option<&mut Transaction> {
        self.slots.get_mut(handle as usize).and_then(|t| t.as_mut())
    }
}

/// The transaction buffer: XID map plus arena plus the commit channel.
pub struct TransactionBuffer {
    ctx: Arc<Ctx>,
    pool: Arc<ChunkPool>,
    swap_path: PathBuf,
    map: Mutex<HashMap<Xid, TxHandle>>,
    pub(crate) arena: Mutex<TxArena>,
    /// Wakes the swap manager: pressure, flush and shrink requests
    pub(crate) cond_swap: Arc<Condvar>,
    /// Signals swap state changes back to waiters
    pub(crate) cond_swap_done: Arc<Condvar>,
    commit_tx: Sender<CommitEvent>,
    commit_rx: Receiver<CommitEvent>,
}

impl TransactionBuffer {
    pub fn new(ctx: Arc<Ctx>, pool: Arc<ChunkPool>, swap_path: PathBuf) -> Arc<Self> {
        let (commit_tx, commit_rx) = unbounded();
        let buffer = Arc::new(TransactionBuffer {
            ctx: ctx.clone(),
            pool,
            swap_path,
            map: Mutex::new(HashMap::new()),
            arena: Mutex::new(TxArena {
                slots: Vec::new(),
                free: Vec::new(),
                flush_xid: None,
                shrink_xid: None,
                swapping: None,
                pressure: false,
            }),
            cond_swap: Arc::new(Condvar::new()),
            cond_swap_done: Arc::new(Condvar::new()),
            commit_tx,
            commit_rx,
        });
        ctx.register_waker(buffer.cond_swap.clone());
        ctx.register_waker(buffer.cond_swap_done.clone());
        buffer
    }

    pub fn ctx(&self) -> &Arc<Ctx> {
        &self.ctx
    }

    pub fn pool(&self) -> &Arc<ChunkPool> {
        &self.pool
    }

    pub fn swap_path(&self) -> &PathBuf {
        &self.swap_path
    }

    pub fn swap_file(&self, xid: Xid) -> PathBuf {
        self.swap_path.join(format!("{}.swap", xid.to_hex()))
    }

    pub fn commit_events(&self) -> &Receiver<CommitEvent> {
        &self.commit_rx
    }

    /// Transactions currently tracked (any state before Processed).
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Find or lazily create the transaction for `xid`.
    pub fn get_or_create(
        &self,
        xid: Xid,
        scn: Scn,
        sequence: Seq,
        offset: FileOffset,
    ) -> TxHandle {
        if let Some(handle) = self.map.lock().get(&xid) {
            return *handle;
        }
        let mut arena = self.arena.lock();
        let tx = Transaction::new(xid, scn, sequence, offset);
        let handle = match arena.free.pop() {
            Some(handle) => {
                arena.slots[handle as usize] = Some(tx);
                handle
            }
            None => {
                arena.slots.push(Some(tx));
                (arena.slots.len() - 1) as TxHandle
            }
        };
        drop(arena);
        self.map.lock().insert(xid, handle);
        metrics::gauge!("redoflow_transactions_active").increment(1.0);
        handle
    }

    pub fn handle_of(&self, xid: Xid) -> Option<TxHandle> {
        self.map.lock().get(&xid).copied()
    }

    /// Record a transaction begin: session name and start position.
    pub fn begin(
        &self,
        xid: Xid,
        scn: Scn,
        sequence: Seq,
        offset: FileOffset,
        name: &str,
    ) -> TxHandle {
        let handle = self.get_or_create(xid, scn, sequence, offset);
        let mut arena = self.arena.lock();
        if let Some(tx) = arena.get_mut(handle) {
            tx.begin_seen = true;
            tx.name = name.to_string();
            if tx.start_scn.is_none() || scn < tx.start_scn {
                tx.start_scn = scn;
            }
        }
        handle
    }

    /// Append a decoded operation. May suspend on the transactions memory
    /// quota; the swap manager makes room by spilling idle chunks.
    pub fn append_op(&self, handle: TxHandle, meta: &RecordMeta, op: &RedoOp) -> Result<()> {
        let bytes = encode_entry(meta, op);
        if bytes.len() + TX_CHUNK_HEADER > self.pool.chunk_size() {
            return Err(RedoError::runtime(
                50005,
                format!("record of {} bytes exceeds the chunk size", bytes.len()),
            ));
        }
        loop {
            {
                let mut arena = self.arena.lock();
                let tx = arena
                    .get_mut(handle)
                    .ok_or_else(|| RedoError::runtime(50006, "append to freed transaction"))?;
                if matches!(tx.state, TxState::Committed | TxState::RolledBack | TxState::Processed)
                {
                    return Err(RedoError::runtime(50007, "append to closed transaction"));
                }
                if tx.try_append(&bytes) {
                    tx.state = TxState::Updated;
                    tx.op_count += 1;
                    if meta.obj != 0 {
                        tx.objs_used.insert(meta.obj);
                    }
                    return Ok(());
                }
            }

            // Need a fresh chunk; flag pressure so the swap manager starts
            // spilling if the quota is dry.
            let mut chunk = match self.pool.acquire(MemoryKind::Transactions) {
                Some(chunk) => chunk,
                None => {
                    {
                        let mut arena = self.arena.lock();
                        arena.pressure = true;
                        self.cond_swap.notify_all();
                    }
                    self.pool.acquire_wait(MemoryKind::Transactions, &self.ctx)?
                }
            };
            Transaction::init_chunk(&mut chunk);
            let mut arena = self.arena.lock();
            match arena.get_mut(handle) {
                Some(tx) => tx.chunks.push(Some(chunk)),
                None => {
                    drop(arena);
                    self.pool.release(MemoryKind::Transactions, chunk);
                    return Err(RedoError::runtime(50006, "append to freed transaction"));
                }
            }
        }
    }

    /// Commit: freeze the chunk list and queue the event for the builder.
    pub fn commit(&self, handle: TxHandle, commit_scn: Scn, sequence: Seq) -> Result<()> {
        let event = {
            let mut arena = self.arena.lock();
            let tx = arena
                .get_mut(handle)
                .ok_or_else(|| RedoError::runtime(50008, "commit of freed transaction"))?;
            tx.state = TxState::Committed;
            tx.commit_scn = commit_scn;
            CommitEvent {
                handle,
                xid: tx.xid,
                commit_scn,
                start_scn: tx.start_scn,
                sequence,
                name: tx.name.clone(),
            }
        };
        metrics::counter!("redoflow_transactions_committed_total").increment(1);
        self.commit_tx
            .send(event)
            .map_err(|_| RedoError::runtime(50009, "commit channel closed"))
    }

    /// Full rollback: nothing from this transaction will be emitted.
    pub fn rollback(&self, handle: TxHandle) -> Result<()> {
        {
            let mut arena = self.arena.lock();
            let tx = arena
                .get_mut(handle)
                .ok_or_else(|| RedoError::runtime(50010, "rollback of freed transaction"))?;
            tx.state = TxState::RolledBack;
        }
        metrics::counter!("redoflow_transactions_rolled_back_total").increment(1);
        self.free_transaction(handle);
        Ok(())
    }

    /// Partial rollback: undo the latest matching row operation.
    pub fn partial_rollback(&self, handle: TxHandle, obj: u32, dba: u32, slot: u16) -> bool {
        let mut arena = self.arena.lock();
        match arena.get_mut(handle) {
            Some(tx) => tx.kill_matching(obj, dba, slot),
            None => false,
        }
    }

    /// Position of the earliest record of any in-flight transaction, for
    /// checkpointing. `(NONE, 0, zero)` when nothing is pending.
    pub fn min_position(&self) -> (Seq, FileOffset, Xid) {
        let arena = self.arena.lock();
        let mut best: Option<(Seq, FileOffset, Xid)> = None;
        for tx in arena.slots.iter().flatten() {
            if !matches!(tx.state, TxState::New | TxState::Updated | TxState::Prepared) {
                continue;
            }
            let candidate = (tx.start_sequence, tx.start_offset, tx.xid);
            let better = match &best {
                None => true,
                Some((seq, offset, _)) => {
                    candidate.0 < *seq || (candidate.0 == *seq && candidate.1 < *offset)
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        best.unwrap_or((Seq::NONE, FileOffset::ZERO, Xid::ZERO))
    }

    /// Hand the builder the next chunk of a committed transaction, oldest
    /// first. Swapped chunks are brought back one at a time by the swap
    /// manager so a spilled transaction never needs full residency.
    /// `Ok(None)` once every chunk was consumed; the transaction is then
    /// Processed.
    pub fn next_output_chunk(&self, handle: TxHandle) -> Result<Option<Chunk>> {
        let mut arena = self.arena.lock();
        loop {
            let (tx_xid, cursor, total) = {
                let tx = arena
                    .get(handle)
                    .ok_or_else(|| RedoError::runtime(50011, "output of freed transaction"))?;
                (tx.xid, tx.consumed, tx.chunks.len())
            };
            if cursor >= total {
                let tx = arena.get_mut(handle).expect("present above");
                tx.state = TxState::Processed;
                return Ok(None);
            }
            let in_flight = matches!(arena.swapping, Some((sx, i)) if sx == tx_xid && i == cursor);
            let resident = {
                let tx = arena.get(handle).expect("present above");
                tx.chunks[cursor].is_some()
            };
            if resident && !in_flight {
                let tx = arena.get_mut(handle).expect("present above");
                let chunk = tx.chunks[cursor].take().expect("resident above");
                tx.consumed += 1;
                return Ok(Some(chunk));
            }
            // Ask the swap manager to bring the oldest swapped chunk back.
            arena.flush_xid = Some(tx_xid);
            self.cond_swap.notify_all();
            let timed_out = self.cond_swap_done.wait_for(&mut arena, SWAP_WAIT).timed_out();
            if self.ctx.hard_shutdown() {
                return Err(RedoError::runtime(50012, "shutdown while unswapping"));
            }
            if timed_out {
                return Err(RedoError::runtime(
                    50013,
                    "swap manager did not restore chunks in time",
                ));
            }
        }
    }

    /// Drop the transaction: release chunks, remove the swap file, recycle
    /// the handle.
    pub fn free_transaction(&self, handle: TxHandle) {
        let (xid, chunks) = {
            let mut arena = self.arena.lock();
            // Wait out an in-flight swap write of this transaction.
            loop {
                let Some(tx) = arena.get(handle) else { return };
                let xid = tx.xid;
                match arena.swapping {
                    Some((sx, _)) if sx == xid => {
                        self.cond_swap_done.wait_for(&mut arena, SWAP_WAIT);
                        if self.ctx.hard_shutdown() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            let Some(tx) = arena.slots.get_mut(handle as usize).and_then(Option::take) else {
                return;
            };
            arena.free.push(handle);
            if arena.flush_xid == Some(tx.xid) {
                arena.flush_xid = None;
            }
            if arena.shrink_xid == Some(tx.xid) {
                arena.shrink_xid = None;
            }
            (tx.xid, tx.chunks)
        };
        for chunk in chunks.into_iter().flatten() {
            self.pool.release(MemoryKind::Transactions, chunk);
        }
        let swap_file = self.swap_file(xid);
        if swap_file.exists() {
            if let Err(e) = std::fs::remove_file(&swap_file) {
                tracing::warn!(code = 60030u32, file = %swap_file.display(), error = %e, "cannot remove swap file");
            }
        }
        self.map.lock().remove(&xid);
        metrics::gauge!("redoflow_transactions_active").decrement(1.0);
    }

    /// Release a chunk the builder took with `next_output_chunk`.
    pub fn release_output_chunk(&self, chunk: Chunk) {
        self.pool.release(MemoryKind::Transactions, chunk);
    }

    /// Collect every live chunk of a committed transaction, for callers
    /// that can afford full residency (tests, small transactions).
    pub fn drain_output_chunks(&self, handle: TxHandle) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_output_chunk(handle)? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

/// Iterate the entries of a prepared chunk list in append order.
pub fn entries<'a>(chunks: &'a [Chunk]) -> impl Iterator<Item = &'a [u8]> + 'a {
    chunks.iter().flat_map(|chunk| {
        let used = Transaction::chunk_used(chunk);
        EntryIter { data: &chunk.bytes()[..used], pos: TX_CHUNK_HEADER }
    })
}

struct EntryIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.pos + ENTRY_HEADER_SIZE > self.data.len() {
            return None;
        }
        let header = decode_entry_header(&self.data[self.pos..]).ok()?;
        let end = self.pos + header.len as usize;
        if end > self.data.len() {
            return None;
        }
        let entry = &self.data[self.pos..end];
        self.pos = end;
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::record::{decode_entry_op, ColumnRef, ColumnValue};
    use tempfile::tempdir;

    fn setup(chunk_size: usize, tx_chunks: usize) -> (Arc<TransactionBuffer>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let ctx = Arc::new(Ctx::new("DB1"));
        let pool = ChunkPool::new(chunk_size, [2, 2, tx_chunks, 2, 1]);
        let buffer = TransactionBuffer::new(ctx, pool, dir.path().to_path_buf());
        (buffer, dir)
    }

    fn meta(xid: Xid, scn: u64) -> RecordMeta {
        RecordMeta { scn: Scn(scn), sub_scn: 0, xid, obj: 81337, flags: 0 }
    }

    fn insert(dba: u32, slot: u16, id: &str) -> RedoOp {
        RedoOp::Insert {
            dba,
            slot,
            after: vec![ColumnRef { col: 1, value: ColumnValue::Number(id.into()) }],
        }
    }

    #[test]
    fn append_and_walk_entries() {
        let (buffer, _dir) = setup(4096, 4);
        let xid = Xid::new(1, 2, 3);
        let handle = buffer.begin(xid, Scn(100), Seq(1), FileOffset(1024), "app");
        buffer.append_op(handle, &meta(xid, 101), &insert(10, 1, "1")).unwrap();
        buffer.append_op(handle, &meta(xid, 102), &insert(10, 2, "2")).unwrap();
        buffer.commit(handle, Scn(150), Seq(1)).unwrap();

        let event = buffer.commit_events().try_recv().unwrap();
        assert_eq!(event.commit_scn, Scn(150));
        assert_eq!(event.start_scn, Scn(100));

        let chunks = buffer.drain_output_chunks(handle).unwrap();
        let ops: Vec<RedoOp> =
            entries(&chunks).map(|e| decode_entry_op(e).unwrap()).collect();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0], insert(10, 1, "1"));
        assert_eq!(ops[1], insert(10, 2, "2"));
        for chunk in chunks {
            buffer.release_output_chunk(chunk);
        }
        buffer.free_transaction(handle);
    }

    #[test]
    fn append_grows_across_chunks() {
        let (buffer, _dir) = setup(512, 8);
        let xid = Xid::new(1, 0, 1);
        let handle = buffer.begin(xid, Scn(1), Seq(1), FileOffset::ZERO, "u");
        // Each entry is well over a hundred bytes; a 512-byte chunk fits
        // only a few.
        for i in 0..20 {
            buffer
                .append_op(handle, &meta(xid, 2 + i), &insert(1, i as u16, "payload"))
                .unwrap();
        }
        let arena = buffer.arena.lock();
        let tx = arena.get(handle).unwrap();
        assert!(tx.chunks.len() > 1);
        assert_eq!(tx.op_count, 20);
    }

    #[test]
    fn commit_events_preserve_order() {
        let (buffer, _dir) = setup(4096, 8);
        // Three transactions committing at 140, 150, 160 in log order.
        let plan = [(Xid::new(0, 0, 2), 110, 140), (Xid::new(0, 0, 1), 100, 150), (Xid::new(0, 0, 3), 120, 160)];
        for (xid, start, commit) in plan {
            let handle = buffer.begin(xid, Scn(start), Seq(1), FileOffset::ZERO, "u");
            buffer.append_op(handle, &meta(xid, start + 1), &insert(1, 1, "x")).unwrap();
            buffer.commit(handle, Scn(commit), Seq(1)).unwrap();
        }
        let order: Vec<u64> = buffer
            .commit_events()
            .try_iter()
            .take(3)
            .map(|e| e.commit_scn.0)
            .collect();
        assert_eq!(order, vec![140, 150, 160]);
    }

    #[test]
    fn rollback_frees_everything() {
        let (buffer, _dir) = setup(4096, 4);
        let xid = Xid::new(2, 0, 9);
        let handle = buffer.begin(xid, Scn(1), Seq(1), FileOffset::ZERO, "u");
        buffer.append_op(handle, &meta(xid, 2), &insert(1, 1, "a")).unwrap();
        assert_eq!(buffer.pool().used(MemoryKind::Transactions), 1);
        buffer.rollback(handle).unwrap();
        assert_eq!(buffer.pool().used(MemoryKind::Transactions), 0);
        assert!(buffer.is_empty());
        assert!(buffer.commit_events().try_recv().is_err());
    }

    #[test]
    fn partial_rollback_kills_latest_match() {
        let (buffer, _dir) = setup(4096, 4);
        let xid = Xid::new(3, 0, 1);
        let handle = buffer.begin(xid, Scn(1), Seq(1), FileOffset::ZERO, "u");
        buffer.append_op(handle, &meta(xid, 2), &insert(100, 1, "a")).unwrap();
        buffer.append_op(handle, &meta(xid, 3), &insert(100, 2, "b")).unwrap();
        assert!(buffer.partial_rollback(handle, 81337, 100, 2));
        // No second live match for the same address.
        assert!(!buffer.partial_rollback(handle, 81337, 100, 2));
        buffer.commit(handle, Scn(10), Seq(1)).unwrap();

        let chunks = buffer.drain_output_chunks(handle).unwrap();
        let live: Vec<RedoOp> = entries(&chunks)
            .filter(|e| decode_entry_header(e).unwrap().flags & ENTRY_FLAG_DEAD == 0)
            .map(|e| decode_entry_op(e).unwrap())
            .collect();
        assert_eq!(live, vec![insert(100, 1, "a")]);
        for chunk in chunks {
            buffer.release_output_chunk(chunk);
        }
        buffer.free_transaction(handle);
    }

    #[test]
    fn min_position_tracks_oldest_in_flight() {
        let (buffer, _dir) = setup(4096, 8);
        assert_eq!(buffer.min_position(), (Seq::NONE, FileOffset::ZERO, Xid::ZERO));

        let a = Xid::new(1, 0, 1);
        let b = Xid::new(1, 0, 2);
        let ha = buffer.begin(a, Scn(50), Seq(3), FileOffset(8192), "u");
        let _hb = buffer.begin(b, Scn(60), Seq(2), FileOffset(4096), "u");
        let (seq, offset, xid) = buffer.min_position();
        assert_eq!((seq, offset, xid), (Seq(2), FileOffset(4096), b));

        // Committing removes a transaction from the probe.
        buffer.commit(buffer.handle_of(b).unwrap(), Scn(70), Seq(2)).unwrap();
        let (seq, _, xid) = buffer.min_position();
        assert_eq!((seq, xid), (Seq(3), a));
        let _ = ha;
    }

    #[test]
    fn oversized_record_is_runtime_error() {
        let (buffer, _dir) = setup(256, 4);
        let xid = Xid::new(1, 0, 1);
        let handle = buffer.begin(xid, Scn(1), Seq(1), FileOffset::ZERO, "u");
        let big = RedoOp::Insert {
            dba: 1,
            slot: 1,
            after: vec![ColumnRef { col: 1, value: ColumnValue::Text("y".repeat(400)) }],
        };
        let err = buffer.append_op(handle, &meta(xid, 2), &big).unwrap_err();
        assert_eq!(err.code(), 50005);
    }

    #[test]
    fn append_after_commit_is_rejected() {
        let (buffer, _dir) = setup(4096, 4);
        let xid = Xid::new(1, 0, 7);
        let handle = buffer.begin(xid, Scn(1), Seq(1), FileOffset::ZERO, "u");
        buffer.commit(handle, Scn(5), Seq(1)).unwrap();
        let err = buffer.append_op(handle, &meta(xid, 6), &insert(1, 1, "x")).unwrap_err();
        assert_eq!(err.code(), 50007);
    }
}
