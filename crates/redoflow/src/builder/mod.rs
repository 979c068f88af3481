//! Turns committed transactions into output messages.
//!
//! The builder drains the commit channel in commit order, walks each
//! transaction's chunk list oldest-first (the swap manager restores spilled
//! chunks one at a time), and serializes row changes into the output queue:
//! a list of nodes, each owning one builder chunk with messages packed back
//! to back. The writer confirms message ids; fully confirmed nodes return
//! their chunks to the pool.

pub mod binary;
pub mod json;

use crate::context::Ctx;
use crate::error::{RedoError, Result};
use crate::format::{Format, OutputKind};
use crate::memory::{Chunk, ChunkPool, MemoryKind};
use crate::metadata::Metadata;
use crate::parser::record::{
    decode_entry_header, decode_entry_op, RedoOp, ENTRY_FLAG_DEAD,
};
use crate::transaction::{entries, CommitEvent, TransactionBuffer};
use crate::types::{FileOffset, Scn, Seq};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const QUEUE_WAIT: Duration = Duration::from_secs(10);
const COMMIT_POLL: Duration = Duration::from_millis(200);

/// Message flags mirrored onto the wire.
pub mod msg_flags {
    pub const DDL: u8 = 0x01;
    pub const REDO: u8 = 0x02;
    pub const CHECKPOINT: u8 = 0x04;
}

/// One message handed to the writer; bytes are copied out of the queue
/// node so the writer never borrows pool memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMessage {
    pub id: u64,
    pub scn: Scn,
    pub idx: u64,
    pub flags: u8,
    /// Routing-tag preamble length at the start of `data`
    pub tag_len: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct MsgMeta {
    id: u64,
    offset: usize,
    len: usize,
    scn: Scn,
    idx: u64,
    flags: u8,
    tag_len: u32,
}

struct QueueNode {
    data: Chunk,
    used: usize,
    msgs: Vec<MsgMeta>,
}

struct QueueState {
    nodes: std::collections::VecDeque<QueueNode>,
    next_id: u64,
    confirmed_id: u64,
}

/// Out-of-band LOB pages, keyed by `(lob id, page number)`.
#[derive(Default)]
pub struct LobCtx {
    pages: HashMap<u64, std::collections::BTreeMap<u32, Vec<u8>>>,
}

impl LobCtx {
    pub fn add_page(&mut self, lob_id: u64, page_no: u32, data: Vec<u8>) {
        self.pages.entry(lob_id).or_default().insert(page_no, data);
    }

    /// Concatenate all pages of a LOB in page order.
    pub fn resolve(&self, lob_id: u64) -> Option<Vec<u8>> {
        let pages = self.pages.get(&lob_id)?;
        if pages.is_empty() {
            return None;
        }
        let mut out = Vec::new();
        for data in pages.values() {
            out.extend_from_slice(data);
        }
        Some(out)
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

/// Builder checkpoint position: which LWN the next message belongs to.
struct LwnPos {
    scn: Scn,
    idx: u64,
}

pub struct Builder {
    ctx: Arc<Ctx>,
    metadata: Arc<Metadata>,
    txbuf: Arc<TransactionBuffer>,
    pool: Arc<ChunkPool>,
    pub format: Format,
    queue: Mutex<QueueState>,
    /// Writer waits here for new messages
    cond_data: Arc<Condvar>,
    /// Builder waits here for confirmed space
    cond_space: Arc<Condvar>,
    lwn: Mutex<LwnPos>,
    lob: Mutex<LobCtx>,
}

impl Builder {
    pub fn new(
        ctx: Arc<Ctx>,
        metadata: Arc<Metadata>,
        txbuf: Arc<TransactionBuffer>,
        pool: Arc<ChunkPool>,
        format: Format,
    ) -> Arc<Self> {
        let builder = Arc::new(Builder {
            ctx: ctx.clone(),
            metadata,
            txbuf,
            pool,
            format,
            queue: Mutex::new(QueueState {
                nodes: std::collections::VecDeque::new(),
                next_id: 1,
                confirmed_id: 0,
            }),
            cond_data: Arc::new(Condvar::new()),
            cond_space: Arc::new(Condvar::new()),
            lwn: Mutex::new(LwnPos { scn: Scn::NONE, idx: 0 }),
            lob: Mutex::new(LobCtx::default()),
        });
        ctx.register_waker(builder.cond_data.clone());
        ctx.register_waker(builder.cond_space.clone());
        builder
    }

    pub fn spawn(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let builder = self.clone();
        std::thread::Builder::new()
            .name("builder".into())
            .spawn(move || builder.run())
            .expect("spawn builder thread")
    }

    /// Drain commit events until shutdown; failures set hard shutdown.
    ///
    /// Events arrive in non-decreasing commit-SCN order, but group commits
    /// produce ties. A group sharing the frontier commit SCN is held back
    /// and flushed in `(commit_scn, start_scn)` order once a later commit
    /// arrives or the channel goes idle.
    pub fn run(self: Arc<Self>) {
        let mut pending: Vec<CommitEvent> = Vec::new();
        loop {
            if self.ctx.hard_shutdown() {
                break;
            }
            match self.txbuf.commit_events().recv_timeout(COMMIT_POLL) {
                Ok(event) => {
                    let tie = pending
                        .first()
                        .map(|held| held.commit_scn == event.commit_scn)
                        .unwrap_or(true);
                    if !tie && !self.flush_commits(&mut pending) {
                        break;
                    }
                    pending.push(event);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if !self.flush_commits(&mut pending) {
                        break;
                    }
                    if self.ctx.soft_shutdown() {
                        break;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    self.flush_commits(&mut pending);
                    break;
                }
            }
        }
    }

    /// Emit held commits, ties broken by the earliest start SCN. False when
    /// a commit failed and the pipeline is going down.
    fn flush_commits(&self, pending: &mut Vec<CommitEvent>) -> bool {
        if pending.is_empty() {
            return true;
        }
        pending.sort_by_key(|event| (event.commit_scn, event.start_scn));
        for event in pending.drain(..) {
            if let Err(e) = self.process_commit(&event) {
                tracing::error!(code = e.code(), error = %e, xid = %event.xid, "commit processing failed");
                self.ctx.stop_hard();
                return false;
            }
        }
        true
    }

    // --- parser side ---------------------------------------------------

    /// Called by the parser after draining each LWN. Advances the
    /// checkpoint position and enqueues a checkpoint message.
    pub fn process_checkpoint(
        &self,
        scn: Scn,
        sequence: Seq,
        timestamp: u32,
        offset: FileOffset,
        switch_redo: bool,
    ) -> Result<()> {
        {
            let mut lwn = self.lwn.lock();
            if lwn.scn != scn {
                lwn.scn = scn;
                lwn.idx = 0;
            }
        }
        let data = match self.format.kind {
            OutputKind::Json => json::checkpoint_message(scn, sequence, timestamp, offset, switch_redo),
            OutputKind::Binary => binary::encode_checkpoint(scn, sequence, timestamp, offset, switch_redo),
        };
        self.append_message(msg_flags::CHECKPOINT, 0, data)?;
        metrics::counter!("redoflow_builder_checkpoints_total").increment(1);
        Ok(())
    }

    /// Current LWN index; the parser records it in checkpoints.
    pub fn lwn_idx(&self) -> u64 {
        self.lwn.lock().idx
    }

    // --- commit processing ---------------------------------------------

    pub fn process_commit(&self, event: &CommitEvent) -> Result<()> {
        // Output below the consumer's start point is suppressed.
        let first_data_scn = self.metadata.first_data_scn();
        if !first_data_scn.is_none() && event.commit_scn < first_data_scn {
            self.txbuf.free_transaction(event.handle);
            return Ok(());
        }

        let schema = self.metadata.schema.read();
        let mut emit = Emit::new(self, event);

        if !self.format.message.skip_begin() {
            emit.begin()?;
        }

        // Stream the chunk list; supplemental records merge into the DML
        // they follow, so one op is held back until its successor arrives.
        let mut pending: Option<(RedoOp, u32)> = None;
        loop {
            let Some(chunk) = self.txbuf.next_output_chunk(event.handle)? else {
                break;
            };
            for entry in entries(std::slice::from_ref(&chunk)) {
                let header = decode_entry_header(entry)?;
                if header.flags & ENTRY_FLAG_DEAD != 0 {
                    continue;
                }
                let op = decode_entry_op(entry)?;
                match op {
                    RedoOp::LobWrite { lob_id, page_no, data } => {
                        self.lob.lock().add_page(lob_id, page_no, data);
                    }
                    RedoOp::Supplemental { dba, slot, key } => {
                        if let Some((
                            RedoOp::Update { dba: pd, slot: ps, before, .. }
                            | RedoOp::Delete { dba: pd, slot: ps, before },
                            _,
                        )) = &mut pending
                        {
                            if *pd == dba && *ps == slot {
                                for col in key {
                                    if !before.iter().any(|c| c.col == col.col) {
                                        before.push(col);
                                    }
                                }
                                continue;
                            }
                        }
                        tracing::debug!(dba, slot, "supplemental record without a matching row op");
                    }
                    RedoOp::PartialRollback { .. } | RedoOp::Begin { .. } | RedoOp::Commit { .. } => {}
                    other => {
                        if let Some((prev, prev_obj)) = pending.take() {
                            emit.op(&schema, prev, prev_obj)?;
                        }
                        pending = Some((other, header.obj));
                    }
                }
            }
            self.txbuf.release_output_chunk(chunk);
        }
        if let Some((prev, prev_obj)) = pending.take() {
            emit.op(&schema, prev, prev_obj)?;
        }

        if !self.format.message.skip_commit() {
            emit.commit()?;
        }
        emit.finish()?;

        drop(schema);
        self.lob.lock().clear();
        self.txbuf.free_transaction(event.handle);
        metrics::counter!("redoflow_builder_transactions_total").increment(1);
        Ok(())
    }

    pub fn lob_ctx(&self) -> &Mutex<LobCtx> {
        &self.lob
    }

    // --- output queue ---------------------------------------------------

    /// Append one serialized message; blocks on queue space.
    pub fn append_message(&self, flags: u8, tag_len: u32, data: Vec<u8>) -> Result<u64> {
        let need = data.len();
        if need > self.pool.chunk_size() {
            return Err(RedoError::runtime(
                50020,
                format!("message of {need} bytes exceeds the output chunk size"),
            ));
        }
        let (scn, idx) = {
            let mut lwn = self.lwn.lock();
            let pair = (lwn.scn, lwn.idx);
            lwn.idx += 1;
            pair
        };

        let mut state = self.queue.lock();
        loop {
            let has_room = state
                .nodes
                .back()
                .map(|node| node.used + need <= node.data.capacity())
                .unwrap_or(false);
            if has_room {
                break;
            }
            match self.pool.acquire(MemoryKind::Builder) {
                Some(chunk) => {
                    state.nodes.push_back(QueueNode { data: chunk, used: 0, msgs: Vec::new() });
                    break;
                }
                None => {
                    // Wait for the writer to confirm and release a node;
                    // this is ordinary back-pressure, not a deadlock.
                    self.cond_space.wait_for(&mut state, QUEUE_WAIT);
                    if self.ctx.hard_shutdown() {
                        return Err(RedoError::runtime(50021, "shutdown while queueing output"));
                    }
                }
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        let node = state.nodes.back_mut().expect("node ensured above");
        let offset = node.used;
        node.data.bytes_mut()[offset..offset + need].copy_from_slice(&data);
        node.used += need;
        node.msgs.push(MsgMeta { id, offset, len: need, scn, idx, flags, tag_len });
        self.cond_data.notify_all();
        metrics::counter!("redoflow_builder_messages_total").increment(1);
        Ok(id)
    }

    /// Next message after `last_id`, copied out. Blocks up to `wait`.
    pub fn poll_message(&self, last_id: u64, wait: Duration) -> Option<OutputMessage> {
        let mut state = self.queue.lock();
        loop {
            for node in state.nodes.iter() {
                for msg in node.msgs.iter() {
                    if msg.id > last_id {
                        let data = node.data.bytes()[msg.offset..msg.offset + msg.len].to_vec();
                        return Some(OutputMessage {
                            id: msg.id,
                            scn: msg.scn,
                            idx: msg.idx,
                            flags: msg.flags,
                            tag_len: msg.tag_len,
                            data,
                        });
                    }
                }
            }
            if wait.is_zero() || self.ctx.soft_shutdown() {
                return None;
            }
            if self.cond_data.wait_for(&mut state, wait).timed_out() {
                return None;
            }
        }
    }

    /// Confirm all messages with `id <= max_id`; exhausted nodes return
    /// their chunks to the pool.
    pub fn confirm(&self, max_id: u64) {
        let mut released = Vec::new();
        {
            let mut state = self.queue.lock();
            if max_id <= state.confirmed_id {
                return;
            }
            state.confirmed_id = max_id;
            while let Some(node) = state.nodes.front() {
                let fully = node.msgs.last().map(|m| m.id <= max_id).unwrap_or(true);
                // Never release the node the builder is still filling.
                if fully && state.nodes.len() > 1 {
                    released.push(state.nodes.pop_front().expect("front exists").data);
                } else {
                    break;
                }
            }
            self.cond_space.notify_all();
        }
        for chunk in released {
            self.pool.release(MemoryKind::Builder, chunk);
        }
    }

    pub fn confirmed_id(&self) -> u64 {
        self.queue.lock().confirmed_id
    }

    /// Largest message id at or below `(scn, idx)`; the writer resumes
    /// sending after it. Zero when nothing resident is that old.
    pub fn find_resume_id(&self, scn: Scn, idx: u64) -> u64 {
        let state = self.queue.lock();
        let mut resume = 0u64;
        for node in state.nodes.iter() {
            for msg in node.msgs.iter() {
                if msg.scn < scn || (msg.scn == scn && msg.idx <= idx) {
                    resume = resume.max(msg.id);
                }
            }
        }
        resume
    }

    /// Count of queued (not yet confirmed) messages; used by tests and the
    /// writer's drain-on-shutdown.
    pub fn pending_messages(&self) -> usize {
        let state = self.queue.lock();
        state
            .nodes
            .iter()
            .flat_map(|n| n.msgs.iter())
            .filter(|m| m.id > state.confirmed_id)
            .count()
    }
}

/// Per-transaction emission state: accumulates ops for the "full" message
/// format, emits one message per op otherwise.
struct Emit<'a> {
    builder: &'a Builder,
    event: &'a CommitEvent,
    ops: Vec<serde_json::Value>,
    op_index: u64,
    tag: Vec<u8>,
}

impl<'a> Emit<'a> {
    fn new(builder: &'a Builder, event: &'a CommitEvent) -> Self {
        Emit { builder, event, ops: Vec::new(), op_index: 0, tag: Vec::new() }
    }

    fn begin(&mut self) -> Result<()> {
        let value = json::begin_op(&self.builder.format, self.event);
        self.push(value, 0)
    }

    fn commit(&mut self) -> Result<()> {
        let value = json::commit_op(&self.builder.format, self.event);
        self.push(value, 0)
    }

    fn op(
        &mut self,
        schema: &crate::metadata::schema::Schema,
        op: RedoOp,
        obj: u32,
    ) -> Result<()> {
        let lob = self.builder.lob.lock();
        let encoded = json::dml_ops(
            &self.builder.format,
            &self.builder.ctx,
            schema,
            &lob,
            self.event,
            obj,
            &op,
        )?;
        drop(lob);
        for (value, tag) in encoded {
            if !tag.is_empty() {
                self.tag = tag;
            }
            let flags = if matches!(op, RedoOp::Ddl { .. }) { msg_flags::DDL } else { msg_flags::REDO };
            self.push(value, flags)?;
        }
        Ok(())
    }

    fn push(&mut self, value: serde_json::Value, flags: u8) -> Result<()> {
        if self.builder.format.message.is_full() {
            self.ops.push(value);
            return Ok(());
        }
        let data = json::wrap_message(
            &self.builder.format,
            self.event,
            self.op_index,
            vec![value],
        );
        self.op_index += 1;
        let tag = std::mem::take(&mut self.tag);
        self.send(flags, tag, data)
    }

    fn finish(&mut self) -> Result<()> {
        if !self.builder.format.message.is_full() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.ops);
        if ops.is_empty() {
            return Ok(());
        }
        let data = json::wrap_message(&self.builder.format, self.event, 0, ops);
        let tag = std::mem::take(&mut self.tag);
        self.send(msg_flags::REDO, tag, data)
    }

    fn send(&self, flags: u8, tag: Vec<u8>, value: serde_json::Value) -> Result<()> {
        let tag_len = tag.len() as u32;
        let body = match self.builder.format.kind {
            OutputKind::Json => serde_json::to_vec(&value)?,
            OutputKind::Binary => {
                let (c_scn, c_idx) = {
                    let lwn = self.builder.lwn.lock();
                    (lwn.scn, lwn.idx)
                };
                binary::encode_message(&self.builder.format, self.event, c_scn, c_idx, &value)?
            }
        };
        let mut data = tag;
        data.extend_from_slice(&body);
        self.builder.append_message(flags, tag_len, data)?;
        Ok(())
    }
}

pub use json::checkpoint_message;
