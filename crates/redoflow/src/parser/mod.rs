//! The redo parse loop: blocks in, transactions out.
//!
//! One parser drives one log file. Blocks are consumed in file order;
//! records are reassembled across block boundaries into an LWN heap and,
//! once the group is complete, drained in `(scn, sub-scn, position)` order
//! to the opcode handlers. Each drained LWN ends with a checkpoint: a
//! boundary message into the builder and a durable record through the
//! metadata store carrying the oldest in-flight transaction's position.

pub mod opcode;
pub mod record;

use crate::builder::Builder;
use crate::context::Ctx;
use crate::error::{RedoError, Result};
use crate::memory::{Chunk, ChunkPool, MemoryKind};
use crate::metadata::Metadata;
use crate::reader::{Reader, RedoCode, BLOCK_HEADER_SIZE};
use crate::transaction::TransactionBuffer;
use crate::types::{BlockNum, FileOffset, Scn, Seq, SubScn};
use opcode::{decode_record, read_lwn_header, read_record_header};
use record::{RedoOp, RECORD_HEADER_SIZE, VLD_LWN_START};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::Arc;

/// One assembled record inside the LWN heap; ordering is the drain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct LwnMember {
    scn: Scn,
    sub_scn: SubScn,
    block: BlockNum,
    page_offset: u16,
    chunk: u32,
    offset: u32,
    size: u32,
}

/// Heap storage for one LWN's records: a list of parser chunks with the
/// members ordered in a binary min-heap.
struct LwnHeap {
    pool: Arc<ChunkPool>,
    ctx: Arc<Ctx>,
    chunks: Vec<Chunk>,
    members: BinaryHeap<Reverse<LwnMember>>,
    allocated_max: usize,
}

impl LwnHeap {
    fn new(pool: Arc<ChunkPool>, ctx: Arc<Ctx>) -> Result<Self> {
        let first = pool.acquire_wait(MemoryKind::Parser, &ctx)?;
        Ok(LwnHeap { pool, ctx, chunks: vec![first], members: BinaryHeap::new(), allocated_max: 1 })
    }

    /// Reserve space for one record; returns its location.
    fn reserve(&mut self, size: usize) -> Result<(u32, u32)> {
        let cap = self.pool.chunk_size();
        if size > cap {
            return Err(RedoError::redo(40040, format!("record of {size} bytes exceeds chunk size")));
        }
        let fits = {
            let last = self.chunks.last().expect("heap keeps one chunk");
            last.len + size <= cap
        };
        if !fits {
            let chunk = self.pool.acquire_wait(MemoryKind::Parser, &self.ctx)?;
            self.chunks.push(chunk);
            self.allocated_max = self.allocated_max.max(self.chunks.len());
        }
        let idx = (self.chunks.len() - 1) as u32;
        let last = self.chunks.last_mut().expect("chunk ensured above");
        let offset = last.len as u32;
        last.len += size;
        Ok((idx, offset))
    }

    fn write(&mut self, chunk: u32, offset: u32, pos: u32, data: &[u8]) {
        let start = (offset + pos) as usize;
        self.chunks[chunk as usize].bytes_mut()[start..start + data.len()].copy_from_slice(data);
    }

    fn push(&mut self, member: LwnMember) {
        self.members.push(Reverse(member));
    }

    fn pop(&mut self) -> Option<LwnMember> {
        self.members.pop().map(|Reverse(m)| m)
    }

    fn record_bytes(&self, member: &LwnMember) -> &[u8] {
        let start = member.offset as usize;
        &self.chunks[member.chunk as usize].bytes()[start..start + member.size as usize]
    }

    /// Release everything but the first chunk, ready for the next LWN.
    fn reset(&mut self) {
        while self.chunks.len() > 1 {
            let chunk = self.chunks.pop().expect("len checked");
            self.pool.release(MemoryKind::Parser, chunk);
        }
        self.chunks[0].len = 0;
        self.members.clear();
    }
}

impl Drop for LwnHeap {
    fn drop(&mut self) {
        while let Some(chunk) = self.chunks.pop() {
            self.pool.release(MemoryKind::Parser, chunk);
        }
    }
}

/// In-flight record copy state while a record crosses blocks.
struct RecordCopy {
    member: LwnMember,
    left: u32,
    pos: u32,
}

pub struct Parser {
    ctx: Arc<Ctx>,
    metadata: Arc<Metadata>,
    builder: Arc<Builder>,
    txbuf: Arc<TransactionBuffer>,
    pub group: i32,
    pub path: PathBuf,
    pub sequence: Seq,
    pub first_scn: Scn,
    pub next_scn: Scn,
    heap: Option<LwnHeap>,
    lwn_scn: Scn,
    lwn_timestamp: u32,
}

impl Parser {
    pub fn new(
        ctx: Arc<Ctx>,
        metadata: Arc<Metadata>,
        builder: Arc<Builder>,
        txbuf: Arc<TransactionBuffer>,
        group: i32,
        path: PathBuf,
        sequence: Seq,
    ) -> Self {
        Parser {
            ctx,
            metadata,
            builder,
            txbuf,
            group,
            path,
            sequence,
            first_scn: Scn::NONE,
            next_scn: Scn::NONE,
            heap: None,
            lwn_scn: Scn::ZERO,
            lwn_timestamp: 0,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "group: {} scn: {} to {} seq: {} path: {}",
            self.group,
            self.first_scn,
            self.next_scn,
            self.sequence,
            self.path.display()
        )
    }

    /// Parse the whole file the reader currently serves. Returns the
    /// reader's terminal code; record-level failures come back as errors.
    pub fn parse(&mut self, reader: &Arc<Reader>) -> Result<RedoCode> {
        let block_size = reader.block_size();
        if block_size == 0 {
            return Err(RedoError::redo(40041, "parse started before the header was read"));
        }
        let bs = u64::from(block_size);

        if self.first_scn.is_none() && !reader.first_scn().is_zero() {
            self.first_scn = reader.first_scn();
            self.next_scn = reader.next_scn();
        }

        // Identity guards: never mix incarnations.
        if self.metadata.resetlogs() == 0 {
            self.metadata.set_resetlogs(reader.resetlogs());
        }
        if self.metadata.resetlogs() != reader.resetlogs() {
            return Err(RedoError::redo(
                40042,
                format!(
                    "invalid resetlogs value (found: {}, expected: {})",
                    reader.resetlogs(),
                    self.metadata.resetlogs()
                ),
            ));
        }
        if reader.activation() != 0 && self.metadata.activation() != reader.activation() {
            tracing::info!(activation = reader.activation(), "new activation detected");
            self.metadata.set_activation(reader.activation());
        }

        // Resume position: a prior checkpoint may put us past block 2.
        let mut lwn_confirmed_block: BlockNum = 2;
        let resume = self.metadata.file_offset();
        if resume > FileOffset::ZERO {
            if !resume.matches_block_size(block_size) {
                return Err(RedoError::redo(
                    40043,
                    format!("offset {resume} is not a multiple of the block size {block_size}"),
                ));
            }
            lwn_confirmed_block = resume.block(block_size);
            self.metadata.set_file_offset(FileOffset::ZERO);
        }

        tracing::info!(code = 0u32, "processing redo log: {}", self.describe());
        reader.start_reading(u64::from(lwn_confirmed_block) * bs);

        if self.heap.is_none() {
            self.heap = Some(LwnHeap::new(self.txbuf.pool().clone(), self.ctx.clone())?);
        }

        let mut current_block = lwn_confirmed_block;
        let mut lwn_end_block = lwn_confirmed_block;
        let mut lwn_num_cnt: u16 = 0;
        let mut lwn_num_max: u16 = 0;
        let mut copy: Option<RecordCopy> = None;
        let mut confirmed = u64::from(lwn_confirmed_block) * bs;
        let mut switch_redo = false;
        let mut block_buf = vec![0u8; block_size as usize];
        let chunk_size = self.txbuf.pool().chunk_size() as u64;

        loop {
            while confirmed < reader.buffer_end() && !self.ctx.soft_shutdown() {
                let pos = u64::from(current_block) * bs;
                reader.with_block(pos, |block| block_buf.copy_from_slice(block));

                // New LWN starts exactly where the previous one ended.
                if current_block == lwn_end_block {
                    let header = read_record_header(&block_buf[BLOCK_HEADER_SIZE..])?;
                    if header.vld & VLD_LWN_START == 0 {
                        return Err(RedoError::redo(
                            40044,
                            format!("did not find lwn at block {current_block}"),
                        ));
                    }
                    let lwn = read_lwn_header(&block_buf[BLOCK_HEADER_SIZE..])?;
                    lwn_end_block = current_block + lwn.blocks;
                    self.lwn_scn = lwn.scn;
                    self.lwn_timestamp = lwn.timestamp;
                    if lwn_num_cnt == 0 {
                        lwn_num_max = lwn.num_max;
                        if self.lwn_scn < reader.first_scn()
                            || (!reader.next_scn().is_none() && self.lwn_scn > reader.next_scn())
                        {
                            return Err(RedoError::redo(
                                40045,
                                format!("invalid lwn scn: {}", self.lwn_scn),
                            ));
                        }
                    } else if lwn.num_max != lwn_num_max {
                        return Err(RedoError::redo(
                            40046,
                            format!("invalid lwn max: {}/{}", lwn.num_max, lwn_num_max),
                        ));
                    }
                    lwn_num_cnt += 1;
                }

                // Records inside this block. A record's bytes (header
                // included) are copied into the heap; the copy may resume
                // from a previous block.
                let mut block_offset = BLOCK_HEADER_SIZE;
                while block_offset < block_size as usize {
                    if copy.is_none() {
                        if block_offset + RECORD_HEADER_SIZE >= block_size as usize {
                            break;
                        }
                        let size = u32::from_le_bytes(
                            block_buf[block_offset..block_offset + 4].try_into().expect("4 bytes"),
                        );
                        if size == 0 {
                            break;
                        }
                        let header = read_record_header(&block_buf[block_offset..])?;
                        let heap = self.heap.as_mut().expect("heap initialized");
                        let (chunk, offset) = heap.reserve(size as usize)?;
                        let member = LwnMember {
                            scn: header.scn,
                            sub_scn: header.sub_scn,
                            block: current_block,
                            page_offset: block_offset as u16,
                            chunk,
                            offset,
                            size,
                        };
                        heap.push(member);
                        copy = Some(RecordCopy { member, left: size, pos: 0 });
                    }
                    let finished = {
                        let state = copy.as_mut().expect("copy state just ensured");
                        let take = (state.left as usize).min(block_size as usize - block_offset);
                        let heap = self.heap.as_mut().expect("heap initialized");
                        heap.write(
                            state.member.chunk,
                            state.member.offset,
                            state.pos,
                            &block_buf[block_offset..block_offset + take],
                        );
                        state.pos += take as u32;
                        state.left -= take as u32;
                        block_offset += take;
                        state.left == 0
                    };
                    if finished {
                        copy = None;
                    }
                }

                current_block += 1;
                confirmed += bs;

                // Give a fully consumed ring chunk back.
                if confirmed % chunk_size == 0 {
                    let num = ((confirmed - 1) / chunk_size) as usize;
                    reader.buffer_free(num);
                    reader.confirm_read_data(confirmed);
                }

                // LWN complete: drain in order, then checkpoint.
                if current_block == lwn_end_block && lwn_num_cnt == lwn_num_max {
                    if copy.is_some() {
                        return Err(RedoError::redo(
                            40047,
                            "lwn ended inside an unfinished record",
                        ));
                    }
                    let lwn_bytes = u64::from(current_block - lwn_confirmed_block) * bs;
                    self.drain_lwn(block_size)?;
                    self.checkpoint(current_block, block_size, lwn_bytes, false)?;
                    lwn_num_cnt = 0;
                    lwn_confirmed_block = current_block;
                    metrics::counter!("redoflow_parser_bytes_parsed_total").increment(lwn_bytes);
                } else if lwn_num_cnt > lwn_num_max && lwn_num_max != 0 {
                    return Err(RedoError::redo(
                        40048,
                        format!("lwn overflow: {lwn_num_cnt}/{lwn_num_max}"),
                    ));
                }
            }

            // File drained so far; decide between waiting and finishing.
            if !switch_redo
                && self.lwn_scn > Scn::ZERO
                && confirmed == reader.buffer_end()
                && reader.ret() == RedoCode::Finished
                && self.past_first_data()
            {
                switch_redo = true;
                self.builder.process_checkpoint(
                    self.lwn_scn,
                    self.sequence,
                    self.lwn_timestamp,
                    FileOffset::from_block(current_block, block_size),
                    true,
                )?;
            }

            if self.ctx.soft_shutdown() {
                if self.lwn_scn > Scn::ZERO && self.past_first_data() {
                    self.builder.process_checkpoint(
                        self.lwn_scn,
                        self.sequence,
                        self.lwn_timestamp,
                        FileOffset::from_block(current_block, block_size),
                        false,
                    )?;
                }
                return Ok(RedoCode::Shutdown);
            }

            reader.confirm_read_data(confirmed);
            match reader.check_finished(confirmed) {
                None => continue,
                Some(code) => {
                    if code == RedoCode::Finished
                        && self.next_scn.is_none()
                        && !reader.next_scn().is_none()
                    {
                        self.next_scn = reader.next_scn();
                    }
                    if matches!(code, RedoCode::Stopped | RedoCode::Overwritten) {
                        self.metadata
                            .set_file_offset(FileOffset::from_block(lwn_confirmed_block, block_size));
                    }
                    if let Some(heap) = self.heap.as_mut() {
                        heap.reset();
                    }
                    return Ok(code);
                }
            }
        }
    }

    fn past_first_data(&self) -> bool {
        // The group containing the start position checkpoints too, so a
        // fresh pipeline records its very first position durably.
        let first_data = self.metadata.first_data_scn();
        first_data.is_none() || self.lwn_scn >= first_data
    }

    /// Drain the completed LWN heap to the opcode handlers in order.
    fn drain_lwn(&mut self, block_size: u32) -> Result<()> {
        loop {
            let (member, decoded) = {
                let heap = self.heap.as_mut().expect("heap initialized");
                let Some(member) = heap.pop() else { break };
                let bytes = heap.record_bytes(&member);
                let decoded = match decode_record(bytes) {
                    Ok(d) => d,
                    Err(e) => {
                        if self.ctx.is_flag_set(crate::config::RedoFlag::IgnoreDataErrors) {
                            tracing::error!(code = e.code(), error = %e, "skipping malformed record");
                            tracing::warn!(code = 60013u32, "forced to continue working in spite of error");
                            continue;
                        }
                        return Err(e);
                    }
                };
                (member, decoded)
            };
            let Some(decoded) = decoded else {
                tracing::debug!(block = member.block, "record with unhandled opcode skipped");
                continue;
            };
            self.route(decoded, member.block, block_size)?;
        }
        self.heap.as_mut().expect("heap initialized").reset();
        Ok(())
    }

    /// Route one decoded record into the transaction layer.
    fn route(
        &mut self,
        decoded: record::DecodedRecord,
        block: BlockNum,
        block_size: u32,
    ) -> Result<()> {
        let meta = decoded.meta;
        let offset = FileOffset::from_block(block, block_size);
        if meta.xid.is_zero() && !matches!(decoded.op, RedoOp::Ddl { .. }) {
            tracing::debug!(block, "record without a transaction id skipped");
            return Ok(());
        }
        match decoded.op {
            RedoOp::Begin { name } => {
                self.txbuf.begin(meta.xid, meta.scn, self.sequence, offset, &name);
            }
            RedoOp::Commit { rollback } => match self.txbuf.handle_of(meta.xid) {
                Some(handle) => {
                    if rollback {
                        self.txbuf.rollback(handle)?;
                    } else {
                        self.txbuf.commit(handle, meta.scn, self.sequence)?;
                    }
                }
                None => {
                    tracing::debug!(xid = %meta.xid, "commit for an unknown transaction skipped");
                }
            },
            RedoOp::PartialRollback { dba, slot } => {
                if let Some(handle) = self.txbuf.handle_of(meta.xid) {
                    if !self.txbuf.partial_rollback(handle, meta.obj, dba, slot) {
                        tracing::debug!(
                            xid = %meta.xid,
                            dba,
                            slot,
                            "partial rollback without a matching row operation"
                        );
                    }
                }
            }
            op => {
                let handle = self.txbuf.get_or_create(meta.xid, meta.scn, self.sequence, offset);
                self.txbuf.append_op(handle, &meta, &op)?;
            }
        }
        Ok(())
    }

    /// LWN checkpoint: builder boundary plus the durable metadata record.
    fn checkpoint(
        &mut self,
        current_block: BlockNum,
        block_size: u32,
        bytes: u64,
        switch_redo: bool,
    ) -> Result<()> {
        if !self.past_first_data() {
            metrics::counter!("redoflow_parser_checkpoints_skipped_total").increment(1);
            return Ok(());
        }
        let offset = FileOffset::from_block(current_block, block_size);
        self.builder.process_checkpoint(
            self.lwn_scn,
            self.sequence,
            self.lwn_timestamp,
            offset,
            switch_redo,
        )?;
        let (min_seq, min_offset, min_xid) = self.txbuf.min_position();
        self.metadata.checkpoint(
            self.lwn_scn,
            self.lwn_timestamp,
            self.sequence,
            offset,
            bytes,
            min_seq,
            min_offset,
            min_xid,
        )?;
        Ok(())
    }
}
