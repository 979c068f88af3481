//! Block-aligned, checksum-verified reading of redo log files.
//!
//! One reader serves one log file at a time. It runs on its own thread as a
//! small state machine (`Sleeping → Check/Update → Read`), streams blocks
//! into a ring of pool chunks, and publishes progress through
//! `buffer_start`/`buffer_end` so the parser can consume without sharing a
//! lock with file I/O. Back-pressure is a condvar wait when the ring fills;
//! forward progress is a notify when new blocks are committed.
//!
//! Layout facts the reader enforces:
//! - block 0 is the file header: a zero first byte, the block-size marker in
//!   byte 1, the block size at offset 20, the endianness magic at 28..32;
//! - block 1 is the redo header: database version, SID, activation,
//!   resetlogs, first/next SCN at fixed offsets;
//! - every block starts with a 16-byte header carrying `(marker, block
//!   number, sequence, checksum)`; the checksum is a XOR fold over 16-bit
//!   words with the checksum field itself nulled.

use crate::context::Ctx;
use crate::memory::{Chunk, ChunkPool, MemoryKind};
use crate::types::{Activation, BlockNum, RedoTime, Resetlogs, Scn, Seq};
use bytes::Buf;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Size of the per-block header.
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Endianness magic at bytes 28..32 of the file header block.
pub const ENDIAN_MAGIC_LE: [u8; 4] = [0x7D, 0x7C, 0x7B, 0x7A];
pub const ENDIAN_MAGIC_BE: [u8; 4] = [0x7A, 0x7B, 0x7C, 0x7D];

/// Offsets inside the redo header (block 1), relative to the block start.
pub const RH_VERSION: usize = 20;
pub const RH_SID: usize = 28;
pub const RH_ACTIVATION: usize = 52;
pub const RH_NUM_BLOCKS: usize = 156;
pub const RH_RESETLOGS: usize = 160;
pub const RH_FIRST_SCN: usize = 180;
pub const RH_FIRST_TIME: usize = 188;
pub const RH_NEXT_SCN: usize = 192;
pub const RH_NEXT_TIME: usize = 200;

/// Offsets inside the file header (block 0).
pub const FH_BLOCK_SIZE: usize = 20;
pub const FH_ENDIAN: usize = 28;

const CRC_RETRY_MAX: u32 = 20;
const CRC_RETRY_SLEEP: Duration = Duration::from_millis(10);
const STATE_WAIT: Duration = Duration::from_secs(10);
/// Consecutive bad header reloads tolerated while polling an online tail.
const TAIL_RETRY_MAX: u32 = 50;

/// Marker byte for a block size; byte 1 of every block.
pub fn block_size_marker(block_size: u32) -> u8 {
    match block_size {
        4096 => 0x82,
        _ => 0x22,
    }
}

/// XOR fold over 16-bit little-endian words, with the checksum field
/// (bytes 14..16) treated as zero.
pub fn block_checksum(block: &[u8]) -> u16 {
    let mut acc: u16 = 0;
    let mut i = 0;
    while i + 1 < block.len() {
        if i != 14 {
            acc ^= u16::from_le_bytes([block[i], block[i + 1]]);
        }
        i += 2;
    }
    acc
}

/// Result codes of reader operations; also the parse loop's exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoCode {
    Ok,
    /// An online log was reused for a newer sequence
    Overwritten,
    /// The file is complete and the header names its end SCN
    Finished,
    /// No more data and no end SCN
    Stopped,
    Shutdown,
    /// A zeroed block: data not written yet
    Empty,
    ErrorRead,
    ErrorWrite,
    ErrorSequence,
    ErrorCrc,
    ErrorBlock,
    ErrorBadData,
    Error,
}

impl RedoCode {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            RedoCode::ErrorRead
                | RedoCode::ErrorWrite
                | RedoCode::ErrorSequence
                | RedoCode::ErrorCrc
                | RedoCode::ErrorBlock
                | RedoCode::ErrorBadData
                | RedoCode::Error
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Sleeping,
    Check,
    Update,
    Read,
}

/// Shared reader state; guarded by one mutex, signalled by three condvars.
struct ReaderState {
    status: Status,
    ret: RedoCode,
    file_name: PathBuf,
    file_size: u64,
    block_size: u32,
    sequence: Seq,
    resetlogs: Resetlogs,
    activation: Activation,
    version: u32,
    sid: String,
    first_scn: Scn,
    next_scn: Scn,
    first_time: RedoTime,
    next_time: RedoTime,
    num_blocks: BlockNum,
    /// Read-ahead cursor in bytes; `buffer_end <= buffer_scan`
    buffer_scan: u64,
    /// Scanned-but-unpublished regions awaiting the verify delay:
    /// `(end position, scan time in microseconds)`
    pending: VecDeque<(u64, i64)>,
}

/// One log-file reader plus its ring of chunks.
pub struct Reader {
    ctx: Arc<Ctx>,
    pool: Arc<ChunkPool>,
    database: String,
    /// 0 = archived log, >0 = online log group
    pub group: i32,
    block_checksum_configured: bool,
    redo_read_sleep_us: u64,
    redo_verify_delay_us: u64,
    redo_copy_path: Option<PathBuf>,
    ring_len: usize,
    ring: Vec<Mutex<Option<Chunk>>>,
    state: Mutex<ReaderState>,
    /// Set when the replicator retires this reader
    stopped: std::sync::atomic::AtomicBool,
    buffer_start: AtomicU64,
    buffer_end: AtomicU64,
    cond_buffer_full: Arc<Condvar>,
    cond_reader_sleeping: Arc<Condvar>,
    cond_parser_sleeping: Arc<Condvar>,
}

/// File handles owned by the reader thread alone.
struct ReaderIo {
    file: Option<File>,
    copy_file: Option<File>,
    copy_sequence: Seq,
    last_read: u32,
    /// Consecutive header-reload failures while polling the tail
    tail_retries: u32,
}

impl Reader {
    pub fn new(
        ctx: Arc<Ctx>,
        pool: Arc<ChunkPool>,
        database: impl Into<String>,
        group: i32,
        cfg: &crate::config::ReaderConfig,
    ) -> Arc<Self> {
        let ring_len = pool.cap(MemoryKind::Reader);
        let reader = Arc::new(Reader {
            ctx: ctx.clone(),
            pool,
            database: database.into(),
            group,
            block_checksum_configured: cfg.block_checksum,
            redo_read_sleep_us: cfg.redo_read_sleep_us,
            redo_verify_delay_us: cfg.redo_verify_delay_us,
            redo_copy_path: cfg.redo_copy_path.clone(),
            ring_len,
            ring: (0..ring_len).map(|_| Mutex::new(None)).collect(),
            state: Mutex::new(ReaderState {
                status: Status::Sleeping,
                ret: RedoCode::Ok,
                file_name: PathBuf::new(),
                file_size: 0,
                block_size: 0,
                sequence: Seq::ZERO,
                resetlogs: 0,
                activation: 0,
                version: 0,
                sid: String::new(),
                first_scn: Scn::NONE,
                next_scn: Scn::NONE,
                first_time: 0,
                next_time: 0,
                num_blocks: 0,
                buffer_scan: 0,
                pending: VecDeque::new(),
            }),
            stopped: std::sync::atomic::AtomicBool::new(false),
            buffer_start: AtomicU64::new(0),
            buffer_end: AtomicU64::new(0),
            cond_buffer_full: Arc::new(Condvar::new()),
            cond_reader_sleeping: Arc::new(Condvar::new()),
            cond_parser_sleeping: Arc::new(Condvar::new()),
        });
        ctx.register_waker(reader.cond_buffer_full.clone());
        ctx.register_waker(reader.cond_reader_sleeping.clone());
        ctx.register_waker(reader.cond_parser_sleeping.clone());
        reader
    }

    pub fn spawn(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let reader = self.clone();
        std::thread::Builder::new()
            .name(format!("reader-{}", self.group))
            .spawn(move || reader.run())
            .expect("spawn reader thread")
    }

    // --- accessors ----------------------------------------------------

    pub fn block_size(&self) -> u32 {
        self.state.lock().block_size
    }

    pub fn sequence(&self) -> Seq {
        self.state.lock().sequence
    }

    pub fn resetlogs(&self) -> Resetlogs {
        self.state.lock().resetlogs
    }

    pub fn activation(&self) -> Activation {
        self.state.lock().activation
    }

    pub fn first_scn(&self) -> Scn {
        self.state.lock().first_scn
    }

    pub fn next_scn(&self) -> Scn {
        self.state.lock().next_scn
    }

    pub fn first_time(&self) -> RedoTime {
        self.state.lock().first_time
    }

    pub fn next_time(&self) -> RedoTime {
        self.state.lock().next_time
    }

    pub fn ret(&self) -> RedoCode {
        self.state.lock().ret
    }

    pub fn buffer_start(&self) -> u64 {
        self.buffer_start.load(Ordering::Acquire)
    }

    pub fn buffer_end(&self) -> u64 {
        self.buffer_end.load(Ordering::Acquire)
    }

    // --- parser-side protocol -----------------------------------------

    pub fn set_file(&self, path: PathBuf) {
        let mut state = self.state.lock();
        state.file_name = path;
        state.sequence = Seq::ZERO;
        state.first_scn = Scn::NONE;
        state.next_scn = Scn::NONE;
        state.block_size = 0;
    }

    /// Open the file and validate both header blocks. Blocks until the
    /// reader thread reports.
    pub fn check_redo_log(&self) -> RedoCode {
        self.request(Status::Check)
    }

    /// Re-read the header only; used at log switches.
    pub fn update_redo_log(&self) -> RedoCode {
        self.request(Status::Update)
    }

    fn request(&self, status: Status) -> RedoCode {
        let mut state = self.state.lock();
        state.status = status;
        state.ret = RedoCode::Ok;
        self.cond_reader_sleeping.notify_all();
        while state.status != Status::Sleeping && !self.ctx.hard_shutdown() {
            self.cond_parser_sleeping.wait_for(&mut state, STATE_WAIT);
        }
        state.ret
    }

    /// Position the consumer window and start streaming blocks.
    pub fn start_reading(&self, start_offset: u64) {
        let mut state = self.state.lock();
        self.buffer_start.store(start_offset, Ordering::Release);
        self.buffer_end.store(start_offset, Ordering::Release);
        state.buffer_scan = start_offset;
        state.pending.clear();
        state.status = Status::Read;
        state.ret = RedoCode::Ok;
        self.cond_reader_sleeping.notify_all();
    }

    /// The parser confirmed consumption below `offset`; the ring space
    /// becomes reusable.
    pub fn confirm_read_data(&self, offset: u64) {
        self.buffer_start.store(offset, Ordering::Release);
        let _state = self.state.lock();
        self.cond_buffer_full.notify_all();
    }

    /// Return ring chunk `num` to the pool; the parser calls this after
    /// consuming a whole chunk worth of blocks.
    pub fn buffer_free(&self, num: usize) {
        let mut slot = self.ring[num % self.ring_len].lock();
        if let Some(chunk) = slot.take() {
            self.pool.release(MemoryKind::Reader, chunk);
        }
    }

    /// Read block bytes at an absolute file position. The closure runs under
    /// the ring-slot lock; it must not block.
    pub fn with_block<R>(&self, pos: u64, f: impl FnOnce(&[u8]) -> R) -> R {
        let chunk_size = self.pool.chunk_size() as u64;
        let slot_idx = ((pos / chunk_size) as usize) % self.ring_len;
        let offset = (pos % chunk_size) as usize;
        let block_size = self.block_size() as usize;
        let slot = self.ring[slot_idx].lock();
        let chunk = slot.as_ref().expect("block read from unfilled ring slot");
        f(&chunk.bytes()[offset..offset + block_size])
    }

    /// Wait for more data below `confirmed`. `None` means new data is
    /// available; a code means this file is done.
    pub fn check_finished(&self, confirmed: u64) -> Option<RedoCode> {
        let mut state = self.state.lock();
        loop {
            if self.ctx.soft_shutdown() {
                return Some(RedoCode::Shutdown);
            }
            if self.buffer_end() > confirmed {
                return None;
            }
            if state.status != Status::Read || state.ret != RedoCode::Ok {
                return Some(state.ret);
            }
            self.cond_parser_sleeping.wait_for(&mut state, STATE_WAIT);
        }
    }

    /// Retire this reader; its thread exits at the next loop turn.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.status = Status::Sleeping;
        self.cond_reader_sleeping.notify_all();
        self.cond_parser_sleeping.notify_all();
        self.cond_buffer_full.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Return every ring chunk to the pool; called after the thread joins.
    pub fn release_buffers(&self) {
        for num in 0..self.ring_len {
            self.buffer_free(num);
        }
    }

    // --- reader thread ------------------------------------------------

    pub fn run(self: Arc<Self>) {
        let mut io = ReaderIo {
            file: None,
            copy_file: None,
            copy_sequence: Seq::NONE,
            last_read: 0,
            tail_retries: 0,
        };
        loop {
            if self.ctx.hard_shutdown() || self.is_stopped() {
                break;
            }
            let status = {
                let mut state = self.state.lock();
                if state.status == Status::Sleeping {
                    if self.ctx.soft_shutdown() || self.is_stopped() {
                        break;
                    }
                    self.cond_reader_sleeping.wait_for(&mut state, STATE_WAIT);
                }
                state.status
            };
            match status {
                Status::Sleeping => continue,
                Status::Check => {
                    let ret = self.open_and_reload(&mut io, false);
                    self.finish_request(ret);
                }
                Status::Update => {
                    let ret = self.open_and_reload(&mut io, true);
                    self.finish_request(ret);
                }
                Status::Read => {
                    let ret = self.read_loop(&mut io);
                    let mut state = self.state.lock();
                    state.ret = ret;
                    // A Check/Update request may have arrived mid-read.
                    if state.status == Status::Read {
                        state.status = Status::Sleeping;
                    }
                    self.cond_parser_sleeping.notify_all();
                }
            }
        }
        // Unblock anything still waiting on us.
        let _state = self.state.lock();
        self.cond_parser_sleeping.notify_all();
        self.cond_buffer_full.notify_all();
    }

    fn finish_request(&self, ret: RedoCode) {
        let mut state = self.state.lock();
        state.ret = ret;
        state.status = Status::Sleeping;
        self.cond_parser_sleeping.notify_all();
    }

    fn open_and_reload(&self, io: &mut ReaderIo, update_only: bool) -> RedoCode {
        let file_name = self.state.lock().file_name.clone();
        if io.file.is_none() || !update_only {
            match File::open(&file_name) {
                Ok(file) => {
                    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
                    io.file = Some(file);
                    let mut state = self.state.lock();
                    state.file_size = len;
                }
                Err(e) => {
                    tracing::error!(code = 40003u32, file = %file_name.display(), error = %e, "cannot open redo log");
                    return RedoCode::ErrorRead;
                }
            }
        } else if let Some(file) = &io.file {
            // Refresh the size; online logs grow.
            if let Ok(meta) = file.metadata() {
                self.state.lock().file_size = meta.len();
            }
        }
        self.reload_header(io, update_only)
    }

    fn reload_header(&self, io: &mut ReaderIo, update_only: bool) -> RedoCode {
        let file = match &io.file {
            Some(f) => f,
            None => return RedoCode::ErrorRead,
        };
        let file_name = self.state.lock().file_name.clone();

        // Both header blocks; the block size is only known after block 0,
        // so probe with the largest possible pair.
        let mut header = vec![0u8; 4096 * 2];
        let got = match file.read_at(&mut header, 0) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(code = 40003u32, file = %file_name.display(), error = %e, "header read failed");
                return RedoCode::ErrorRead;
            }
        };
        if got < 512 {
            return RedoCode::Empty;
        }
        metrics::counter!("redoflow_reader_bytes_read_total").increment(got as u64);

        if header[0] != 0 {
            tracing::error!(code = 40003u32, file = %file_name.display(), byte = header[0], "invalid file header marker");
            return RedoCode::ErrorBadData;
        }
        if header[FH_ENDIAN..FH_ENDIAN + 4] == ENDIAN_MAGIC_BE {
            tracing::error!(code = 40004u32, file = %file_name.display(), "big-endian redo log files are not supported");
            return RedoCode::ErrorBadData;
        }
        if header[FH_ENDIAN..FH_ENDIAN + 4] != ENDIAN_MAGIC_LE {
            tracing::error!(code = 40004u32, file = %file_name.display(), "invalid endianness magic");
            return RedoCode::ErrorBadData;
        }

        let block_size = (&header[FH_BLOCK_SIZE..]).get_u32_le();
        if !matches!(block_size, 512 | 1024 | 4096) || header[1] != block_size_marker(block_size) {
            tracing::error!(code = 40005u32, file = %file_name.display(), block_size, "invalid block size");
            return RedoCode::ErrorBadData;
        }
        if got < block_size as usize * 2 {
            return RedoCode::Empty;
        }

        let bs = block_size as usize;
        let redo = &header[bs..bs * 2];
        let version = (&redo[RH_VERSION..]).get_u32_le();
        if version == 0 {
            return RedoCode::Empty;
        }
        if !version_supported(version) && !self.ctx.is_check_disabled(crate::config::DisableCheck::DbVersion) {
            tracing::error!(code = 40006u32, file = %file_name.display(), version = format!("{version:#010x}"), "unsupported database version");
            return RedoCode::ErrorBadData;
        }

        let sequence = Seq((&redo[8..]).get_u32_le());
        let activation = (&redo[RH_ACTIVATION..]).get_u32_le();
        let num_blocks = (&redo[RH_NUM_BLOCKS..]).get_u32_le();
        let resetlogs = (&redo[RH_RESETLOGS..]).get_u32_le();
        let first_scn = Scn((&redo[RH_FIRST_SCN..]).get_u64_le());
        let first_time = (&redo[RH_FIRST_TIME..]).get_u32_le();
        let next_scn = Scn((&redo[RH_NEXT_SCN..]).get_u64_le());
        let next_time = (&redo[RH_NEXT_TIME..]).get_u32_le();
        let sid = String::from_utf8_lossy(&redo[RH_SID..RH_SID + 8])
            .trim_end_matches('\0')
            .to_string();

        // The redo header block must itself pass the block checks; CRC
        // failures here retry because the header is rewritten in place.
        let mut crc_retries = 0;
        loop {
            let code = self.check_block_header_with(redo, 1, block_size, sequence, update_only);
            match code {
                RedoCode::Ok => break,
                RedoCode::ErrorCrc => {
                    crc_retries += 1;
                    if crc_retries >= CRC_RETRY_MAX {
                        return RedoCode::ErrorBadData;
                    }
                    std::thread::sleep(CRC_RETRY_SLEEP);
                    continue;
                }
                other => return other,
            }
        }

        {
            let mut state = self.state.lock();
            if state.version == 0 {
                tracing::info!(
                    version = format!("{version:#010x}"),
                    activation,
                    resetlogs,
                    block_size,
                    sequence = %sequence,
                    sid = %sid,
                    "found redo log header"
                );
            }
            if state.version != 0 && state.version != version {
                tracing::error!(code = 40007u32, file = %file_name.display(), "database version changed mid-stream");
                return RedoCode::ErrorBadData;
            }
            if !state.first_scn.is_none() && !update_only && state.first_scn != first_scn {
                tracing::error!(code = 40008u32, file = %file_name.display(), "first scn does not match previous header");
                return RedoCode::ErrorBadData;
            }
            if !state.next_scn.is_none() && !next_scn.is_none() && state.next_scn != next_scn {
                tracing::error!(code = 40009u32, file = %file_name.display(), "next scn does not match previous header");
                return RedoCode::ErrorBadData;
            }
            state.block_size = block_size;
            state.version = version;
            state.sid = sid;
            state.sequence = sequence;
            state.activation = activation;
            state.resetlogs = resetlogs;
            state.first_scn = first_scn;
            state.first_time = first_time;
            state.next_scn = next_scn;
            state.next_time = next_time;
            state.num_blocks = num_blocks;
            if num_blocks != 0 && self.group == 0 {
                let exact = u64::from(num_blocks) * u64::from(block_size);
                if state.file_size > exact {
                    state.file_size = exact;
                }
            }
        }

        if let Err(code) = self.copy_out(io, &header[..bs * 2], 0, sequence) {
            return code;
        }
        RedoCode::Ok
    }

    /// Validate one block header against the expected position.
    fn check_block_header(&self, buffer: &[u8], block_number: BlockNum) -> RedoCode {
        let (block_size, sequence) = {
            let state = self.state.lock();
            (state.block_size, state.sequence)
        };
        self.check_block_header_with(buffer, block_number, block_size, sequence, false)
    }

    fn check_block_header_with(
        &self,
        buffer: &[u8],
        block_number: BlockNum,
        block_size: u32,
        expected_sequence: Seq,
        relaxed_sequence: bool,
    ) -> RedoCode {
        if buffer[0] == 0 && buffer[1] == 0 {
            return RedoCode::Empty;
        }
        if buffer[1] != block_size_marker(block_size) {
            tracing::error!(
                code = 40001u32,
                block = block_number,
                marker = buffer[1],
                block_size,
                "invalid block size marker"
            );
            return RedoCode::ErrorBadData;
        }

        let header_block = (&buffer[4..]).get_u32_le();
        let header_seq = Seq((&buffer[8..]).get_u32_le());

        if !(expected_sequence.is_zero() || relaxed_sequence) {
            if self.group == 0 {
                if header_seq != expected_sequence {
                    tracing::warn!(
                        code = 60024u32,
                        found = %header_seq,
                        expected = %expected_sequence,
                        "invalid header sequence"
                    );
                    return RedoCode::ErrorSequence;
                }
            } else {
                if expected_sequence > header_seq {
                    return RedoCode::Empty;
                }
                if expected_sequence < header_seq {
                    return RedoCode::Overwritten;
                }
            }
        }

        if header_block != block_number {
            tracing::error!(
                code = 40002u32,
                found = header_block,
                expected = block_number,
                "invalid header block number"
            );
            return RedoCode::ErrorBlock;
        }

        if !self.ctx.is_check_disabled(crate::config::DisableCheck::BlockSum) {
            let stored = u16::from_le_bytes([buffer[14], buffer[15]]);
            let calculated = block_checksum(buffer);
            if stored != calculated {
                if self.block_checksum_configured {
                    tracing::warn!(
                        code = 60025u32,
                        block = block_number,
                        expected = stored,
                        calculated,
                        "invalid block checksum"
                    );
                }
                return RedoCode::ErrorCrc;
            }
        }
        RedoCode::Ok
    }

    /// Stream blocks until the file ends, is overwritten, or we shut down.
    fn read_loop(&self, io: &mut ReaderIo) -> RedoCode {
        io.last_read = 0;
        loop {
            if self.ctx.soft_shutdown() {
                return RedoCode::Shutdown;
            }
            {
                let state = self.state.lock();
                if state.status != Status::Read {
                    return state.ret;
                }
            }

            // Publish any pending region that has aged past the verify delay.
            self.commit_pending();

            let (block_size, file_size, scan) = {
                let state = self.state.lock();
                (u64::from(state.block_size), state.file_size, state.buffer_scan)
            };

            if scan >= file_size {
                return self.at_end_of_file(io);
            }

            // Ring full: wait for the parser to confirm.
            let ring_bytes = self.pool.chunk_size() as u64 * self.ring_len as u64;
            if scan + block_size > self.buffer_start() + ring_bytes {
                let mut state = self.state.lock();
                self.cond_buffer_full.wait_for(&mut state, STATE_WAIT);
                continue;
            }

            match self.read_once(io, scan, block_size, file_size) {
                Ok(0) => {
                    // Tail not written yet; poll, and watch the header for a
                    // log switch on online logs.
                    match self.wait_for_tail(io) {
                        RedoCode::Ok => continue,
                        other => return other,
                    }
                }
                Ok(_advanced) => {
                    self.commit_pending();
                }
                Err(code) => return code,
            }
        }
    }

    /// Read forward from `scan`; returns the number of verified bytes.
    fn read_once(&self, io: &mut ReaderIo, scan: u64, block_size: u64, file_size: u64) -> std::result::Result<u64, RedoCode> {
        let chunk_size = self.pool.chunk_size() as u64;
        let mut to_read = u64::from(read_size(io.last_read, block_size as u32));
        to_read = to_read.min(file_size - scan);
        let chunk_off = scan % chunk_size;
        if chunk_off + to_read > chunk_size {
            to_read = chunk_size - chunk_off;
        }
        to_read -= to_read % block_size;
        if to_read == 0 {
            return Err(RedoCode::Error);
        }

        let slot_idx = ((scan / chunk_size) as usize) % self.ring_len;
        {
            let mut slot = self.ring[slot_idx].lock();
            if slot.is_none() {
                match self.pool.acquire(MemoryKind::Reader) {
                    Some(chunk) => *slot = Some(chunk),
                    None => {
                        // The parser frees the slot's previous chunk just
                        // before it confirms; wait on the quota like every
                        // other stage does.
                        drop(slot);
                        let chunk = self
                            .pool
                            .acquire_wait(MemoryKind::Reader, &self.ctx)
                            .map_err(|e| {
                                if self.ctx.hard_shutdown() {
                                    return RedoCode::Shutdown;
                                }
                                tracing::error!(code = e.code(), error = %e, "reader ring chunk wait failed");
                                RedoCode::Error
                            })?;
                        let mut slot = self.ring[slot_idx].lock();
                        match slot.as_ref() {
                            None => *slot = Some(chunk),
                            Some(_) => self.pool.release(MemoryKind::Reader, chunk),
                        }
                    }
                }
            }
        }

        let file = io.file.as_ref().ok_or(RedoCode::ErrorRead)?;
        let mut local = vec![0u8; to_read as usize];
        let got = file.read_at(&mut local, scan).map_err(|e| {
            tracing::error!(code = 40003u32, error = %e, "block read failed");
            RedoCode::ErrorRead
        })?;
        let got = (got as u64 / block_size) * block_size;
        if got == 0 {
            return Ok(0);
        }
        metrics::counter!("redoflow_reader_bytes_read_total").increment(got);

        // Verify each block before it becomes visible.
        let mut verified = 0u64;
        let mut crc_retries = 0u32;
        while verified < got {
            let block_number = ((scan + verified) / block_size) as BlockNum;
            let start = verified as usize;
            let block = &local[start..start + block_size as usize];
            match self.check_block_header(block, block_number) {
                RedoCode::Ok => {
                    crc_retries = 0;
                    verified += block_size;
                }
                RedoCode::Empty => break,
                RedoCode::ErrorCrc => {
                    crc_retries += 1;
                    if crc_retries >= CRC_RETRY_MAX {
                        return Err(RedoCode::ErrorCrc);
                    }
                    std::thread::sleep(CRC_RETRY_SLEEP);
                    // Re-read the failing block in place.
                    let off = scan + verified;
                    let dst = &mut local[start..start + block_size as usize];
                    if file.read_at(dst, off).is_err() {
                        return Err(RedoCode::ErrorRead);
                    }
                }
                RedoCode::Overwritten => return Err(RedoCode::Overwritten),
                other => return Err(other),
            }
        }
        if verified == 0 {
            return Ok(0);
        }

        // Copy into the ring slot.
        {
            let mut slot = self.ring[slot_idx].lock();
            let chunk = slot.as_mut().expect("ring slot vanished");
            let dst_off = chunk_off as usize;
            chunk.bytes_mut()[dst_off..dst_off + verified as usize]
                .copy_from_slice(&local[..verified as usize]);
        }

        if let Err(code) = self.copy_out(io, &local[..verified as usize], scan, self.sequence()) {
            return Err(code);
        }

        io.last_read = verified as u32;
        {
            let mut state = self.state.lock();
            state.buffer_scan = scan + verified;
            let now = self.ctx.clock.now_us();
            state.pending.push_back((scan + verified, now));
        }
        Ok(verified)
    }

    /// Publish pending regions that are old enough (or everything when
    /// two-phase verify is off).
    fn commit_pending(&self) {
        let delay_us = if self.group > 0 { self.redo_verify_delay_us } else { 0 };
        let now = self.ctx.clock.now_us();
        let mut advanced = false;
        {
            let mut state = self.state.lock();
            while let Some((end, at)) = state.pending.front().copied() {
                if delay_us == 0 || now - at >= delay_us as i64 {
                    self.buffer_end.store(end, Ordering::Release);
                    state.pending.pop_front();
                    advanced = true;
                } else {
                    break;
                }
            }
            if advanced {
                self.cond_parser_sleeping.notify_all();
            }
        }
    }

    fn wait_for_tail(&self, io: &mut ReaderIo) -> RedoCode {
        if self.ctx.soft_shutdown() {
            return RedoCode::Shutdown;
        }
        std::thread::sleep(Duration::from_micros(self.redo_read_sleep_us));
        // Refresh the size and watch for a sequence bump or the end SCN.
        let sequence = self.sequence();
        let code = self.open_and_reload(io, true);
        match code {
            RedoCode::Ok => {
                io.tail_retries = 0;
                let state = self.state.lock();
                if state.sequence > sequence {
                    return RedoCode::Overwritten;
                }
                RedoCode::Ok
            }
            RedoCode::Overwritten => RedoCode::Overwritten,
            RedoCode::Empty => {
                io.tail_retries = 0;
                RedoCode::Ok
            }
            other if other.is_error() => {
                // A log switch rewrites the file under us; the header is
                // garbage for a moment. Only persistent failures count.
                io.tail_retries += 1;
                if io.tail_retries >= TAIL_RETRY_MAX {
                    other
                } else {
                    RedoCode::Ok
                }
            }
            other => other,
        }
    }

    fn at_end_of_file(&self, io: &mut ReaderIo) -> RedoCode {
        // Flush anything still pending the verify delay.
        loop {
            self.commit_pending();
            let empty = self.state.lock().pending.is_empty();
            if empty {
                break;
            }
            std::thread::sleep(Duration::from_micros(self.redo_read_sleep_us.max(1000)));
            if self.ctx.soft_shutdown() {
                return RedoCode::Shutdown;
            }
        }
        if self.group > 0 {
            // An online log only ends when the header publishes its end SCN.
            if self.next_scn().is_none() {
                return self.wait_for_tail(io);
            }
        }
        if !self.next_scn().is_none() {
            RedoCode::Finished
        } else {
            tracing::warn!(code = 60010u32, sequence = %self.sequence(), "log file ends without next scn");
            RedoCode::Stopped
        }
    }

    fn copy_out(
        &self,
        io: &mut ReaderIo,
        bytes: &[u8],
        offset: u64,
        sequence: Seq,
    ) -> std::result::Result<(), RedoCode> {
        let Some(copy_path) = &self.redo_copy_path else {
            return Ok(());
        };
        if io.copy_sequence != sequence {
            io.copy_file = None;
        }
        if io.copy_file.is_none() {
            let path = copy_path.join(format!("{}_{}.arc", self.database, sequence.0));
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&path)
                .map_err(|e| {
                    tracing::error!(code = 10006u32, file = %path.display(), error = %e, "cannot open redo copy");
                    RedoCode::ErrorWrite
                })?;
            tracing::info!(file = %path.display(), "writing redo log copy");
            io.copy_file = Some(file);
            io.copy_sequence = sequence;
        }
        let file = io.copy_file.as_ref().expect("copy file just opened");
        file.write_all_at(bytes, offset).map_err(|e| {
            tracing::error!(code = 10007u32, error = %e, "redo copy write failed");
            RedoCode::ErrorWrite
        })?;
        Ok(())
    }
}

fn version_supported(version: u32) -> bool {
    // 18.x through 23.x
    (0x1200_0000..=0x120E_0000).contains(&version)
        || (0x1300_0000..=0x1312_0000).contains(&version)
        || (0x1500_0000..=0x1508_0000).contains(&version)
        || (0x1700_0000..=0x1703_0000).contains(&version)
}

/// Read-ahead growth: start with one block, double up to one chunk.
fn read_size(prev_read: u32, block_size: u32) -> u32 {
    if prev_read < block_size {
        block_size
    } else {
        prev_read.saturating_mul(2)
    }
}

/// The error a terminal reader code maps onto when the parse loop gives up.
pub fn code_to_error(code: RedoCode) -> crate::error::RedoError {
    crate::error::RedoError::redo(40000, format!("reader terminated with {code:?}"))
}
