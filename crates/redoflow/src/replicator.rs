//! Thread orchestration and log-file sequencing.
//!
//! The replicator wires the stages together, spawns one thread per stage
//! (memory manager, builder, writer, one reader per open file) and drives
//! the parser on its own thread. Files are processed strictly in sequence
//! order: archived logs by name, online logs by header. An overwritten
//! online log keeps the pipeline on the same sequence; the confirmed
//! offset saved by the parser resumes from the archived copy, so nothing
//! is lost or duplicated across the switch.

use crate::builder::Builder;
use crate::config::{Config, RedoFlag, WriterConfig};
use crate::context::Ctx;
use crate::error::{RedoError, Result};
use crate::format::Format;
use crate::memory::ChunkPool;
use crate::metadata::store::DirStore;
use crate::metadata::Metadata;
use crate::parser::Parser;
use crate::reader::{Reader, RedoCode, ENDIAN_MAGIC_LE, FH_BLOCK_SIZE, FH_ENDIAN, RH_FIRST_SCN,
    RH_FIRST_TIME, RH_NEXT_SCN, RH_RESETLOGS};
use crate::transaction::swap::SwapManager;
use crate::transaction::TransactionBuffer;
use crate::types::{Scn, Seq};
use crate::writer::{file::FileSink, sink::Sink, stream::StreamSink, Writer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Minimal header facts used for file discovery, read without a reader.
#[derive(Debug, Clone)]
struct HeaderPeek {
    sequence: Seq,
    first_scn: Scn,
    next_scn: Scn,
    first_time: u32,
    resetlogs: u32,
}

fn peek_header(path: &Path) -> Result<HeaderPeek> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 1024 {
        return Err(RedoError::redo(40050, format!("{} is too short", path.display())));
    }
    if bytes[FH_ENDIAN..FH_ENDIAN + 4] != ENDIAN_MAGIC_LE {
        return Err(RedoError::redo(40051, format!("{} has no valid header", path.display())));
    }
    let block_size =
        u32::from_le_bytes(bytes[FH_BLOCK_SIZE..FH_BLOCK_SIZE + 4].try_into().expect("4 bytes"));
    if !matches!(block_size, 512 | 1024 | 4096) {
        return Err(RedoError::redo(40051, format!("{} has no valid header", path.display())));
    }
    let bs = block_size as usize;
    if bytes.len() < bs * 2 {
        return Err(RedoError::redo(40050, format!("{} is too short", path.display())));
    }
    let redo = &bytes[bs..bs * 2];
    let u32_at = |off: usize| u32::from_le_bytes(redo[off..off + 4].try_into().expect("4 bytes"));
    let u64_at = |off: usize| u64::from_le_bytes(redo[off..off + 8].try_into().expect("8 bytes"));
    Ok(HeaderPeek {
        sequence: Seq(u32_at(8)),
        first_scn: Scn(u64_at(RH_FIRST_SCN)),
        next_scn: Scn(u64_at(RH_NEXT_SCN)),
        first_time: u32_at(RH_FIRST_TIME),
        resetlogs: u32_at(RH_RESETLOGS),
    })
}

/// One candidate log file on disk.
#[derive(Debug, Clone)]
struct LogCandidate {
    path: PathBuf,
    group: i32,
    header: HeaderPeek,
}

pub struct Replicator {
    ctx: Arc<Ctx>,
    config: Config,
    metadata: Arc<Metadata>,
    pool: Arc<ChunkPool>,
    txbuf: Arc<TransactionBuffer>,
    builder: Arc<Builder>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl Replicator {
    pub fn new(ctx: Arc<Ctx>, config: Config) -> Result<Self> {
        let pool = ChunkPool::from_config(&config.memory);
        pool.register_wakers(&ctx);
        let store = Arc::new(DirStore::new(&config.schema)?);
        let metadata = Arc::new(Metadata::new(ctx.clone(), store, config.database.clone()));
        let txbuf =
            TransactionBuffer::new(ctx.clone(), pool.clone(), config.memory.swap_path.clone());
        let format = Format::from_config(&config.format)?;
        let builder =
            Builder::new(ctx.clone(), metadata.clone(), txbuf.clone(), pool.clone(), format);
        Ok(Replicator { ctx, config, metadata, pool, txbuf, builder, threads: Vec::new() })
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    fn make_sink(&self) -> Result<Box<dyn Sink>> {
        Ok(match &self.config.writer {
            WriterConfig::Stream { bind, .. } => Box::new(StreamSink::bind(bind)?),
            WriterConfig::File { path, .. } => {
                Box::new(FileSink::create(path.as_deref(), self.builder.format.kind)?)
            }
        })
    }

    /// Scan the configured locations for log files.
    fn candidates(&self) -> Vec<LogCandidate> {
        let mut found = Vec::new();
        if let Some(dir) = &self.config.reader.archive_path {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().is_some_and(|e| e == "arc") {
                        match peek_header(&path) {
                            Ok(header) => found.push(LogCandidate { path, group: 0, header }),
                            Err(e) => {
                                tracing::debug!(file = %path.display(), error = %e, "skipping unreadable archive")
                            }
                        }
                    }
                }
            }
        }
        for online in &self.config.reader.online_logs {
            match peek_header(&online.path) {
                Ok(header) => found.push(LogCandidate {
                    path: online.path.clone(),
                    group: online.group,
                    header,
                }),
                Err(e) => {
                    tracing::debug!(file = %online.path.display(), error = %e, "skipping unreadable online log")
                }
            }
        }
        found
    }

    /// Pick the file serving `sequence`; archived copies win over online
    /// logs of the same sequence.
    fn find_sequence(&self, sequence: Seq) -> Option<LogCandidate> {
        let mut candidates: Vec<LogCandidate> = self
            .candidates()
            .into_iter()
            .filter(|c| c.header.sequence == sequence)
            .collect();
        candidates.sort_by_key(|c| c.group);
        candidates.into_iter().next()
    }

    /// Resolve the starting sequence from the configured start point.
    fn resolve_start(&self) -> Result<Seq> {
        // A recovered checkpoint decides; config start points only apply to
        // a first run.
        if !self.metadata.sequence().is_zero() {
            return Ok(self.metadata.sequence());
        }

        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(RedoError::config(10030, "no redo log files found"));
        }

        if let Some(seq) = self.config.start_seq {
            return Ok(Seq(seq));
        }

        let start_scn = self.config.start_scn();
        if !start_scn.is_none() {
            // The file whose range covers the requested scn.
            let covering = candidates.iter().find(|c| {
                c.header.first_scn <= start_scn
                    && (c.header.next_scn.is_none() || start_scn < c.header.next_scn)
            });
            return match covering {
                Some(c) => {
                    self.metadata.set_first_data_scn(start_scn);
                    Ok(c.header.sequence)
                }
                None => Err(RedoError::config(
                    10031,
                    format!("no log file covers scn {start_scn}"),
                )),
            };
        }

        let start_time = match (&self.config.start_time, self.config.start_time_rel) {
            (Some(text), _) => Some(parse_start_time(text)?),
            (None, Some(rel)) => Some((self.ctx.clock.now() as u64).saturating_sub(rel)),
            _ => None,
        };
        if let Some(target) = start_time {
            // The newest file that began at or before the target time.
            let mut best: Option<&LogCandidate> = None;
            for c in &candidates {
                if u64::from(c.header.first_time) <= target {
                    let newer = best.map(|b| c.header.sequence > b.header.sequence).unwrap_or(true);
                    if newer {
                        best = Some(c);
                    }
                }
            }
            return best.map(|c| c.header.sequence).ok_or_else(|| {
                RedoError::config(10032, format!("no log file covers start time {target}"))
            });
        }

        // NOW mode: start at the newest online log's current tail.
        let newest = candidates
            .iter()
            .filter(|c| c.group > 0)
            .max_by_key(|c| c.header.sequence)
            .or_else(|| candidates.iter().max_by_key(|c| c.header.sequence))
            .expect("candidates not empty");
        self.metadata.set_first_data_scn(newest.header.first_scn);
        Ok(newest.header.sequence)
    }

    /// Run the pipeline until shutdown or end of input.
    pub fn run(&mut self) -> Result<()> {
        // Recover durable state first; the writer reads the client position
        // at construction.
        self.metadata.recover(self.config.start_scn())?;

        // Stage threads.
        let swap = SwapManager::new(
            self.txbuf.clone(),
            !self.ctx.is_flag_set(RedoFlag::NoDirectSwap),
        );
        swap.cleanup_stale()?;
        self.threads.push(swap.spawn());
        self.threads.push(self.builder.spawn());

        let (queue_size, interval_s, interval_mb) = match &self.config.writer {
            WriterConfig::Stream { queue_size, checkpoint_interval_s, checkpoint_interval_mb, .. } => {
                (*queue_size, *checkpoint_interval_s, *checkpoint_interval_mb)
            }
            WriterConfig::File { checkpoint_interval_s, checkpoint_interval_mb, .. } => {
                (1024, *checkpoint_interval_s, *checkpoint_interval_mb)
            }
        };
        let writer = Writer::new(
            self.ctx.clone(),
            self.metadata.clone(),
            self.builder.clone(),
            self.make_sink()?,
            queue_size,
            interval_s,
            interval_mb,
        );
        self.threads.push(writer.spawn());

        let mut sequence = self.resolve_start()?;
        let batch_mode = self.config.reader.online_logs.is_empty();
        tracing::info!(sequence = %sequence, batch_mode, "replication starting");

        let outcome = self.sequence_loop(&mut sequence, batch_mode);

        // Orderly teardown. On the clean path, let the builder and writer
        // drain what the parser produced before stopping them.
        match &outcome {
            Ok(()) => {
                for _ in 0..500 {
                    if self.ctx.soft_shutdown() {
                        break;
                    }
                    let drained = self.txbuf.commit_events().is_empty()
                        && self.txbuf.is_empty()
                        && self.builder.pending_messages() == 0;
                    if drained {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                self.ctx.stop_soft();
            }
            Err(_) => self.ctx.stop_hard(),
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        outcome
    }

    fn sequence_loop(&mut self, sequence: &mut Seq, batch_mode: bool) -> Result<()> {
        while !self.ctx.soft_shutdown() {
            let Some(candidate) = self.find_sequence(*sequence) else {
                if batch_mode {
                    tracing::info!(sequence = %sequence, "no more log files, finishing");
                    return Ok(());
                }
                std::thread::sleep(Duration::from_micros(
                    self.config.reader.redo_read_sleep_us.max(1000),
                ));
                continue;
            };

            let code = self.process_file(&candidate, *sequence)?;
            match code {
                RedoCode::Finished => {
                    *sequence = sequence.next();
                    self.metadata.set_sequence(*sequence);
                    metrics::counter!("redoflow_replicator_log_switches_total").increment(1);
                }
                RedoCode::Overwritten => {
                    // The parser saved the confirmed offset; the rest of
                    // this sequence comes from its archived copy once the
                    // database finishes archiving it. Never skip ahead.
                    tracing::info!(
                        sequence = %sequence,
                        offset = %self.metadata.file_offset(),
                        "online log overwritten, reacquiring sequence"
                    );
                    metrics::counter!("redoflow_replicator_log_switches_total").increment(1);
                    std::thread::sleep(Duration::from_micros(
                        self.config.reader.redo_read_sleep_us.max(1000),
                    ));
                }
                RedoCode::Stopped => {
                    if batch_mode {
                        tracing::warn!(code = 60011u32, sequence = %sequence, "log ends without next scn, finishing");
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_micros(
                        self.config.reader.redo_read_sleep_us.max(1000),
                    ));
                }
                RedoCode::Shutdown => return Ok(()),
                RedoCode::Empty => {
                    std::thread::sleep(Duration::from_micros(
                        self.config.reader.redo_read_sleep_us.max(1000),
                    ));
                }
                other => {
                    return Err(crate::reader::code_to_error(other));
                }
            }
        }
        Ok(())
    }

    fn process_file(&mut self, candidate: &LogCandidate, sequence: Seq) -> Result<RedoCode> {
        let reader = Reader::new(
            self.ctx.clone(),
            self.pool.clone(),
            self.config.database.clone(),
            candidate.group,
            &self.config.reader,
        );
        reader.set_file(candidate.path.clone());
        let reader_thread = reader.spawn();

        let result = (|| -> Result<RedoCode> {
            let code = reader.check_redo_log();
            if code != RedoCode::Ok {
                return Ok(code);
            }
            if reader.sequence() != sequence {
                return Ok(RedoCode::Empty);
            }

            let mut parser = Parser::new(
                self.ctx.clone(),
                self.metadata.clone(),
                self.builder.clone(),
                self.txbuf.clone(),
                candidate.group,
                candidate.path.clone(),
                sequence,
            );
            parser.parse(&reader)
        })();

        reader.stop();
        let _ = reader_thread.join();
        reader.release_buffers();
        result
    }
}

fn parse_start_time(text: &str) -> Result<u64> {
    use chrono::NaiveDateTime;
    let parsed = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .map_err(|e| RedoError::config(10033, format!("invalid start-time {text}: {e}")))?;
    Ok(parsed.and_utc().timestamp() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::LogFileBuilder;
    use tempfile::tempdir;

    #[test]
    fn peek_header_reads_identity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("DB1_7.arc");
        LogFileBuilder::new(512, 7)
            .resetlogs(3)
            .first_scn(Scn(1000))
            .next_scn(Scn(2000))
            .first_time(1_700_000_000)
            .add_lwn(
                Scn(1000),
                1_700_000_000,
                vec![crate::synth::RecordBuilder::new(5, 2, crate::types::Xid::new(1, 1, 1))
                    .scn(Scn(1000))
                    .text_field("u")],
            )
            .write_to(&path)
            .unwrap();

        let header = peek_header(&path).unwrap();
        assert_eq!(header.sequence, Seq(7));
        assert_eq!(header.first_scn, Scn(1000));
        assert_eq!(header.next_scn, Scn(2000));
        assert_eq!(header.resetlogs, 3);
    }

    #[test]
    fn peek_header_rejects_junk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.arc");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();
        assert!(peek_header(&path).is_err());
    }

    #[test]
    fn start_time_parses() {
        let ts = parse_start_time("2023-11-14 22:13:20").unwrap();
        assert_eq!(ts, 1_700_000_000);
        assert!(parse_start_time("not a time").is_err());
    }
}
