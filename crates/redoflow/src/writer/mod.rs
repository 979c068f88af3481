//! Message delivery with exactly-one-consumer-ack checkpointing.
//!
//! The writer owns one sink. Each loop turn polls the sink for control
//! requests, copies new builder messages into the in-flight window,
//! dispatches them, processes acknowledgments, and periodically persists
//! the writer checkpoint `{scn, idx}` of the last confirmed message.
//! Network failures flip `streaming` off and return to the accept loop;
//! the pipeline upstream never notices.

pub mod file;
pub mod sink;
pub mod stream;

use crate::builder::{Builder, OutputMessage};
use crate::context::Ctx;
use crate::error::{ErrorCategory, RedoError, Result};
use crate::metadata::Metadata;
use crate::types::{Scn, Seq};
use sink::{ClientRequest, ServerResponse, Sink, StartPoint};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

const POLL_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct SentMsg {
    id: u64,
    scn: Scn,
    idx: u64,
}

pub struct Writer {
    ctx: Arc<Ctx>,
    metadata: Arc<Metadata>,
    builder: Arc<Builder>,
    sink: Box<dyn Sink>,
    queue_size: usize,
    checkpoint_interval_s: u64,
    checkpoint_interval_mb: u64,
    // runtime state
    streaming: bool,
    sent: VecDeque<SentMsg>,
    last_sent_id: u64,
    confirmed_scn: Scn,
    confirmed_idx: u64,
    checkpointed_scn: Scn,
    checkpointed_idx: u64,
    bytes_since_checkpoint: u64,
    last_checkpoint_at: i64,
}

impl Writer {
    pub fn new(
        ctx: Arc<Ctx>,
        metadata: Arc<Metadata>,
        builder: Arc<Builder>,
        sink: Box<dyn Sink>,
        queue_size: usize,
        checkpoint_interval_s: u64,
        checkpoint_interval_mb: u64,
    ) -> Self {
        let now = ctx.clock.now();
        // The consumer's last ack survives restarts through the metadata.
        let confirmed_scn = metadata.client_scn();
        let confirmed_idx = metadata.client_idx();
        Writer {
            ctx,
            metadata,
            builder,
            sink,
            queue_size: queue_size.max(1),
            checkpoint_interval_s,
            checkpoint_interval_mb,
            streaming: false,
            sent: VecDeque::new(),
            last_sent_id: 0,
            confirmed_scn,
            confirmed_idx,
            checkpointed_scn: confirmed_scn,
            checkpointed_idx: confirmed_idx,
            bytes_since_checkpoint: 0,
            last_checkpoint_at: now,
        }
    }

    pub fn spawn(mut self) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("writer".into())
            .spawn(move || self.run())
            .expect("spawn writer thread")
    }

    pub fn run(&mut self) {
        tracing::info!(sink = self.sink.name(), "writer started");
        if self.sink.auto_confirm() {
            self.streaming = true;
        }
        loop {
            if self.ctx.hard_shutdown() {
                break;
            }
            if self.ctx.soft_shutdown() && self.builder.pending_messages() == 0 {
                break;
            }

            // 1. Inbound control requests.
            match self.sink.poll() {
                Ok(Some(request)) => {
                    if let Err(e) = self.handle_request(request) {
                        self.on_sink_error(e);
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    self.on_sink_error(e);
                }
            }

            // 2. + 3. Move new builder messages out and dispatch them.
            if self.streaming && self.sent.len() < self.queue_size {
                match self.builder.poll_message(self.last_sent_id, POLL_WAIT) {
                    Some(msg) => {
                        if let Err(e) = self.dispatch(&msg) {
                            self.on_sink_error(e);
                        }
                    }
                    None => {}
                }
            } else {
                std::thread::sleep(POLL_WAIT);
            }

            // 5. Periodic writer checkpoint.
            if let Err(e) = self.maybe_checkpoint(false) {
                tracing::error!(code = e.code(), error = %e, "writer checkpoint failed");
                self.ctx.stop_hard();
                break;
            }
        }
        if let Err(e) = self.maybe_checkpoint(true) {
            tracing::error!(code = e.code(), error = %e, "final writer checkpoint failed");
        }
        tracing::info!("writer stopped");
    }

    fn on_sink_error(&mut self, e: RedoError) {
        if e.category() == ErrorCategory::Network {
            // Consumer trouble is not a pipeline failure.
            tracing::warn!(code = e.code(), error = %e, "sink error, streaming paused");
            self.streaming = self.sink.auto_confirm();
        } else {
            tracing::error!(code = e.code(), error = %e, "writer failed");
            self.ctx.stop_hard();
        }
    }

    fn dispatch(&mut self, msg: &OutputMessage) -> Result<()> {
        self.sink.send(msg)?;
        self.last_sent_id = msg.id;
        self.bytes_since_checkpoint += msg.data.len() as u64;
        if self.sink.auto_confirm() {
            self.builder.confirm(msg.id);
            if !msg.scn.is_none() {
                self.confirmed_scn = msg.scn;
                self.confirmed_idx = msg.idx;
            }
        } else {
            self.sent.push_back(SentMsg { id: msg.id, scn: msg.scn, idx: msg.idx });
        }
        Ok(())
    }

    fn state_response(&self) -> ServerResponse {
        let first_data_scn = self.metadata.first_data_scn();
        if self.streaming {
            ServerResponse::Replicate {
                first_data_scn,
                c_scn: self.confirmed_scn,
                c_idx: self.confirmed_idx,
            }
        } else if first_data_scn.is_none() {
            ServerResponse::Starting
        } else {
            ServerResponse::Ready {
                first_data_scn,
                c_scn: self.confirmed_scn,
                c_idx: self.confirmed_idx,
            }
        }
    }

    fn handle_request(&mut self, request: ClientRequest) -> Result<()> {
        match request {
            ClientRequest::Info => {
                let resp = self.state_response();
                self.sink.respond(&resp)?;
            }
            ClientRequest::Start { point, seq } => {
                let accepted = self.apply_start(point, seq);
                if accepted {
                    self.streaming = true;
                    tracing::info!("replication started by consumer");
                    let resp = self.state_response();
                    self.sink.respond(&resp)?;
                } else {
                    self.sink.respond(&ServerResponse::FailedStart)?;
                }
            }
            ClientRequest::Continue { c_scn, c_idx } => {
                // Reset the send cursor to just past the consumer's position.
                self.last_sent_id = self.builder.find_resume_id(c_scn, c_idx);
                self.sent.clear();
                if !c_scn.is_none() {
                    self.confirmed_scn = c_scn;
                    self.confirmed_idx = c_idx;
                }
                self.streaming = true;
                tracing::info!(scn = %c_scn, idx = c_idx, "replication resumed by consumer");
                let resp = self.state_response();
                self.sink.respond(&resp)?;
            }
            ClientRequest::Confirm { c_scn, c_idx } => {
                self.apply_confirm(c_scn, c_idx);
            }
        }
        Ok(())
    }

    fn apply_start(&mut self, point: StartPoint, _seq: Option<Seq>) -> bool {
        let requested = match point {
            StartPoint::Scn(scn) => scn,
            StartPoint::Time(_) | StartPoint::TimeRel(_) => {
                // Time-based starts resolve at the replicator; a consumer
                // start only works once the pipeline has a position.
                return !self.metadata.first_data_scn().is_none();
            }
        };
        let current = self.metadata.first_data_scn();
        if current.is_none() {
            self.metadata.set_first_data_scn(requested);
            return true;
        }
        // Restarting from a different point than the pipeline serves fails.
        current == requested || requested.is_none()
    }

    /// Ack everything at or below `(c_scn, c_idx)`.
    fn apply_confirm(&mut self, c_scn: Scn, c_idx: u64) {
        let mut max_id = 0u64;
        while let Some(front) = self.sent.front() {
            let covered = front.scn < c_scn || (front.scn == c_scn && front.idx <= c_idx);
            if !covered {
                break;
            }
            max_id = max_id.max(front.id);
            self.sent.pop_front();
        }
        if max_id > 0 {
            self.builder.confirm(max_id);
            self.confirmed_scn = c_scn;
            self.confirmed_idx = c_idx;
            metrics::counter!("redoflow_writer_confirms_total").increment(1);
        }
    }

    fn maybe_checkpoint(&mut self, force: bool) -> Result<()> {
        if self.confirmed_scn.is_none() {
            return Ok(());
        }
        let unchanged = self.confirmed_scn == self.checkpointed_scn
            && self.confirmed_idx == self.checkpointed_idx;
        if unchanged {
            return Ok(());
        }
        let now = self.ctx.clock.now();
        let due_time = now - self.last_checkpoint_at >= self.checkpoint_interval_s as i64;
        let due_bytes = self.bytes_since_checkpoint >= self.checkpoint_interval_mb * 1024 * 1024;
        if !(force || due_time || due_bytes) {
            return Ok(());
        }
        self.metadata
            .write_writer_checkpoint(self.confirmed_scn, self.confirmed_idx)?;
        self.checkpointed_scn = self.confirmed_scn;
        self.checkpointed_idx = self.confirmed_idx;
        self.bytes_since_checkpoint = 0;
        self.last_checkpoint_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::memory::ChunkPool;
    use crate::metadata::store::MemStore;
    use crate::transaction::TransactionBuffer;
    use parking_lot::Mutex;

    /// Scripted in-memory sink for writer unit tests.
    struct ScriptSink {
        requests: Mutex<VecDeque<ClientRequest>>,
        pub sent: Arc<Mutex<Vec<OutputMessage>>>,
        pub responses: Arc<Mutex<Vec<ServerResponse>>>,
        auto: bool,
    }

    impl Sink for ScriptSink {
        fn name(&self) -> &'static str {
            "script"
        }

        fn poll(&mut self) -> Result<Option<ClientRequest>> {
            Ok(self.requests.lock().pop_front())
        }

        fn send(&mut self, msg: &OutputMessage) -> Result<()> {
            self.sent.lock().push(msg.clone());
            Ok(())
        }

        fn respond(&mut self, resp: &ServerResponse) -> Result<()> {
            self.responses.lock().push(*resp);
            Ok(())
        }

        fn auto_confirm(&self) -> bool {
            self.auto
        }

        fn connected(&self) -> bool {
            true
        }
    }

    fn harness(auto: bool) -> (Writer, Arc<Builder>, Arc<Metadata>, Arc<Mutex<Vec<OutputMessage>>>) {
        let ctx = Arc::new(Ctx::new("DB1"));
        let pool = ChunkPool::new(64 * 1024, [2, 2, 4, 3, 1]);
        let metadata = Arc::new(Metadata::new(ctx.clone(), Arc::new(MemStore::new()), "DB1"));
        let txbuf = TransactionBuffer::new(ctx.clone(), pool.clone(), std::env::temp_dir());
        let builder = Builder::new(ctx.clone(), metadata.clone(), txbuf, pool, Format::default());
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = ScriptSink {
            requests: Mutex::new(VecDeque::new()),
            sent: sent.clone(),
            responses: Arc::new(Mutex::new(Vec::new())),
            auto,
        };
        let writer = Writer::new(ctx, metadata.clone(), builder.clone(), Box::new(sink), 1024, 0, 500);
        (writer, builder, metadata, sent)
    }

    fn queue_messages(builder: &Builder, scn: u64, count: usize) {
        builder
            .process_checkpoint(Scn(scn), Seq(1), 0, crate::types::FileOffset(1024), false)
            .unwrap();
        for i in 0..count {
            builder
                .append_message(crate::builder::msg_flags::REDO, 0, format!("m{i}").into_bytes())
                .unwrap();
        }
    }

    #[test]
    fn auto_confirm_sink_drains_and_checkpoints() {
        let (mut writer, builder, metadata, sent) = harness(true);
        queue_messages(&builder, 5000, 3);

        writer.streaming = true;
        for _ in 0..4 {
            if let Some(msg) = builder.poll_message(writer.last_sent_id, Duration::ZERO) {
                writer.dispatch(&msg).unwrap();
            }
        }
        assert_eq!(sent.lock().len(), 4);
        assert_eq!(builder.pending_messages(), 0);
        writer.maybe_checkpoint(true).unwrap();
        let chkpt = metadata.read_writer_checkpoint().unwrap().unwrap();
        assert_eq!(chkpt.scn, Scn(5000));
        assert_eq!(chkpt.idx, 3);
    }

    #[test]
    fn confirm_releases_up_to_position() {
        let (mut writer, builder, _metadata, _sent) = harness(false);
        queue_messages(&builder, 5000, 3);

        writer.streaming = true;
        while let Some(msg) = builder.poll_message(writer.last_sent_id, Duration::ZERO) {
            writer.dispatch(&msg).unwrap();
        }
        assert_eq!(writer.sent.len(), 4);

        // Ack through idx 2; the checkpoint message (idx 0) plus two.
        writer.apply_confirm(Scn(5000), 2);
        assert_eq!(writer.sent.len(), 1);
        assert_eq!(writer.confirmed_scn, Scn(5000));
        assert_eq!(writer.confirmed_idx, 2);
        assert_eq!(builder.confirmed_id(), 3);

        writer.apply_confirm(Scn(5000), 3);
        assert!(writer.sent.is_empty());
    }

    #[test]
    fn continue_resets_the_send_cursor() {
        let (mut writer, builder, _metadata, sent) = harness(false);
        queue_messages(&builder, 5000, 3);

        writer.streaming = true;
        while let Some(msg) = builder.poll_message(writer.last_sent_id, Duration::ZERO) {
            writer.dispatch(&msg).unwrap();
        }
        let total_sent = sent.lock().len();
        assert_eq!(total_sent, 4);

        // Reconnect: the consumer saw everything through (5000, 1).
        writer.handle_request(ClientRequest::Continue { c_scn: Scn(5000), c_idx: 1 }).unwrap();
        assert!(writer.streaming);
        assert!(writer.sent.is_empty());

        // Only messages past (5000, 1) are resent.
        let mut resent = Vec::new();
        while let Some(msg) = builder.poll_message(writer.last_sent_id, Duration::ZERO) {
            writer.dispatch(&msg).unwrap();
            resent.push(msg);
        }
        assert_eq!(resent.len(), 2);
        assert!(resent.iter().all(|m| m.scn == Scn(5000) && m.idx > 1));
    }

    #[test]
    fn start_sets_first_data_scn_once() {
        let (mut writer, _builder, metadata, _sent) = harness(false);
        assert!(writer.apply_start(StartPoint::Scn(Scn(1_000_000)), None));
        assert_eq!(metadata.first_data_scn(), Scn(1_000_000));
        // The same point again is fine, a different one is refused.
        assert!(writer.apply_start(StartPoint::Scn(Scn(1_000_000)), None));
        assert!(!writer.apply_start(StartPoint::Scn(Scn(2_000_000)), None));
    }

    #[test]
    fn info_reports_ready_then_replicate() {
        let (mut writer, _builder, metadata, _sent) = harness(false);
        metadata.set_first_data_scn(Scn(1000));
        let resp = writer.state_response();
        assert!(matches!(resp, ServerResponse::Ready { .. }));
        writer.streaming = true;
        let resp = writer.state_response();
        assert!(matches!(resp, ServerResponse::Replicate { first_data_scn, .. } if first_data_scn == Scn(1000)));
    }
}
