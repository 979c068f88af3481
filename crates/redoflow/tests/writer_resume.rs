//! Consumer disconnect and resume over the stream sink.
//!
//! Drives a real TCP round trip: START begins replication, CONFIRM
//! releases, a dropped connection pauses streaming, and CONTINUE after
//! reconnect resends exactly the unacknowledged suffix.

use redoflow::builder::{msg_flags, Builder};
use redoflow::config::MemoryConfig;
use redoflow::context::Ctx;
use redoflow::format::Format;
use redoflow::memory::ChunkPool;
use redoflow::metadata::store::MemStore;
use redoflow::metadata::Metadata;
use redoflow::transaction::TransactionBuffer;
use redoflow::types::{FileOffset, Scn, Seq};
use redoflow::writer::sink::{ClientRequest, ServerResponse, StartPoint};
use redoflow::writer::stream::{StreamClient, StreamSink};
use redoflow::writer::Writer;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    ctx: Arc<Ctx>,
    builder: Arc<Builder>,
    addr: String,
    writer_thread: Option<std::thread::JoinHandle<()>>,
}

impl Harness {
    fn start() -> Self {
        let ctx = Arc::new(Ctx::new("DB1"));
        let pool = ChunkPool::from_config(&MemoryConfig { chunk_mb: 1, ..MemoryConfig::default() });
        let metadata = Arc::new(Metadata::new(ctx.clone(), Arc::new(MemStore::new()), "DB1"));
        let txbuf = TransactionBuffer::new(ctx.clone(), pool.clone(), std::env::temp_dir());
        let builder =
            Builder::new(ctx.clone(), metadata.clone(), txbuf, pool, Format::default());

        let sink = StreamSink::bind("127.0.0.1:0").unwrap();
        let addr = sink.local_addr().unwrap().to_string();
        let writer = Writer::new(
            ctx.clone(),
            metadata,
            builder.clone(),
            Box::new(sink),
            1024,
            3600,
            500,
        );
        let writer_thread = Some(writer.spawn());
        Harness { ctx, builder, addr, writer_thread }
    }

    fn connect(&self) -> StreamClient {
        let client = StreamClient::connect(&self.addr).unwrap();
        client.set_timeout(Duration::from_secs(10)).unwrap();
        client
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.ctx.stop_hard();
        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn disconnect_and_continue_resend_only_the_unacked_suffix() {
    let harness = Harness::start();

    // Five data messages under checkpoint scn 5000: idx 0 is the
    // checkpoint message itself, data messages take idx 1..=5.
    harness
        .builder
        .process_checkpoint(Scn(5000), Seq(1), 0, FileOffset(1024), false)
        .unwrap();
    for i in 0..5 {
        harness
            .builder
            .append_message(msg_flags::REDO, 0, format!("m{i}").into_bytes())
            .unwrap();
    }

    // First session: START then read everything.
    let mut client = harness.connect();
    client
        .request(&ClientRequest::Start { point: StartPoint::Scn(Scn(5000)), seq: None })
        .unwrap();
    let response = client.read_response().unwrap();
    assert!(
        matches!(response, ServerResponse::Replicate { .. }),
        "expected REPLICATE, got {response:?}"
    );

    let mut frames = Vec::new();
    for _ in 0..6 {
        frames.push(client.read_frame().unwrap());
    }
    // Checkpoint message first, then the data in order.
    assert_eq!(&frames[1], b"m0");
    assert_eq!(&frames[5], b"m4");

    // Ack through idx 3 (checkpoint + m0 + m1 + m2), then drop the link.
    client
        .request(&ClientRequest::Confirm { c_scn: Scn(5000), c_idx: 3 })
        .unwrap();
    // Give the writer a moment to process the confirm before the drop.
    std::thread::sleep(Duration::from_millis(300));
    drop(client);

    // Second session: CONTINUE from the acked position.
    std::thread::sleep(Duration::from_millis(300));
    let mut client = harness.connect();
    client
        .request(&ClientRequest::Continue { c_scn: Scn(5000), c_idx: 3 })
        .unwrap();
    let response = client.read_response().unwrap();
    match response {
        ServerResponse::Replicate { c_scn, c_idx, .. } => {
            assert_eq!(c_scn, Scn(5000));
            assert_eq!(c_idx, 3);
        }
        other => panic!("expected REPLICATE, got {other:?}"),
    }

    // Only m3 and m4 come again; nothing earlier is resent.
    let resent_a = client.read_frame().unwrap();
    let resent_b = client.read_frame().unwrap();
    assert_eq!(&resent_a, b"m3");
    assert_eq!(&resent_b, b"m4");
}

#[test]
fn info_before_start_reports_state() {
    let harness = Harness::start();
    let mut client = harness.connect();
    client.request(&ClientRequest::Info).unwrap();
    let response = client.read_response().unwrap();
    // No start point configured yet.
    assert_eq!(response, ServerResponse::Starting);
}

#[test]
fn start_twice_with_a_different_point_fails() {
    let harness = Harness::start();
    let mut client = harness.connect();
    client
        .request(&ClientRequest::Start { point: StartPoint::Scn(Scn(1000)), seq: None })
        .unwrap();
    assert!(matches!(client.read_response().unwrap(), ServerResponse::Replicate { .. }));

    client
        .request(&ClientRequest::Start { point: StartPoint::Scn(Scn(2000)), seq: None })
        .unwrap();
    assert_eq!(client.read_response().unwrap(), ServerResponse::FailedStart);
}
