//! End-to-end pipeline scenarios over synthetic redo log files.
//!
//! Each test builds a log file with the real on-disk layout, runs the full
//! replicator in batch mode against a file sink, and asserts on the emitted
//! JSON messages and the durable checkpoints.

use redoflow::config::Config;
use redoflow::context::Ctx;
use redoflow::parser::record::{
    ColumnValue, CODE_ROW_DELETE, CODE_ROW_INSERT, CODE_TXN_BEGIN, CODE_TXN_COMMIT, LAYER_ROW,
    LAYER_TXN, TXN_FLAG_ROLLBACK,
};
use redoflow::synth::{LogFileBuilder, RecordBuilder};
use redoflow::types::{Scn, Xid};
use redoflow::Replicator;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("archive")).unwrap();
        std::fs::create_dir_all(dir.path().join("meta")).unwrap();
        std::fs::create_dir_all(dir.path().join("swap")).unwrap();
        Sandbox { dir }
    }

    fn archive(&self) -> std::path::PathBuf {
        self.dir.path().join("archive")
    }

    fn output(&self) -> std::path::PathBuf {
        self.dir.path().join("out.json")
    }

    fn config(&self, start_scn: u64) -> Config {
        let json = format!(
            r#"{{
                "database": "DB1",
                "start-scn": {start_scn},
                "schema": "{meta}",
                "flags": ["schemaless"],
                "memory": {{"chunk-mb": 1, "swap-path": "{swap}"}},
                "reader": {{"archive-path": "{archive}"}},
                "writer": {{"type": "file", "path": "{out}", "checkpoint-interval-s": 0}}
            }}"#,
            meta = self.dir.path().join("meta").display(),
            swap = self.dir.path().join("swap").display(),
            archive = self.archive().display(),
            out = self.output().display(),
        );
        Config::from_json(&json).unwrap()
    }

    fn run(&self, start_scn: u64) {
        let config = self.config(start_scn);
        let ctx = Arc::new(
            Ctx::new(config.database.clone())
                .with_flags(&config.flags)
                .with_disable_checks(&config.disable_checks),
        );
        let mut replicator = Replicator::new(ctx, config).unwrap();
        replicator.run().unwrap();
    }

    /// Non-checkpoint messages, parsed.
    fn messages(&self) -> Vec<Value> {
        let content = std::fs::read_to_string(self.output()).unwrap();
        content
            .lines()
            .map(|line| serde_json::from_str::<Value>(line).unwrap())
            .filter(|v| v.get("checkpoint").is_none())
            .collect()
    }

    fn metadata_entries(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.dir.path().join("meta"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn begin(xid: Xid, scn: u64) -> RecordBuilder {
    RecordBuilder::new(LAYER_TXN, CODE_TXN_BEGIN, xid).scn(Scn(scn)).text_field("app_user")
}

fn insert(xid: Xid, scn: u64, obj: u32, slot: u16, id: &str) -> RecordBuilder {
    RecordBuilder::new(LAYER_ROW, CODE_ROW_INSERT, xid)
        .scn(Scn(scn))
        .obj(obj)
        .row(4096, slot)
        .column(1, ColumnValue::Number(id.into()))
        .column(2, ColumnValue::Text("payload".into()))
}

fn delete(xid: Xid, scn: u64, obj: u32, slot: u16, id: &str) -> RecordBuilder {
    RecordBuilder::new(LAYER_ROW, CODE_ROW_DELETE, xid)
        .scn(Scn(scn))
        .obj(obj)
        .row(4096, slot)
        .column(1, ColumnValue::Number(id.into()))
}

fn commit(xid: Xid, scn: u64) -> RecordBuilder {
    RecordBuilder::new(LAYER_TXN, CODE_TXN_COMMIT, xid).scn(Scn(scn))
}

fn rollback(xid: Xid, scn: u64) -> RecordBuilder {
    RecordBuilder::new(LAYER_TXN, CODE_TXN_COMMIT, xid).scn(Scn(scn)).flags(TXN_FLAG_ROLLBACK)
}

fn write_log(path: &Path, sequence: u32, builder: LogFileBuilder) {
    builder.write_to(&path.join(format!("DB1_{sequence}.arc"))).unwrap();
}

/// Commit ordering: transactions emit in commit-SCN order, not start order.
#[test]
fn commit_order_wins_over_start_order() {
    let sandbox = Sandbox::new();
    let t1 = Xid::new(0, 0, 1);
    let t2 = Xid::new(0, 0, 2);
    let t3 = Xid::new(0, 0, 3);

    let log = LogFileBuilder::new(512, 7)
        .resetlogs(7)
        .activation(9)
        .first_scn(Scn(100))
        .next_scn(Scn(200))
        .add_lwn(
            Scn(100),
            1_700_000_000,
            vec![
                begin(t1, 100),
                begin(t2, 110),
                begin(t3, 120),
                insert(t1, 101, 501, 1, "1"),
                insert(t2, 111, 501, 2, "2"),
                insert(t3, 121, 501, 3, "3"),
            ],
        )
        .add_lwn(
            Scn(140),
            1_700_000_010,
            vec![commit(t2, 140), commit(t1, 150), commit(t3, 160)],
        );
    write_log(&sandbox.archive(), 7, log);

    sandbox.run(100);

    let messages = sandbox.messages();
    let begin_xids: Vec<String> = messages
        .iter()
        .filter(|m| m["payload"][0]["op"] == "begin")
        .map(|m| m["xid"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        begin_xids,
        vec![t2.to_hex(), t1.to_hex(), t3.to_hex()],
        "expected commit order T2, T1, T3"
    );

    // Commit SCNs are monotone across the whole output.
    let scns: Vec<u64> = messages.iter().map(|m| m["scn"].as_u64().unwrap()).collect();
    let mut sorted = scns.clone();
    sorted.sort_unstable();
    assert_eq!(scns, sorted, "commit emission must be monotone");
}

/// Group commits: two transactions sharing one commit SCN emit in start-SCN
/// order, whatever order their commit records appear in the group.
#[test]
fn equal_commit_scns_emit_in_start_scn_order() {
    let sandbox = Sandbox::new();
    let t_early = Xid::new(0, 0, 1); // starts at 100
    let t_late = Xid::new(0, 0, 2); // starts at 110

    let log = LogFileBuilder::new(512, 7)
        .first_scn(Scn(100))
        .next_scn(Scn(200))
        .add_lwn(
            Scn(100),
            1_700_000_000,
            vec![
                begin(t_early, 100),
                insert(t_early, 101, 501, 1, "1"),
                begin(t_late, 110),
                insert(t_late, 111, 501, 2, "2"),
            ],
        )
        .add_lwn(
            Scn(150),
            1_700_000_010,
            // The later-starting transaction's commit record drains first.
            vec![commit(t_late, 150).sub_scn(0), commit(t_early, 150).sub_scn(1)],
        );
    write_log(&sandbox.archive(), 7, log);

    sandbox.run(100);

    let messages = sandbox.messages();
    let begin_xids: Vec<String> = messages
        .iter()
        .filter(|m| m["payload"][0]["op"] == "begin")
        .map(|m| m["xid"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        begin_xids,
        vec![t_early.to_hex(), t_late.to_hex()],
        "equal commit scns must order by earliest start scn"
    );
    // Both transactions really did share the commit SCN.
    let scns: Vec<u64> = messages.iter().map(|m| m["scn"].as_u64().unwrap()).collect();
    assert!(scns.iter().all(|scn| *scn == 150));
}

/// A rolled-back transaction leaves no trace in the output.
#[test]
fn rolled_back_transaction_is_silent() {
    let sandbox = Sandbox::new();
    let keeper = Xid::new(0, 0, 1);
    let doomed = Xid::new(0, 0, 4);

    let log = LogFileBuilder::new(512, 7)
        .first_scn(Scn(100))
        .next_scn(Scn(200))
        .add_lwn(
            Scn(100),
            1_700_000_000,
            vec![
                begin(keeper, 100),
                begin(doomed, 102),
                insert(doomed, 103, 501, 10, "100"),
                insert(doomed, 104, 501, 11, "101"),
                delete(doomed, 105, 501, 10, "100"),
                insert(keeper, 106, 501, 1, "1"),
            ],
        )
        .add_lwn(Scn(130), 1_700_000_005, vec![rollback(doomed, 130), commit(keeper, 140)]);
    write_log(&sandbox.archive(), 7, log);

    sandbox.run(100);

    let messages = sandbox.messages();
    assert!(!messages.is_empty());
    let doomed_hex = doomed.to_hex();
    for message in &messages {
        assert_ne!(message["xid"].as_str().unwrap(), doomed_hex, "rolled back xid leaked");
        for op in message["payload"].as_array().unwrap() {
            if let Some(after) = op.get("after") {
                assert_ne!(after["col1"], 100);
                assert_ne!(after["col1"], 101);
            }
        }
    }
    // The keeper's insert arrived.
    assert!(messages
        .iter()
        .flat_map(|m| m["payload"].as_array().unwrap())
        .any(|op| op["op"] == "c" && op["after"]["col1"] == 1));
}

/// Transaction atomicity in short message format: every transaction's ops
/// are contiguous and bracketed by its begin and commit.
#[test]
fn transactions_do_not_interleave() {
    let sandbox = Sandbox::new();
    let t1 = Xid::new(0, 0, 1);
    let t2 = Xid::new(0, 0, 2);

    let log = LogFileBuilder::new(512, 7)
        .first_scn(Scn(100))
        .next_scn(Scn(200))
        .add_lwn(
            Scn(100),
            0,
            vec![
                begin(t1, 100),
                begin(t2, 101),
                // Heavily interleaved appends.
                insert(t1, 102, 501, 1, "11"),
                insert(t2, 103, 501, 2, "21"),
                insert(t1, 104, 501, 3, "12"),
                insert(t2, 105, 501, 4, "22"),
                insert(t1, 106, 501, 5, "13"),
            ],
        )
        .add_lwn(Scn(140), 0, vec![commit(t1, 140), commit(t2, 150)]);
    write_log(&sandbox.archive(), 7, log);

    sandbox.run(100);

    let messages = sandbox.messages();
    let xid_sequence: Vec<String> =
        messages.iter().map(|m| m["xid"].as_str().unwrap().to_string()).collect();
    // All T1 messages first (begin..commit), then all T2 messages.
    let t1_hex = t1.to_hex();
    let switch = xid_sequence.iter().position(|x| *x != t1_hex).unwrap();
    assert!(xid_sequence[..switch].iter().all(|x| *x == t1_hex));
    assert!(xid_sequence[switch..].iter().all(|x| *x != t1_hex));

    // Bracketing: first op of a transaction is begin, last is commit.
    let t1_ops: Vec<&str> = messages
        .iter()
        .filter(|m| m["xid"] == t1_hex.as_str())
        .map(|m| m["payload"][0]["op"].as_str().unwrap())
        .collect();
    assert_eq!(t1_ops.first(), Some(&"begin"));
    assert_eq!(t1_ops.last(), Some(&"commit"));
    assert_eq!(t1_ops.iter().filter(|op| **op == "c").count(), 3);
}

/// Startup with no prior state: checkpoints appear under the configured
/// names carrying the header identity.
#[test]
fn first_run_writes_checkpoints_with_header_identity() {
    let sandbox = Sandbox::new();
    let t1 = Xid::new(0, 0, 1);

    let log = LogFileBuilder::new(512, 5)
        .resetlogs(12)
        .activation(34)
        .first_scn(Scn(999_000))
        .next_scn(Scn(1_100_000))
        .add_lwn(
            Scn(1_000_000),
            1_700_000_000,
            vec![begin(t1, 1_000_000), insert(t1, 1_000_001, 501, 1, "1")],
        )
        .add_lwn(Scn(1_000_500), 1_700_000_100, vec![commit(t1, 1_000_500)]);
    write_log(&sandbox.archive(), 5, log);

    sandbox.run(1_000_000);

    let entries = sandbox.metadata_entries();
    assert!(
        entries.contains(&"DB1-chkpt-1000000".to_string()),
        "expected a parser checkpoint at the start scn, got {entries:?}"
    );
    assert!(entries.contains(&"DB1-chkpt".to_string()), "expected a writer checkpoint");

    let writer_chkpt: Value = serde_json::from_slice(
        &std::fs::read(sandbox.dir.path().join("meta").join("DB1-chkpt")).unwrap(),
    )
    .unwrap();
    assert_eq!(writer_chkpt["database"], "DB1");
    assert_eq!(writer_chkpt["resetlogs"], 12);
    assert_eq!(writer_chkpt["activation"], 34);
    assert!(writer_chkpt["scn"].as_u64().unwrap() >= 1_000_000);

    let parser_chkpt: Value = serde_json::from_slice(
        &std::fs::read(sandbox.dir.path().join("meta").join("DB1-chkpt-1000000")).unwrap(),
    )
    .unwrap();
    assert_eq!(parser_chkpt["seq"], 5);
    assert_eq!(parser_chkpt["resetlogs"], 12);
}

/// An online log overwritten mid-read: the reader reports the reuse, the
/// rest of the sequence resumes from the archived copy at the confirmed
/// offset, and the pipeline moves to the next sequence with nothing lost
/// or duplicated.
#[test]
fn overwritten_online_log_switches_without_loss() {
    let sandbox = Sandbox::new();
    let online = sandbox.dir.path().join("redo01.log");
    let t1 = Xid::new(0, 0, 1);
    let t2 = Xid::new(0, 0, 2);

    // Sequence 7 in its online shape: end SCN not known yet.
    LogFileBuilder::new(512, 7)
        .first_scn(Scn(100))
        .add_lwn(
            Scn(100),
            1_700_000_000,
            vec![begin(t1, 100), insert(t1, 101, 501, 1, "1"), commit(t1, 150)],
        )
        .write_to(&online)
        .unwrap();

    let json = format!(
        r#"{{
            "database": "DB1",
            "start-scn": 100,
            "schema": "{meta}",
            "flags": ["schemaless"],
            "memory": {{"chunk-mb": 1, "swap-path": "{swap}"}},
            "reader": {{
                "archive-path": "{archive}",
                "online-logs": [{{"group": 1, "path": "{online}"}}],
                "redo-read-sleep-us": 2000
            }},
            "writer": {{"type": "file", "path": "{out}", "checkpoint-interval-s": 0}}
        }}"#,
        meta = sandbox.dir.path().join("meta").display(),
        swap = sandbox.dir.path().join("swap").display(),
        archive = sandbox.archive().display(),
        online = online.display(),
        out = sandbox.output().display(),
    );
    let config = Config::from_json(&json).unwrap();
    let ctx = Arc::new(Ctx::new(config.database.clone()).with_flags(&config.flags));

    let run_ctx = ctx.clone();
    let pipeline = std::thread::spawn(move || {
        let mut replicator = Replicator::new(run_ctx, config).unwrap();
        replicator.run()
    });

    let wait_for_output = |needle: &str| {
        for _ in 0..750 {
            let content = std::fs::read_to_string(sandbox.output()).unwrap_or_default();
            if content.contains(needle) {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        panic!("output never contained {needle}");
    };

    // The first transaction flows while the log is still current.
    wait_for_output("\"col1\":1");

    // Log switch: the database archives sequence 7 (now carrying its end
    // SCN), then reuses the online file for sequence 8.
    write_log(
        &sandbox.archive(),
        7,
        LogFileBuilder::new(512, 7)
            .first_scn(Scn(100))
            .next_scn(Scn(200))
            .add_lwn(
                Scn(100),
                1_700_000_000,
                vec![begin(t1, 100), insert(t1, 101, 501, 1, "1"), commit(t1, 150)],
            ),
    );
    LogFileBuilder::new(512, 8)
        .first_scn(Scn(200))
        .add_lwn(
            Scn(200),
            1_700_000_020,
            vec![begin(t2, 200), insert(t2, 201, 501, 2, "2"), commit(t2, 250)],
        )
        .write_to(&online)
        .unwrap();

    wait_for_output("\"col1\":2");
    ctx.stop_soft();
    pipeline.join().unwrap().unwrap();

    let messages = sandbox.messages();
    let ids: Vec<u64> = messages
        .iter()
        .flat_map(|m| m["payload"].as_array().unwrap())
        .filter(|op| op["op"] == "c")
        .map(|op| op["after"]["col1"].as_u64().unwrap())
        .collect();
    // Each row exactly once, in sequence order: nothing lost, nothing
    // duplicated across the switch.
    assert_eq!(ids, vec![1, 2]);

    let scns: Vec<u64> = messages.iter().map(|m| m["scn"].as_u64().unwrap()).collect();
    let mut sorted = scns.clone();
    sorted.sort_unstable();
    assert_eq!(scns, sorted);
}

/// Two archived logs process strictly in sequence, nothing lost or
/// duplicated across the switch.
#[test]
fn sequential_logs_switch_cleanly() {
    let sandbox = Sandbox::new();
    let t1 = Xid::new(0, 0, 1);
    let t2 = Xid::new(0, 0, 2);

    let log7 = LogFileBuilder::new(512, 7)
        .first_scn(Scn(100))
        .next_scn(Scn(200))
        .add_lwn(
            Scn(100),
            0,
            vec![begin(t1, 100), insert(t1, 101, 501, 1, "1"), commit(t1, 150)],
        );
    write_log(&sandbox.archive(), 7, log7);

    let log8 = LogFileBuilder::new(512, 8)
        .first_scn(Scn(200))
        .next_scn(Scn(300))
        .add_lwn(
            Scn(200),
            0,
            vec![begin(t2, 200), insert(t2, 201, 501, 2, "2"), commit(t2, 250)],
        );
    write_log(&sandbox.archive(), 8, log8);

    sandbox.run(100);

    let messages = sandbox.messages();
    let ids: Vec<u64> = messages
        .iter()
        .flat_map(|m| m["payload"].as_array().unwrap())
        .filter(|op| op["op"] == "c")
        .map(|op| op["after"]["col1"].as_u64().unwrap())
        .collect();
    // Exactly one insert per file, in file order.
    assert_eq!(ids, vec![1, 2]);

    // Both sequences left parser checkpoints behind.
    let entries = sandbox.metadata_entries();
    assert!(entries.iter().any(|n| n == "DB1-chkpt-100"));
    assert!(entries.iter().any(|n| n == "DB1-chkpt-200"));
}
