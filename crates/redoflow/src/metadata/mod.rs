//! Persisted pipeline state: database identity, schema snapshot and the two
//! checkpoint families.
//!
//! Checkpoints live in two places. The parser checkpoint
//! (`<db>-chkpt-<scn>`) records physical progress: where to resume reading
//! plus the position of the oldest in-flight transaction. The writer
//! checkpoint (`<db>-chkpt`) records logical progress: the consumer's last
//! acknowledged `(scn, idx)`. On restart the writer checkpoint is read
//! first; the newest parser checkpoint at or below the resume SCN decides
//! where the reader starts.

pub mod schema;
pub mod store;

use crate::context::Ctx;
use crate::error::{RedoError, Result};
use crate::types::{Activation, FileOffset, Resetlogs, Scn, Seq, Xid};
use parking_lot::{Mutex, RwLock};
use schema::{Schema, SchemaSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use store::MetadataStore;

const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

/// Physical progress record written after each LWN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ParserCheckpoint {
    pub database: String,
    pub scn: Scn,
    pub seq: Seq,
    pub offset: FileOffset,
    pub resetlogs: Resetlogs,
    pub activation: Activation,
    pub timestamp: u32,
    /// Bytes parsed since the previous checkpoint
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_seq: Option<Seq>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_offset: Option<FileOffset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_xid: Option<Xid>,
}

/// Logical progress record driven by consumer acknowledgments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WriterCheckpoint {
    pub database: String,
    pub scn: Scn,
    pub idx: u64,
    pub resetlogs: Resetlogs,
    pub activation: Activation,
}

#[derive(Debug)]
struct Identity {
    resetlogs: Resetlogs,
    activation: Activation,
    /// First SCN the consumer asked for; output below this is suppressed
    first_data_scn: Scn,
    /// Consumer's confirmed SCN recovered from the writer checkpoint
    client_scn: Scn,
    client_idx: u64,
    /// Resume position for the parser after recovery or a log switch
    sequence: Seq,
    file_offset: FileOffset,
}

impl Default for Identity {
    fn default() -> Self {
        Identity {
            resetlogs: 0,
            activation: 0,
            first_data_scn: Scn::NONE,
            client_scn: Scn::NONE,
            client_idx: 0,
            sequence: Seq::ZERO,
            file_offset: FileOffset::ZERO,
        }
    }
}

/// The metadata hub shared by parser, writer and replicator.
pub struct Metadata {
    pub ctx: Arc<Ctx>,
    store: Arc<dyn MetadataStore>,
    database: String,
    checkpoints_keep: usize,
    identity: Mutex<Identity>,
    pub schema: RwLock<Schema>,
}

impl Metadata {
    pub fn new(ctx: Arc<Ctx>, store: Arc<dyn MetadataStore>, database: impl Into<String>) -> Self {
        Metadata {
            ctx,
            store,
            database: database.into(),
            checkpoints_keep: 100,
            identity: Mutex::new(Identity::default()),
            schema: RwLock::new(Schema::empty()),
        }
    }

    pub fn with_checkpoints_keep(mut self, keep: usize) -> Self {
        self.checkpoints_keep = keep.max(1);
        self
    }

    fn chkpt_name(&self, scn: Scn) -> String {
        format!("{}-chkpt-{}", self.database, scn.0)
    }

    fn writer_chkpt_name(&self) -> String {
        format!("{}-chkpt", self.database)
    }

    fn schema_name(&self) -> String {
        format!("{}-schema", self.database)
    }

    // --- identity -----------------------------------------------------

    pub fn resetlogs(&self) -> Resetlogs {
        self.identity.lock().resetlogs
    }

    pub fn set_resetlogs(&self, value: Resetlogs) {
        self.identity.lock().resetlogs = value;
    }

    pub fn activation(&self) -> Activation {
        self.identity.lock().activation
    }

    pub fn set_activation(&self, value: Activation) {
        self.identity.lock().activation = value;
    }

    pub fn first_data_scn(&self) -> Scn {
        self.identity.lock().first_data_scn
    }

    pub fn set_first_data_scn(&self, scn: Scn) {
        self.identity.lock().first_data_scn = scn;
    }

    pub fn client_scn(&self) -> Scn {
        self.identity.lock().client_scn
    }

    pub fn client_idx(&self) -> u64 {
        self.identity.lock().client_idx
    }

    pub fn sequence(&self) -> Seq {
        self.identity.lock().sequence
    }

    pub fn set_sequence(&self, seq: Seq) {
        self.identity.lock().sequence = seq;
    }

    pub fn file_offset(&self) -> FileOffset {
        self.identity.lock().file_offset
    }

    pub fn set_file_offset(&self, offset: FileOffset) {
        self.identity.lock().file_offset = offset;
    }

    // --- parser checkpoints -------------------------------------------

    /// Persist a parser checkpoint and garbage-collect old ones.
    #[allow(clippy::too_many_arguments)]
    pub fn checkpoint(
        &self,
        scn: Scn,
        timestamp: u32,
        seq: Seq,
        offset: FileOffset,
        bytes: u64,
        min_seq: Seq,
        min_offset: FileOffset,
        min_xid: Xid,
    ) -> Result<()> {
        let record = {
            let identity = self.identity.lock();
            ParserCheckpoint {
                database: self.database.clone(),
                scn,
                seq,
                offset,
                resetlogs: identity.resetlogs,
                activation: identity.activation,
                timestamp,
                bytes,
                min_seq: (!min_seq.is_none()).then_some(min_seq),
                min_offset: (!min_seq.is_none()).then_some(min_offset),
                min_xid: (!min_xid.is_zero()).then_some(min_xid),
            }
        };
        let json = serde_json::to_vec_pretty(&record)?;
        self.store.write(&self.chkpt_name(scn), &json)?;
        tracing::debug!(scn = %scn, seq = %seq, offset = %offset, "parser checkpoint written");
        metrics::counter!("redoflow_metadata_checkpoints_total").increment(1);

        self.gc_checkpoints()?;
        Ok(())
    }

    fn checkpoint_scns(&self) -> Result<Vec<u64>> {
        let prefix = format!("{}-chkpt-", self.database);
        let mut scns: Vec<u64> = self
            .store
            .list()?
            .into_iter()
            .filter_map(|name| name.strip_prefix(&prefix).and_then(|s| s.parse().ok()))
            .collect();
        scns.sort_unstable();
        Ok(scns)
    }

    /// Drop checkpoints below the retained minimum (the newest
    /// `checkpoints_keep` entries define it).
    fn gc_checkpoints(&self) -> Result<()> {
        let scns = self.checkpoint_scns()?;
        if scns.len() <= self.checkpoints_keep {
            return Ok(());
        }
        let cut = scns.len() - self.checkpoints_keep;
        for scn in &scns[..cut] {
            self.store.drop_entry(&self.chkpt_name(Scn(*scn)))?;
            tracing::debug!(scn, "dropped old parser checkpoint");
        }
        Ok(())
    }

    pub fn read_checkpoint(&self, scn: Scn) -> Result<Option<ParserCheckpoint>> {
        match self.store.read(&self.chkpt_name(scn), MAX_ENTRY_SIZE)? {
            Some(bytes) => {
                let record: ParserCheckpoint = serde_json::from_slice(&bytes)
                    .map_err(|e| RedoError::data(30008, format!("bad checkpoint {scn}: {e}")))?;
                if record.database != self.database {
                    return Err(RedoError::data(
                        30009,
                        format!("checkpoint {} belongs to database {}", scn, record.database),
                    ));
                }
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    // --- writer checkpoint --------------------------------------------

    pub fn write_writer_checkpoint(&self, scn: Scn, idx: u64) -> Result<()> {
        let record = {
            let mut identity = self.identity.lock();
            identity.client_scn = scn;
            identity.client_idx = idx;
            WriterCheckpoint {
                database: self.database.clone(),
                scn,
                idx,
                resetlogs: identity.resetlogs,
                activation: identity.activation,
            }
        };
        let json = serde_json::to_vec_pretty(&record)?;
        self.store.write(&self.writer_chkpt_name(), &json)?;
        tracing::debug!(scn = %scn, idx, "writer checkpoint written");
        Ok(())
    }

    pub fn read_writer_checkpoint(&self) -> Result<Option<WriterCheckpoint>> {
        match self.store.read(&self.writer_chkpt_name(), MAX_ENTRY_SIZE)? {
            Some(bytes) => {
                let record: WriterCheckpoint = serde_json::from_slice(&bytes)
                    .map_err(|e| RedoError::data(30010, format!("bad writer checkpoint: {e}")))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    // --- schema snapshot ----------------------------------------------

    pub fn write_schema_snapshot(&self, snapshot: &SchemaSnapshot) -> Result<()> {
        self.store.write(&self.schema_name(), &snapshot.to_json()?)
    }

    pub fn read_schema_snapshot(&self) -> Result<Option<SchemaSnapshot>> {
        match self.store.read(&self.schema_name(), MAX_ENTRY_SIZE)? {
            Some(bytes) => Ok(Some(SchemaSnapshot::from_json(&bytes)?)),
            None => Ok(None),
        }
    }

    // --- recovery -----------------------------------------------------

    /// Restore state after a restart: writer checkpoint first (sets the
    /// client position), then the newest parser checkpoint at or below the
    /// resume SCN (sets the reader position).
    pub fn recover(&self, start_scn: Scn) -> Result<()> {
        if let Some(writer) = self.read_writer_checkpoint()? {
            let mut identity = self.identity.lock();
            identity.client_scn = writer.scn;
            identity.client_idx = writer.idx;
            if identity.resetlogs == 0 {
                identity.resetlogs = writer.resetlogs;
            }
            if identity.activation == 0 {
                identity.activation = writer.activation;
            }
            tracing::info!(scn = %writer.scn, idx = writer.idx, "recovered writer checkpoint");
        }

        let resume_scn = {
            let identity = self.identity.lock();
            if !identity.client_scn.is_none() {
                identity.client_scn
            } else if !start_scn.is_none() {
                start_scn
            } else {
                Scn::NONE
            }
        };

        {
            let mut identity = self.identity.lock();
            if identity.first_data_scn.is_none() && !resume_scn.is_none() {
                identity.first_data_scn = resume_scn;
            }
        }

        if resume_scn.is_none() {
            return Ok(());
        }

        let scns = self.checkpoint_scns()?;
        let candidate = scns.iter().rev().find(|s| Scn(**s) <= resume_scn).copied();
        if let Some(scn) = candidate {
            if let Some(record) = self.read_checkpoint(Scn(scn))? {
                let mut identity = self.identity.lock();
                // Resume from the oldest in-flight transaction when one was
                // pending, otherwise from the checkpoint position itself.
                match (record.min_seq, record.min_offset) {
                    (Some(seq), Some(offset)) => {
                        identity.sequence = seq;
                        identity.file_offset = offset;
                    }
                    _ => {
                        identity.sequence = record.seq;
                        identity.file_offset = record.offset;
                    }
                }
                if identity.resetlogs == 0 {
                    identity.resetlogs = record.resetlogs;
                }
                if identity.activation == 0 {
                    identity.activation = record.activation;
                }
                tracing::info!(
                    scn,
                    seq = %identity.sequence,
                    offset = %identity.file_offset,
                    "recovered parser checkpoint"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::store::MemStore;

    fn metadata() -> Metadata {
        let ctx = Arc::new(Ctx::new("DB1"));
        Metadata::new(ctx, Arc::new(MemStore::new()), "DB1")
    }

    fn write_chkpt(md: &Metadata, scn: u64, seq: u32) {
        md.checkpoint(
            Scn(scn),
            1_700_000_000,
            Seq(seq),
            FileOffset(4096),
            8192,
            Seq::NONE,
            FileOffset::ZERO,
            Xid::ZERO,
        )
        .unwrap();
    }

    #[test]
    fn parser_checkpoint_round_trip() {
        let md = metadata();
        md.set_resetlogs(7);
        md.set_activation(9);
        write_chkpt(&md, 1000, 3);
        let record = md.read_checkpoint(Scn(1000)).unwrap().unwrap();
        assert_eq!(record.scn, Scn(1000));
        assert_eq!(record.seq, Seq(3));
        assert_eq!(record.resetlogs, 7);
        assert_eq!(record.activation, 9);
        assert_eq!(record.min_seq, None);
        assert_eq!(record.min_xid, None);
    }

    #[test]
    fn min_position_is_recorded_when_present() {
        let md = metadata();
        md.checkpoint(
            Scn(2000),
            0,
            Seq(5),
            FileOffset(8192),
            100,
            Seq(4),
            FileOffset(1024),
            Xid::new(1, 2, 3),
        )
        .unwrap();
        let record = md.read_checkpoint(Scn(2000)).unwrap().unwrap();
        assert_eq!(record.min_seq, Some(Seq(4)));
        assert_eq!(record.min_offset, Some(FileOffset(1024)));
        assert_eq!(record.min_xid, Some(Xid::new(1, 2, 3)));
    }

    #[test]
    fn old_checkpoints_are_garbage_collected() {
        let ctx = Arc::new(Ctx::new("DB1"));
        let md = Metadata::new(ctx, Arc::new(MemStore::new()), "DB1").with_checkpoints_keep(3);
        for scn in 1..=6u64 {
            write_chkpt(&md, scn * 100, scn as u32);
        }
        let scns = md.checkpoint_scns().unwrap();
        assert_eq!(scns, vec![400, 500, 600]);
    }

    #[test]
    fn writer_checkpoint_round_trip() {
        let md = metadata();
        md.set_resetlogs(7);
        md.write_writer_checkpoint(Scn(5000), 3).unwrap();
        let record = md.read_writer_checkpoint().unwrap().unwrap();
        assert_eq!(record.scn, Scn(5000));
        assert_eq!(record.idx, 3);
        assert_eq!(record.resetlogs, 7);
        assert_eq!(md.client_scn(), Scn(5000));
        assert_eq!(md.client_idx(), 3);
    }

    // Both Metadata instances in the recovery tests must share one store.
    fn metadata_pair() -> (Metadata, Metadata) {
        let store = Arc::new(MemStore::new());
        let a = Metadata::new(Arc::new(Ctx::new("DB1")), store.clone(), "DB1");
        let b = Metadata::new(Arc::new(Ctx::new("DB1")), store, "DB1");
        (a, b)
    }

    #[test]
    fn recover_with_shared_store() {
        let (md, md2) = metadata_pair();
        md.set_resetlogs(7);
        write_chkpt(&md, 900, 2);
        md.write_writer_checkpoint(Scn(1000), 4).unwrap();

        md2.recover(Scn::NONE).unwrap();
        assert_eq!(md2.client_scn(), Scn(1000));
        assert_eq!(md2.client_idx(), 4);
        assert_eq!(md2.sequence(), Seq(2));
        assert_eq!(md2.resetlogs(), 7);
    }

    #[test]
    fn recover_uses_min_position_when_pending() {
        let (md, md2) = metadata_pair();
        md.checkpoint(
            Scn(1000),
            0,
            Seq(9),
            FileOffset(90_112),
            0,
            Seq(8),
            FileOffset(2048),
            Xid::new(1, 1, 1),
        )
        .unwrap();

        md2.recover(Scn(1000)).unwrap();
        assert_eq!(md2.sequence(), Seq(8));
        assert_eq!(md2.file_offset(), FileOffset(2048));
    }

    #[test]
    fn recover_empty_store_is_clean_start() {
        let md = metadata();
        md.recover(Scn(1_000_000)).unwrap();
        assert!(md.client_scn().is_none());
        assert_eq!(md.first_data_scn(), Scn(1_000_000));
        assert_eq!(md.sequence(), Seq::ZERO);
    }

    #[test]
    fn checkpoint_of_wrong_database_is_rejected() {
        let store = Arc::new(MemStore::new());
        let other = Metadata::new(Arc::new(Ctx::new("OTHER")), store.clone(), "OTHER");
        other
            .checkpoint(Scn(5), 0, Seq(1), FileOffset::ZERO, 0, Seq::NONE, FileOffset::ZERO, Xid::ZERO)
            .unwrap();

        // Same entry name pattern, different database field.
        let bytes = store.read("OTHER-chkpt-5", MAX_ENTRY_SIZE).unwrap().unwrap();
        let mine = Metadata::new(Arc::new(Ctx::new("DB1")), store.clone(), "DB1");
        store.write("DB1-chkpt-5", &bytes).unwrap();
        let err = mine.read_checkpoint(Scn(5)).unwrap_err();
        assert_eq!(err.code(), 30009);
    }
}
