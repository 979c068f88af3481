//! Record layout and the canonical decoded operation.
//!
//! A record starts with a 20-byte header: total size, a validity byte, the
//! 48-bit SCN split across two fields, and the sub-SCN. When the validity
//! byte carries the LWN bit the header is followed by a 24-byte LWN
//! extension naming the group this record opens. The body begins with a
//! fixed preamble `(layer, code, flags, obj, xid)` and continues with
//! length-prefixed, 4-byte-aligned fields.
//!
//! Decoded operations are re-encoded into transaction chunks with the entry
//! codec at the bottom of this file; the builder walks those entries in
//! append order.

use crate::error::{RedoError, Result};
use crate::types::{Scn, SubScn, Xid};
use bytes::{Buf, BufMut};

pub const RECORD_HEADER_SIZE: usize = 20;
pub const LWN_EXT_SIZE: usize = 24;
pub const BODY_PREAMBLE_SIZE: usize = 16;

/// Validity bit: this record opens an LWN and carries the extension.
pub const VLD_LWN_START: u8 = 0x04;

// Layers and codes of the operations the pipeline consumes.
pub const LAYER_TXN: u8 = 5;
pub const CODE_TXN_UNDO: u8 = 1;
pub const CODE_TXN_BEGIN: u8 = 2;
pub const CODE_TXN_COMMIT: u8 = 4;
pub const LAYER_ROW: u8 = 11;
pub const CODE_ROW_INSERT: u8 = 2;
pub const CODE_ROW_DELETE: u8 = 3;
pub const CODE_ROW_UPDATE: u8 = 5;
pub const CODE_ROW_MULTI_INSERT: u8 = 11;
pub const CODE_ROW_MULTI_DELETE: u8 = 12;
pub const CODE_ROW_SUPPLEMENTAL: u8 = 16;
pub const LAYER_DDL: u8 = 24;
pub const CODE_DDL: u8 = 1;
pub const LAYER_LOB: u8 = 26;
pub const CODE_LOB_WRITE: u8 = 2;

/// Commit-record flag: this is a rollback, not a commit.
pub const TXN_FLAG_ROLLBACK: u16 = 0x0001;

/// One decoded column value. The physical micro-decoders live outside the
/// core; this is the canonical shape they produce.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Text(String),
    /// Decimal rendered as its text form to keep precision
    Number(String),
    Binary(Vec<u8>),
    /// Microseconds since the unix epoch, no zone
    Timestamp(i64),
    /// Microseconds since the unix epoch plus zone offset in minutes
    TimestampTz(i64, i16),
    /// Day-to-second interval in microseconds
    IntervalDs(i64),
    /// Year-to-month interval in months
    IntervalYm(i32),
    /// LOB locator resolved by the builder against the LOB context
    LobLocator(u64),
}

const KIND_NULL: u8 = 0;
const KIND_TEXT: u8 = 1;
const KIND_NUMBER: u8 = 2;
const KIND_BINARY: u8 = 3;
const KIND_TIMESTAMP: u8 = 4;
const KIND_TIMESTAMP_TZ: u8 = 5;
const KIND_INTERVAL_DS: u8 = 6;
const KIND_INTERVAL_YM: u8 = 7;
const KIND_LOB_LOCATOR: u8 = 8;

/// A column number plus its value.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub col: u16,
    pub value: ColumnValue,
}

impl ColumnRef {
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.put_u16_le(self.col);
        match &self.value {
            ColumnValue::Null => {
                buf.put_u8(KIND_NULL);
                buf.put_u8(0);
            }
            ColumnValue::Text(s) => {
                buf.put_u8(KIND_TEXT);
                buf.put_u8(0);
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            ColumnValue::Number(s) => {
                buf.put_u8(KIND_NUMBER);
                buf.put_u8(0);
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            ColumnValue::Binary(b) => {
                buf.put_u8(KIND_BINARY);
                buf.put_u8(0);
                buf.put_u32_le(b.len() as u32);
                buf.put_slice(b);
            }
            ColumnValue::Timestamp(us) => {
                buf.put_u8(KIND_TIMESTAMP);
                buf.put_u8(0);
                buf.put_i64_le(*us);
            }
            ColumnValue::TimestampTz(us, tz) => {
                buf.put_u8(KIND_TIMESTAMP_TZ);
                buf.put_u8(0);
                buf.put_i64_le(*us);
                buf.put_i16_le(*tz);
            }
            ColumnValue::IntervalDs(us) => {
                buf.put_u8(KIND_INTERVAL_DS);
                buf.put_u8(0);
                buf.put_i64_le(*us);
            }
            ColumnValue::IntervalYm(months) => {
                buf.put_u8(KIND_INTERVAL_YM);
                buf.put_u8(0);
                buf.put_i32_le(*months);
            }
            ColumnValue::LobLocator(id) => {
                buf.put_u8(KIND_LOB_LOCATOR);
                buf.put_u8(0);
                buf.put_u64_le(*id);
            }
        }
    }

    pub fn read(buf: &mut &[u8]) -> Result<ColumnRef> {
        if buf.remaining() < 4 {
            return Err(truncated("column header"));
        }
        let col = buf.get_u16_le();
        let kind = buf.get_u8();
        let _ = buf.get_u8();
        let value = match kind {
            KIND_NULL => ColumnValue::Null,
            KIND_TEXT | KIND_NUMBER | KIND_BINARY => {
                if buf.remaining() < 4 {
                    return Err(truncated("column size"));
                }
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    return Err(truncated("column data"));
                }
                let data = buf[..len].to_vec();
                buf.advance(len);
                match kind {
                    KIND_TEXT => ColumnValue::Text(utf8(data)?),
                    KIND_NUMBER => ColumnValue::Number(utf8(data)?),
                    _ => ColumnValue::Binary(data),
                }
            }
            KIND_TIMESTAMP => {
                if buf.remaining() < 8 {
                    return Err(truncated("timestamp"));
                }
                ColumnValue::Timestamp(buf.get_i64_le())
            }
            KIND_TIMESTAMP_TZ => {
                if buf.remaining() < 10 {
                    return Err(truncated("timestamp tz"));
                }
                ColumnValue::TimestampTz(buf.get_i64_le(), buf.get_i16_le())
            }
            KIND_INTERVAL_DS => {
                if buf.remaining() < 8 {
                    return Err(truncated("interval ds"));
                }
                ColumnValue::IntervalDs(buf.get_i64_le())
            }
            KIND_INTERVAL_YM => {
                if buf.remaining() < 4 {
                    return Err(truncated("interval ym"));
                }
                ColumnValue::IntervalYm(buf.get_i32_le())
            }
            KIND_LOB_LOCATOR => {
                if buf.remaining() < 8 {
                    return Err(truncated("lob locator"));
                }
                ColumnValue::LobLocator(buf.get_u64_le())
            }
            other => {
                return Err(RedoError::redo(40021, format!("unknown column value kind: {other}")))
            }
        };
        Ok(ColumnRef { col, value })
    }
}

fn utf8(data: Vec<u8>) -> Result<String> {
    String::from_utf8(data).map_err(|_| RedoError::redo(40022, "column text is not valid UTF-8"))
}

fn truncated(what: &str) -> RedoError {
    RedoError::redo(40020, format!("record truncated in {what}"))
}

/// One row's images inside a multi-row operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RowImage {
    pub slot: u16,
    pub columns: Vec<ColumnRef>,
}

/// Canonical decoded operation; what the opcode handlers hand to the
/// transaction layer and the builder consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum RedoOp {
    Begin { name: String },
    Commit { rollback: bool },
    PartialRollback { dba: u32, slot: u16 },
    Insert { dba: u32, slot: u16, after: Vec<ColumnRef> },
    Delete { dba: u32, slot: u16, before: Vec<ColumnRef> },
    Update { dba: u32, slot: u16, before: Vec<ColumnRef>, after: Vec<ColumnRef> },
    MultiInsert { dba: u32, rows: Vec<RowImage> },
    MultiDelete { dba: u32, rows: Vec<RowImage> },
    Supplemental { dba: u32, slot: u16, key: Vec<ColumnRef> },
    Ddl { ddl_type: u16, sql: String, name: String },
    LobWrite { lob_id: u64, page_no: u32, data: Vec<u8> },
}

impl RedoOp {
    pub fn kind(&self) -> u8 {
        match self {
            RedoOp::Begin { .. } => 1,
            RedoOp::Commit { .. } => 2,
            RedoOp::PartialRollback { .. } => 3,
            RedoOp::Insert { .. } => 4,
            RedoOp::Delete { .. } => 5,
            RedoOp::Update { .. } => 6,
            RedoOp::MultiInsert { .. } => 7,
            RedoOp::MultiDelete { .. } => 8,
            RedoOp::Supplemental { .. } => 9,
            RedoOp::Ddl { .. } => 10,
            RedoOp::LobWrite { .. } => 11,
        }
    }

    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            RedoOp::Insert { .. }
                | RedoOp::Delete { .. }
                | RedoOp::Update { .. }
                | RedoOp::MultiInsert { .. }
                | RedoOp::MultiDelete { .. }
        )
    }

    /// Row address used for matching partial rollbacks; `(dba, slot)`.
    pub fn row_address(&self) -> Option<(u32, u16)> {
        match self {
            RedoOp::Insert { dba, slot, .. }
            | RedoOp::Delete { dba, slot, .. }
            | RedoOp::Update { dba, slot, .. } => Some((*dba, *slot)),
            _ => None,
        }
    }
}

/// Position and identity of a record; travels with the op into the
/// transaction chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    pub scn: Scn,
    pub sub_scn: SubScn,
    pub xid: Xid,
    pub obj: u32,
    pub flags: u16,
}

/// A fully decoded record.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub meta: RecordMeta,
    pub op: RedoOp,
}

// --- transaction chunk entry codec ------------------------------------

/// Per-entry header inside a transaction chunk. Carries the row address so
/// partial rollback can match without decoding the payload.
pub const ENTRY_HEADER_SIZE: usize = 32;

/// Entry flag: cancelled by a partial rollback, the builder skips it.
pub const ENTRY_FLAG_DEAD: u8 = 0x01;

#[derive(Debug, Clone, Copy)]
pub struct EntryHeader {
    pub len: u32,
    pub kind: u8,
    pub flags: u8,
    pub slot: u16,
    pub obj: u32,
    pub dba: u32,
    pub scn: Scn,
    pub sub_scn: SubScn,
}

/// Serialize an op (with its metadata) into the transaction chunk form.
pub fn encode_entry(meta: &RecordMeta, op: &RedoOp) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    encode_op(op, &mut payload);

    let (dba, slot) = op.row_address().unwrap_or((0, 0));
    let len = (ENTRY_HEADER_SIZE + payload.len()) as u32;
    let mut out = Vec::with_capacity(len as usize);
    out.put_u32_le(len);
    out.put_u8(op.kind());
    out.put_u8(0); // flags
    out.put_u16_le(slot);
    out.put_u32_le(meta.obj);
    out.put_u32_le(dba);
    out.put_u64_le(meta.scn.0);
    out.put_u16_le(meta.sub_scn);
    out.put_u16_le(0);
    out.put_u32_le(0);
    out.extend_from_slice(&payload);
    out
}

pub fn decode_entry_header(bytes: &[u8]) -> Result<EntryHeader> {
    if bytes.len() < ENTRY_HEADER_SIZE {
        return Err(truncated("entry header"));
    }
    let mut buf = bytes;
    let len = buf.get_u32_le();
    let kind = buf.get_u8();
    let flags = buf.get_u8();
    let slot = buf.get_u16_le();
    let obj = buf.get_u32_le();
    let dba = buf.get_u32_le();
    let scn = Scn(buf.get_u64_le());
    let sub_scn = buf.get_u16_le();
    Ok(EntryHeader { len, kind, flags, slot, obj, dba, scn, sub_scn })
}

pub fn decode_entry_op(bytes: &[u8]) -> Result<RedoOp> {
    let header = decode_entry_header(bytes)?;
    if (header.len as usize) > bytes.len() {
        return Err(truncated("entry payload"));
    }
    let mut payload = &bytes[ENTRY_HEADER_SIZE..header.len as usize];
    decode_op(header.kind, &mut payload)
}

fn write_columns(cols: &[ColumnRef], buf: &mut Vec<u8>) {
    buf.put_u16_le(cols.len() as u16);
    buf.put_u16_le(0);
    for col in cols {
        col.write(buf);
    }
}

fn read_columns(buf: &mut &[u8]) -> Result<Vec<ColumnRef>> {
    if buf.remaining() < 4 {
        return Err(truncated("column count"));
    }
    let count = buf.get_u16_le() as usize;
    let _ = buf.get_u16_le();
    let mut cols = Vec::with_capacity(count);
    for _ in 0..count {
        cols.push(ColumnRef::read(buf)?);
    }
    Ok(cols)
}

fn write_rows(rows: &[RowImage], buf: &mut Vec<u8>) {
    buf.put_u16_le(rows.len() as u16);
    buf.put_u16_le(0);
    for row in rows {
        buf.put_u16_le(row.slot);
        buf.put_u16_le(0);
        write_columns(&row.columns, buf);
    }
}

fn read_rows(buf: &mut &[u8]) -> Result<Vec<RowImage>> {
    if buf.remaining() < 4 {
        return Err(truncated("row count"));
    }
    let count = buf.get_u16_le() as usize;
    let _ = buf.get_u16_le();
    let mut rows = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.remaining() < 4 {
            return Err(truncated("row header"));
        }
        let slot = buf.get_u16_le();
        let _ = buf.get_u16_le();
        rows.push(RowImage { slot, columns: read_columns(buf)? });
    }
    Ok(rows)
}

fn write_text(s: &str, buf: &mut Vec<u8>) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn read_text(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 4 {
        return Err(truncated("text size"));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(truncated("text data"));
    }
    let data = buf[..len].to_vec();
    buf.advance(len);
    utf8(data)
}

fn encode_op(op: &RedoOp, buf: &mut Vec<u8>) {
    match op {
        RedoOp::Begin { name } => write_text(name, buf),
        RedoOp::Commit { rollback } => buf.put_u8(u8::from(*rollback)),
        RedoOp::PartialRollback { dba, slot } => {
            buf.put_u32_le(*dba);
            buf.put_u16_le(*slot);
        }
        RedoOp::Insert { dba, slot, after } => {
            buf.put_u32_le(*dba);
            buf.put_u16_le(*slot);
            buf.put_u16_le(0);
            write_columns(after, buf);
        }
        RedoOp::Delete { dba, slot, before } => {
            buf.put_u32_le(*dba);
            buf.put_u16_le(*slot);
            buf.put_u16_le(0);
            write_columns(before, buf);
        }
        RedoOp::Update { dba, slot, before, after } => {
            buf.put_u32_le(*dba);
            buf.put_u16_le(*slot);
            buf.put_u16_le(0);
            write_columns(before, buf);
            write_columns(after, buf);
        }
        RedoOp::MultiInsert { dba, rows } | RedoOp::MultiDelete { dba, rows } => {
            buf.put_u32_le(*dba);
            write_rows(rows, buf);
        }
        RedoOp::Supplemental { dba, slot, key } => {
            buf.put_u32_le(*dba);
            buf.put_u16_le(*slot);
            buf.put_u16_le(0);
            write_columns(key, buf);
        }
        RedoOp::Ddl { ddl_type, sql, name } => {
            buf.put_u16_le(*ddl_type);
            buf.put_u16_le(0);
            write_text(sql, buf);
            write_text(name, buf);
        }
        RedoOp::LobWrite { lob_id, page_no, data } => {
            buf.put_u64_le(*lob_id);
            buf.put_u32_le(*page_no);
            buf.put_u32_le(data.len() as u32);
            buf.put_slice(data);
        }
    }
}

fn decode_op(kind: u8, buf: &mut &[u8]) -> Result<RedoOp> {
    Ok(match kind {
        1 => RedoOp::Begin { name: read_text(buf)? },
        2 => {
            if buf.remaining() < 1 {
                return Err(truncated("commit"));
            }
            RedoOp::Commit { rollback: buf.get_u8() != 0 }
        }
        3 => {
            if buf.remaining() < 6 {
                return Err(truncated("partial rollback"));
            }
            RedoOp::PartialRollback { dba: buf.get_u32_le(), slot: buf.get_u16_le() }
        }
        4 | 5 | 6 => {
            if buf.remaining() < 8 {
                return Err(truncated("row op"));
            }
            let dba = buf.get_u32_le();
            let slot = buf.get_u16_le();
            let _ = buf.get_u16_le();
            match kind {
                4 => RedoOp::Insert { dba, slot, after: read_columns(buf)? },
                5 => RedoOp::Delete { dba, slot, before: read_columns(buf)? },
                _ => RedoOp::Update {
                    dba,
                    slot,
                    before: read_columns(buf)?,
                    after: read_columns(buf)?,
                },
            }
        }
        7 | 8 => {
            if buf.remaining() < 4 {
                return Err(truncated("multi row op"));
            }
            let dba = buf.get_u32_le();
            let rows = read_rows(buf)?;
            if kind == 7 {
                RedoOp::MultiInsert { dba, rows }
            } else {
                RedoOp::MultiDelete { dba, rows }
            }
        }
        9 => {
            if buf.remaining() < 8 {
                return Err(truncated("supplemental"));
            }
            let dba = buf.get_u32_le();
            let slot = buf.get_u16_le();
            let _ = buf.get_u16_le();
            RedoOp::Supplemental { dba, slot, key: read_columns(buf)? }
        }
        10 => {
            if buf.remaining() < 4 {
                return Err(truncated("ddl"));
            }
            let ddl_type = buf.get_u16_le();
            let _ = buf.get_u16_le();
            RedoOp::Ddl { ddl_type, sql: read_text(buf)?, name: read_text(buf)? }
        }
        11 => {
            if buf.remaining() < 16 {
                return Err(truncated("lob write"));
            }
            let lob_id = buf.get_u64_le();
            let page_no = buf.get_u32_le();
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(truncated("lob data"));
            }
            let data = buf[..len].to_vec();
            buf.advance(len);
            RedoOp::LobWrite { lob_id, page_no, data }
        }
        other => return Err(RedoError::redo(40023, format!("unknown entry kind: {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> RecordMeta {
        RecordMeta { scn: Scn(100), sub_scn: 2, xid: Xid::new(1, 2, 3), obj: 81337, flags: 0 }
    }

    fn col(n: u16, v: ColumnValue) -> ColumnRef {
        ColumnRef { col: n, value: v }
    }

    #[test]
    fn entry_round_trip_insert() {
        let op = RedoOp::Insert {
            dba: 4096,
            slot: 7,
            after: vec![
                col(1, ColumnValue::Number("42".into())),
                col(2, ColumnValue::Text("alice".into())),
                col(3, ColumnValue::Null),
            ],
        };
        let bytes = encode_entry(&meta(), &op);
        let header = decode_entry_header(&bytes).unwrap();
        assert_eq!(header.len as usize, bytes.len());
        assert_eq!(header.obj, 81337);
        assert_eq!(header.dba, 4096);
        assert_eq!(header.slot, 7);
        assert_eq!(header.scn, Scn(100));
        assert_eq!(decode_entry_op(&bytes).unwrap(), op);
    }

    #[test]
    fn entry_round_trip_update_with_typed_values() {
        let op = RedoOp::Update {
            dba: 8192,
            slot: 1,
            before: vec![col(2, ColumnValue::Timestamp(1_700_000_000_000_000))],
            after: vec![
                col(2, ColumnValue::TimestampTz(1_700_000_000_000_000, 120)),
                col(3, ColumnValue::Binary(vec![0xDE, 0xAD])),
                col(4, ColumnValue::IntervalYm(14)),
            ],
        };
        let bytes = encode_entry(&meta(), &op);
        assert_eq!(decode_entry_op(&bytes).unwrap(), op);
    }

    #[test]
    fn entry_round_trip_multi_insert() {
        let op = RedoOp::MultiInsert {
            dba: 100,
            rows: vec![
                RowImage { slot: 1, columns: vec![col(1, ColumnValue::Number("1".into()))] },
                RowImage { slot: 2, columns: vec![col(1, ColumnValue::Number("2".into()))] },
            ],
        };
        let bytes = encode_entry(&meta(), &op);
        assert_eq!(decode_entry_op(&bytes).unwrap(), op);
    }

    #[test]
    fn entry_round_trip_ddl_and_lob() {
        let ddl = RedoOp::Ddl { ddl_type: 1, sql: "CREATE TABLE t (id NUMBER)".into(), name: "T".into() };
        let bytes = encode_entry(&meta(), &ddl);
        assert_eq!(decode_entry_op(&bytes).unwrap(), ddl);

        let lob = RedoOp::LobWrite { lob_id: 9, page_no: 3, data: vec![1, 2, 3] };
        let bytes = encode_entry(&meta(), &lob);
        assert_eq!(decode_entry_op(&bytes).unwrap(), lob);
    }

    #[test]
    fn truncated_entry_is_redo_error() {
        let op = RedoOp::Begin { name: "app".into() };
        let bytes = encode_entry(&meta(), &op);
        let err = decode_entry_op(&bytes[..ENTRY_HEADER_SIZE + 2]).unwrap_err();
        assert_eq!(err.code(), 40020);
    }

    #[test]
    fn row_address_only_for_single_row_dml() {
        assert_eq!(
            RedoOp::Insert { dba: 5, slot: 6, after: vec![] }.row_address(),
            Some((5, 6))
        );
        assert_eq!(RedoOp::Begin { name: String::new() }.row_address(), None);
        assert_eq!(RedoOp::MultiInsert { dba: 5, rows: vec![] }.row_address(), None);
    }

    #[test]
    fn dml_classification() {
        assert!(RedoOp::Insert { dba: 0, slot: 0, after: vec![] }.is_dml());
        assert!(RedoOp::MultiDelete { dba: 0, rows: vec![] }.is_dml());
        assert!(!RedoOp::Commit { rollback: false }.is_dml());
        assert!(!RedoOp::LobWrite { lob_id: 0, page_no: 0, data: vec![] }.is_dml());
    }
}
