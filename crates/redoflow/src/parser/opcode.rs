//! Opcode dispatch: raw record bytes to a canonical operation.
//!
//! The record body opens with `(layer, code, flags, obj, xid)`; a table over
//! `(layer, code)` routes to the field decoder for that shape. Unknown
//! opcodes surface as `None` so the parse loop can skip or abort them per
//! policy.

use super::record::{
    ColumnRef, DecodedRecord, RecordMeta, RedoOp, RowImage, BODY_PREAMBLE_SIZE, CODE_DDL,
    CODE_LOB_WRITE, CODE_ROW_DELETE, CODE_ROW_INSERT, CODE_ROW_MULTI_DELETE,
    CODE_ROW_MULTI_INSERT, CODE_ROW_SUPPLEMENTAL, CODE_ROW_UPDATE, CODE_TXN_BEGIN,
    CODE_TXN_COMMIT, CODE_TXN_UNDO, LAYER_DDL, LAYER_LOB, LAYER_ROW, LAYER_TXN,
    LWN_EXT_SIZE, RECORD_HEADER_SIZE, TXN_FLAG_ROLLBACK, VLD_LWN_START,
};
use crate::error::{RedoError, Result};
use crate::types::{Scn, SubScn, Xid};
use bytes::Buf;

/// Parsed record header, before the body.
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub size: u32,
    pub vld: u8,
    pub scn: Scn,
    pub sub_scn: SubScn,
}

/// LWN extension carried by the first record of each group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LwnHeader {
    pub num: u16,
    pub num_max: u16,
    pub blocks: u32,
    pub scn: Scn,
    pub timestamp: u32,
}

pub fn read_record_header(data: &[u8]) -> Result<RecordHeader> {
    if data.len() < RECORD_HEADER_SIZE {
        return Err(RedoError::redo(40024, "record shorter than its header"));
    }
    let size = (&data[0..]).get_u32_le();
    let vld = data[4];
    let scn_high = u16::from_le_bytes([data[6], data[7]]);
    let scn_low = (&data[8..]).get_u32_le();
    let sub_scn = u16::from_le_bytes([data[12], data[13]]);
    let scn = Scn(u64::from(scn_low) | (u64::from(scn_high) << 32));
    Ok(RecordHeader { size, vld, scn, sub_scn })
}

pub fn read_lwn_header(data: &[u8]) -> Result<LwnHeader> {
    if data.len() < RECORD_HEADER_SIZE + LWN_EXT_SIZE {
        return Err(RedoError::redo(40025, "record too short for lwn extension"));
    }
    let mut buf = &data[RECORD_HEADER_SIZE..];
    let num = buf.get_u16_le();
    let num_max = buf.get_u16_le();
    let blocks = buf.get_u32_le();
    let scn = Scn(buf.get_u64_le());
    let timestamp = buf.get_u32_le();
    Ok(LwnHeader { num, num_max, blocks, scn, timestamp })
}

/// Iterator over a record body's length-prefixed, 4-byte-aligned fields.
pub struct FieldCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        FieldCursor { data, pos: 0 }
    }

    pub fn next_field(&mut self) -> Result<&'a [u8]> {
        if self.pos + 4 > self.data.len() {
            return Err(RedoError::redo(40026, "record field list exhausted"));
        }
        let len = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]) as usize;
        let start = self.pos + 4;
        if start + len > self.data.len() {
            return Err(RedoError::redo(40027, "record field exceeds record size"));
        }
        // Fields are padded to 4-byte alignment.
        self.pos = start + ((len + 3) & !3);
        Ok(&self.data[start..start + len])
    }

    pub fn has_more(&self) -> bool {
        self.pos + 4 <= self.data.len()
    }
}

/// Decode one complete record (header, optional LWN extension, body).
/// `Ok(None)` means the opcode is not one the pipeline consumes.
pub fn decode_record(data: &[u8]) -> Result<Option<DecodedRecord>> {
    let header = read_record_header(data)?;
    let body_start = if header.vld & VLD_LWN_START != 0 {
        RECORD_HEADER_SIZE + LWN_EXT_SIZE
    } else {
        RECORD_HEADER_SIZE
    };
    if data.len() < body_start + BODY_PREAMBLE_SIZE {
        return Err(RedoError::redo(40028, "record too short for body preamble"));
    }

    let mut buf = &data[body_start..];
    let layer = buf.get_u8();
    let code = buf.get_u8();
    let flags = buf.get_u16_le();
    let obj = buf.get_u32_le();
    let xid = Xid(buf.get_u64_le());

    let meta = RecordMeta { scn: header.scn, sub_scn: header.sub_scn, xid, obj, flags };
    let fields = &data[body_start + BODY_PREAMBLE_SIZE..];
    let mut cursor = FieldCursor::new(fields);

    let op = match (layer, code) {
        (LAYER_TXN, CODE_TXN_BEGIN) => decode_begin(&mut cursor)?,
        (LAYER_TXN, CODE_TXN_COMMIT) => RedoOp::Commit { rollback: flags & TXN_FLAG_ROLLBACK != 0 },
        (LAYER_TXN, CODE_TXN_UNDO) => decode_partial_rollback(&mut cursor)?,
        (LAYER_ROW, CODE_ROW_INSERT) => {
            let (dba, slot, count) = decode_row_head(&mut cursor)?;
            RedoOp::Insert { dba, slot, after: decode_column_fields(&mut cursor, count)? }
        }
        (LAYER_ROW, CODE_ROW_DELETE) => {
            let (dba, slot, count) = decode_row_head(&mut cursor)?;
            RedoOp::Delete { dba, slot, before: decode_column_fields(&mut cursor, count)? }
        }
        (LAYER_ROW, CODE_ROW_UPDATE) => decode_update(&mut cursor)?,
        (LAYER_ROW, CODE_ROW_MULTI_INSERT) => {
            let (dba, rows) = decode_multi(&mut cursor)?;
            RedoOp::MultiInsert { dba, rows }
        }
        (LAYER_ROW, CODE_ROW_MULTI_DELETE) => {
            let (dba, rows) = decode_multi(&mut cursor)?;
            RedoOp::MultiDelete { dba, rows }
        }
        (LAYER_ROW, CODE_ROW_SUPPLEMENTAL) => {
            let (dba, slot, count) = decode_row_head(&mut cursor)?;
            RedoOp::Supplemental { dba, slot, key: decode_column_fields(&mut cursor, count)? }
        }
        (LAYER_DDL, CODE_DDL) => decode_ddl(&mut cursor)?,
        (LAYER_LOB, CODE_LOB_WRITE) => decode_lob_write(&mut cursor)?,
        _ => return Ok(None),
    };

    Ok(Some(DecodedRecord { meta, op }))
}

fn decode_begin(cursor: &mut FieldCursor<'_>) -> Result<RedoOp> {
    let field = cursor.next_field()?;
    let name = std::str::from_utf8(field)
        .map_err(|_| RedoError::redo(40029, "begin record name is not valid UTF-8"))?
        .to_string();
    Ok(RedoOp::Begin { name })
}

fn decode_partial_rollback(cursor: &mut FieldCursor<'_>) -> Result<RedoOp> {
    let field = cursor.next_field()?;
    if field.len() < 6 {
        return Err(RedoError::redo(40030, "undo record target too short"));
    }
    let mut buf = field;
    let dba = buf.get_u32_le();
    let slot = buf.get_u16_le();
    Ok(RedoOp::PartialRollback { dba, slot })
}

/// Row descriptor field: `(dba, slot, column count)`.
fn decode_row_head(cursor: &mut FieldCursor<'_>) -> Result<(u32, u16, u16)> {
    let field = cursor.next_field()?;
    if field.len() < 8 {
        return Err(RedoError::redo(40031, "row descriptor too short"));
    }
    let mut buf = field;
    let dba = buf.get_u32_le();
    let slot = buf.get_u16_le();
    let count = buf.get_u16_le();
    Ok((dba, slot, count))
}

/// Each column is one field, encoded with the shared column codec.
fn decode_column_fields(cursor: &mut FieldCursor<'_>, count: u16) -> Result<Vec<ColumnRef>> {
    let mut cols = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut field = cursor.next_field()?;
        cols.push(ColumnRef::read(&mut field)?);
    }
    Ok(cols)
}

fn decode_update(cursor: &mut FieldCursor<'_>) -> Result<RedoOp> {
    let field = cursor.next_field()?;
    if field.len() < 10 {
        return Err(RedoError::redo(40032, "update descriptor too short"));
    }
    let mut buf = field;
    let dba = buf.get_u32_le();
    let slot = buf.get_u16_le();
    let before_count = buf.get_u16_le();
    let after_count = buf.get_u16_le();
    let before = decode_column_fields(cursor, before_count)?;
    let after = decode_column_fields(cursor, after_count)?;
    Ok(RedoOp::Update { dba, slot, before, after })
}

fn decode_multi(cursor: &mut FieldCursor<'_>) -> Result<(u32, Vec<RowImage>)> {
    let field = cursor.next_field()?;
    if field.len() < 8 {
        return Err(RedoError::redo(40033, "multi-row descriptor too short"));
    }
    let mut buf = field;
    let dba = buf.get_u32_le();
    let row_count = buf.get_u16_le();
    let mut rows = Vec::with_capacity(row_count as usize);
    for _ in 0..row_count {
        let row_head = cursor.next_field()?;
        if row_head.len() < 4 {
            return Err(RedoError::redo(40034, "multi-row header too short"));
        }
        let mut buf = row_head;
        let slot = buf.get_u16_le();
        let col_count = buf.get_u16_le();
        rows.push(RowImage { slot, columns: decode_column_fields(cursor, col_count)? });
    }
    Ok((dba, rows))
}

fn decode_ddl(cursor: &mut FieldCursor<'_>) -> Result<RedoOp> {
    let head = cursor.next_field()?;
    if head.len() < 2 {
        return Err(RedoError::redo(40035, "ddl descriptor too short"));
    }
    let ddl_type = u16::from_le_bytes([head[0], head[1]]);
    let sql = String::from_utf8(cursor.next_field()?.to_vec())
        .map_err(|_| RedoError::redo(40036, "ddl text is not valid UTF-8"))?;
    let name = String::from_utf8(cursor.next_field()?.to_vec())
        .map_err(|_| RedoError::redo(40036, "ddl object name is not valid UTF-8"))?;
    Ok(RedoOp::Ddl { ddl_type, sql, name })
}

fn decode_lob_write(cursor: &mut FieldCursor<'_>) -> Result<RedoOp> {
    let head = cursor.next_field()?;
    if head.len() < 12 {
        return Err(RedoError::redo(40037, "lob descriptor too short"));
    }
    let mut buf = head;
    let lob_id = buf.get_u64_le();
    let page_no = buf.get_u32_le();
    let data = cursor.next_field()?.to_vec();
    Ok(RedoOp::LobWrite { lob_id, page_no, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::record::ColumnValue;
    use crate::synth::RecordBuilder;

    #[test]
    fn begin_record_decodes() {
        let bytes = RecordBuilder::new(LAYER_TXN, CODE_TXN_BEGIN, Xid::new(1, 2, 3))
            .scn(Scn(100))
            .text_field("app_user")
            .build();
        let decoded = decode_record(&bytes).unwrap().unwrap();
        assert_eq!(decoded.meta.scn, Scn(100));
        assert_eq!(decoded.meta.xid, Xid::new(1, 2, 3));
        assert_eq!(decoded.op, RedoOp::Begin { name: "app_user".into() });
    }

    #[test]
    fn commit_and_rollback_share_an_opcode() {
        let commit = RecordBuilder::new(LAYER_TXN, CODE_TXN_COMMIT, Xid::new(1, 0, 1))
            .scn(Scn(150))
            .build();
        let decoded = decode_record(&commit).unwrap().unwrap();
        assert_eq!(decoded.op, RedoOp::Commit { rollback: false });

        let rollback = RecordBuilder::new(LAYER_TXN, CODE_TXN_COMMIT, Xid::new(1, 0, 1))
            .scn(Scn(150))
            .flags(TXN_FLAG_ROLLBACK)
            .build();
        let decoded = decode_record(&rollback).unwrap().unwrap();
        assert_eq!(decoded.op, RedoOp::Commit { rollback: true });
    }

    #[test]
    fn insert_record_decodes_columns() {
        let bytes = RecordBuilder::new(LAYER_ROW, CODE_ROW_INSERT, Xid::new(1, 2, 3))
            .scn(Scn(101))
            .obj(81337)
            .row(4096, 7)
            .column(1, ColumnValue::Number("42".into()))
            .column(2, ColumnValue::Text("alice".into()))
            .build();
        let decoded = decode_record(&bytes).unwrap().unwrap();
        assert_eq!(decoded.meta.obj, 81337);
        match decoded.op {
            RedoOp::Insert { dba, slot, after } => {
                assert_eq!((dba, slot), (4096, 7));
                assert_eq!(after.len(), 2);
                assert_eq!(after[1].value, ColumnValue::Text("alice".into()));
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn update_record_decodes_both_images() {
        let bytes = RecordBuilder::new(LAYER_ROW, CODE_ROW_UPDATE, Xid::new(1, 2, 3))
            .scn(Scn(102))
            .obj(81337)
            .update_row(4096, 7)
            .before_column(2, ColumnValue::Text("old".into()))
            .after_column(2, ColumnValue::Text("new".into()))
            .build();
        let decoded = decode_record(&bytes).unwrap().unwrap();
        match decoded.op {
            RedoOp::Update { before, after, .. } => {
                assert_eq!(before[0].value, ColumnValue::Text("old".into()));
                assert_eq!(after[0].value, ColumnValue::Text("new".into()));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn unknown_opcode_is_skippable() {
        let bytes = RecordBuilder::new(13, 99, Xid::ZERO).scn(Scn(1)).build();
        assert!(decode_record(&bytes).unwrap().is_none());
    }

    #[test]
    fn lwn_header_round_trip() {
        let bytes = RecordBuilder::new(LAYER_TXN, CODE_TXN_BEGIN, Xid::new(1, 2, 3))
            .scn(Scn(100))
            .lwn(3, 1, 4, Scn(100), 1_700_000_000)
            .text_field("u")
            .build();
        let header = read_record_header(&bytes).unwrap();
        assert!(header.vld & VLD_LWN_START != 0);
        let lwn = read_lwn_header(&bytes).unwrap();
        assert_eq!(lwn.num, 3);
        assert_eq!(lwn.num_max, 1);
        assert_eq!(lwn.blocks, 4);
        assert_eq!(lwn.scn, Scn(100));
        // The body still decodes after the extension.
        let decoded = decode_record(&bytes).unwrap().unwrap();
        assert_eq!(decoded.op, RedoOp::Begin { name: "u".into() });
    }

    #[test]
    fn record_size_is_4_byte_aligned() {
        let bytes = RecordBuilder::new(LAYER_TXN, CODE_TXN_BEGIN, Xid::ZERO)
            .scn(Scn(1))
            .text_field("abc")
            .build();
        assert_eq!(bytes.len() % 4, 0);
        let header = read_record_header(&bytes).unwrap();
        assert_eq!(header.size as usize, bytes.len());
    }

    #[test]
    fn truncated_record_fails_cleanly() {
        let bytes = RecordBuilder::new(LAYER_ROW, CODE_ROW_INSERT, Xid::new(1, 2, 3))
            .scn(Scn(1))
            .row(4096, 7)
            .column(1, ColumnValue::Number("1".into()))
            .build();
        let err = decode_record(&bytes[..RECORD_HEADER_SIZE + 4]).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Redo);
    }
}
