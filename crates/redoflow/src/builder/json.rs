//! JSON encoding of output messages.
//!
//! Message shape: `{"scn": ..., "xid": "...", "payload": [op, ...]}` with
//! ops `begin` / `commit` / `c` (insert) / `u` (update) / `d` (delete) /
//! `ddl`. All value formatting options (timestamps, intervals, scn, rid,
//! xid, unknown types) live here; the binary encoder re-uses the formatted
//! values.

use super::LobCtx;
use crate::config::RedoFlag;
use crate::context::Ctx;
use crate::error::Result;
use crate::format::{
    Format, RidFormat, ScnFormat, TimestampFormat, TimestampTzFormat, UnknownFormat, XidFormat,
};
use crate::metadata::schema::{ColumnType, Schema, TableDef};
use crate::parser::record::{ColumnRef, ColumnValue, RedoOp, RowImage};
use crate::transaction::CommitEvent;
use crate::types::{FileOffset, RowId, Scn, Seq, Xid};
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde_json::{json, Map, Value};

/// The checkpoint boundary message the parser emits after each LWN.
pub fn checkpoint_message(
    scn: Scn,
    sequence: Seq,
    timestamp: u32,
    offset: FileOffset,
    switch_redo: bool,
) -> Vec<u8> {
    let value = json!({
        "checkpoint": {
            "scn": scn.0,
            "seq": sequence.0,
            "offset": offset.0,
            "tm": timestamp,
            "redo-switch": switch_redo,
        }
    });
    serde_json::to_vec(&value).expect("checkpoint message serializes")
}

pub fn format_scn(format: &Format, scn: Scn) -> Value {
    match format.scn {
        ScnFormat::Numeric => json!(scn.0),
        ScnFormat::TextHex => json!(scn.to_hex()),
    }
}

pub fn format_xid(format: &Format, xid: Xid) -> Value {
    match format.xid {
        XidFormat::TextHex => json!(xid.to_hex()),
        XidFormat::TextDec => json!(xid.to_dec()),
        XidFormat::Numeric => json!(xid.0),
    }
}

fn iso8601(us: i64, tz_min: Option<i16>, subsec: Option<u32>) -> String {
    let utc: DateTime<Utc> = Utc
        .timestamp_micros(us)
        .single()
        .unwrap_or_else(|| Utc.timestamp_micros(0).single().expect("epoch"));
    let (formatted, offset_suffix) = match tz_min {
        Some(minutes) => {
            let offset = FixedOffset::east_opt(i32::from(minutes) * 60)
                .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset"));
            let local = utc.with_timezone(&offset);
            let suffix = format!(
                "{}{:02}:{:02}",
                if minutes < 0 { '-' } else { '+' },
                minutes.unsigned_abs() / 60,
                minutes.unsigned_abs() % 60
            );
            (local.format("%Y-%m-%dT%H:%M:%S").to_string(), suffix)
        }
        None => (utc.format("%Y-%m-%dT%H:%M:%S").to_string(), "Z".to_string()),
    };
    let frac = match subsec {
        Some(9) => format!(".{:09}", (us.rem_euclid(1_000_000)) * 1000),
        Some(6) => format!(".{:06}", us.rem_euclid(1_000_000)),
        Some(3) => format!(".{:03}", us.rem_euclid(1_000_000) / 1000),
        _ => String::new(),
    };
    format!("{formatted}{frac}{offset_suffix}")
}

/// Timestamp without zone, rendered per the configured format.
pub fn format_timestamp(format: TimestampFormat, us: i64) -> Value {
    match format {
        TimestampFormat::UnixNano => json!(us.saturating_mul(1000)),
        TimestampFormat::UnixMicro => json!(us),
        TimestampFormat::UnixMilli => json!(us / 1000),
        TimestampFormat::Unix => json!(us / 1_000_000),
        TimestampFormat::UnixNanoString => json!(us.saturating_mul(1000).to_string()),
        TimestampFormat::UnixMicroString => json!(us.to_string()),
        TimestampFormat::UnixMilliString => json!((us / 1000).to_string()),
        TimestampFormat::UnixString => json!((us / 1_000_000).to_string()),
        TimestampFormat::Iso8601NanoTz => json!(iso8601(us, Some(0), Some(9))),
        TimestampFormat::Iso8601MicroTz => json!(iso8601(us, Some(0), Some(6))),
        TimestampFormat::Iso8601MilliTz => json!(iso8601(us, Some(0), Some(3))),
        TimestampFormat::Iso8601Tz => json!(iso8601(us, Some(0), None)),
        TimestampFormat::Iso8601Nano => json!(iso8601(us, None, Some(9))),
        TimestampFormat::Iso8601Micro => json!(iso8601(us, None, Some(6))),
        TimestampFormat::Iso8601Milli => json!(iso8601(us, None, Some(3))),
        TimestampFormat::Iso8601 => json!(iso8601(us, None, None)),
    }
}

/// Timestamp with zone; the trailing zone id comes from the value itself.
pub fn format_timestamp_tz(format: TimestampTzFormat, us: i64, tz_min: i16) -> Value {
    match format {
        TimestampTzFormat::UnixNanoString => json!(us.saturating_mul(1000).to_string()),
        TimestampTzFormat::UnixMicroString => json!(us.to_string()),
        TimestampTzFormat::UnixMilliString => json!((us / 1000).to_string()),
        TimestampTzFormat::UnixString => json!((us / 1_000_000).to_string()),
        TimestampTzFormat::Iso8601NanoTz => json!(iso8601(us, Some(tz_min), Some(9))),
        TimestampTzFormat::Iso8601MicroTz => json!(iso8601(us, Some(tz_min), Some(6))),
        TimestampTzFormat::Iso8601MilliTz => json!(iso8601(us, Some(tz_min), Some(3))),
        TimestampTzFormat::Iso8601Tz => json!(iso8601(us, Some(tz_min), None)),
        TimestampTzFormat::Iso8601Nano => json!(iso8601(us, None, Some(9))),
        TimestampTzFormat::Iso8601Micro => json!(iso8601(us, None, Some(6))),
        TimestampTzFormat::Iso8601Milli => json!(iso8601(us, None, Some(3))),
        TimestampTzFormat::Iso8601 => json!(iso8601(us, None, None)),
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// One column value, schema-aware.
fn column_json(
    format: &Format,
    ctx: &Ctx,
    lob: &LobCtx,
    table: Option<&TableDef>,
    col: &ColumnRef,
) -> Value {
    let col_type = table
        .and_then(|t| t.column(col.col))
        .map(|c| c.col_type)
        .unwrap_or(ColumnType::Unknown(0));
    match &col.value {
        ColumnValue::Null => Value::Null,
        ColumnValue::Text(s) => json!(s),
        ColumnValue::Number(s) => {
            // Keep precision: emit as a JSON number only when it parses.
            match serde_json::from_str::<serde_json::Number>(s) {
                Ok(n) => Value::Number(n),
                Err(_) => json!(s),
            }
        }
        ColumnValue::Binary(b) => {
            if matches!(col_type, ColumnType::Unknown(_))
                && format.unknown == UnknownFormat::QuestionMark
            {
                json!("?")
            } else {
                json!(hex(b))
            }
        }
        ColumnValue::Timestamp(us) => format_timestamp(format.timestamp, *us),
        ColumnValue::TimestampTz(us, tz) => format_timestamp_tz(format.timestamp_tz, *us, *tz),
        ColumnValue::IntervalDs(us) => json!(us),
        ColumnValue::IntervalYm(months) => json!(months),
        ColumnValue::LobLocator(lob_id) => match lob.resolve(*lob_id) {
            Some(bytes) => json!(hex(&bytes)),
            None if ctx.is_flag_set(RedoFlag::LobNullOnMissing) => Value::Null,
            None => json!("?"),
        },
    }
}

fn column_name(table: Option<&TableDef>, col: u16) -> String {
    table
        .and_then(|t| t.column(col))
        .map(|c| c.name.clone())
        .unwrap_or_else(|| format!("col{col}"))
}

fn columns_json(
    format: &Format,
    ctx: &Ctx,
    lob: &LobCtx,
    table: Option<&TableDef>,
    cols: &[ColumnRef],
) -> Value {
    let mut map = Map::new();
    for col in cols {
        map.insert(column_name(table, col.col), column_json(format, ctx, lob, table, col));
    }
    Value::Object(map)
}

/// Key columns pulled from an image, as object or array per the flag.
fn key_json(
    format: &Format,
    ctx: &Ctx,
    lob: &LobCtx,
    table: &TableDef,
    cols: &[ColumnRef],
) -> Option<Value> {
    if table.key_cols.is_empty() {
        return None;
    }
    let as_array = ctx.is_flag_set(RedoFlag::KeyAsArray);
    let mut obj = Map::new();
    let mut arr = Vec::new();
    for key_col in &table.key_cols {
        let value = cols
            .iter()
            .find(|c| c.col == *key_col)
            .map(|c| column_json(format, ctx, lob, Some(table), c))
            .unwrap_or(Value::Null);
        if as_array {
            arr.push(value);
        } else {
            obj.insert(column_name(Some(table), *key_col), value);
        }
    }
    Some(if as_array { Value::Array(arr) } else { Value::Object(obj) })
}

/// Routing-tag preamble: tag column values joined with commas.
fn tag_bytes(table: &TableDef, cols: &[ColumnRef]) -> Vec<u8> {
    if table.tag_cols.is_empty() {
        return Vec::new();
    }
    let mut parts = Vec::new();
    for tag_col in &table.tag_cols {
        let text = cols
            .iter()
            .find(|c| c.col == *tag_col)
            .map(|c| match &c.value {
                ColumnValue::Text(s) => s.clone(),
                ColumnValue::Number(s) => s.clone(),
                other => format!("{other:?}"),
            })
            .unwrap_or_default();
        parts.push(text);
    }
    parts.join(",").into_bytes()
}

fn schema_json(table: Option<&TableDef>, obj: u32) -> Value {
    match table {
        Some(t) => json!({"owner": t.owner, "table": t.name, "obj": obj}),
        None => json!({"obj": obj}),
    }
}

fn attributes_json(event: &CommitEvent) -> Value {
    json!({"user": event.name})
}

pub fn begin_op(format: &Format, event: &CommitEvent) -> Value {
    let mut op = Map::new();
    op.insert("op".into(), json!("begin"));
    op.insert("xid".into(), format_xid(format, event.xid));
    if format.attributes.on_begin() {
        op.insert("attributes".into(), attributes_json(event));
    }
    Value::Object(op)
}

pub fn commit_op(format: &Format, event: &CommitEvent) -> Value {
    let mut op = Map::new();
    op.insert("op".into(), json!("commit"));
    if format.attributes.on_commit() {
        op.insert("attributes".into(), attributes_json(event));
    }
    Value::Object(op)
}

/// Encode a DML/DDL op into zero or more `(value, tag)` pairs. Multi-row
/// operations expand to one op per row.
pub fn dml_ops(
    format: &Format,
    ctx: &Ctx,
    schema: &Schema,
    lob: &LobCtx,
    event: &CommitEvent,
    obj: u32,
    op: &RedoOp,
) -> Result<Vec<(Value, Vec<u8>)>> {
    let table = schema.table(obj);
    let schemaless = ctx.is_flag_set(RedoFlag::Schemaless);
    if table.is_none() && !schemaless && !matches!(op, RedoOp::Ddl { .. }) {
        // Not a tracked table.
        tracing::debug!(obj, "skipping operation on untracked object");
        return Ok(Vec::new());
    }

    let row_op = |code: &str,
                  dba: u32,
                  slot: u16,
                  before: Option<&[ColumnRef]>,
                  after: Option<&[ColumnRef]>|
     -> (Value, Vec<u8>) {
        let mut map = Map::new();
        map.insert("op".into(), json!(code));
        map.insert("schema".into(), schema_json(table, obj));
        if format.rid == RidFormat::Text {
            map.insert("rid".into(), json!(RowId::new(obj, 0, dba, slot).to_string()));
        }
        if format.db.add_dml() {
            map.insert("db".into(), json!(ctx.database.clone()));
        }
        if format.attributes.on_dml() {
            map.insert("attributes".into(), attributes_json(event));
        }
        let mut tag = Vec::new();
        if let Some(t) = table {
            let key_image = after.or(before).unwrap_or(&[]);
            if let Some(key) = key_json(format, ctx, lob, t, key_image) {
                map.insert("key".into(), key);
            }
            tag = tag_bytes(t, key_image);
        }
        if let Some(cols) = before {
            map.insert("before".into(), columns_json(format, ctx, lob, table, cols));
        }
        if let Some(cols) = after {
            map.insert("after".into(), columns_json(format, ctx, lob, table, cols));
        }
        (Value::Object(map), tag)
    };

    Ok(match op {
        RedoOp::Insert { dba, slot, after } => {
            vec![row_op("c", *dba, *slot, None, Some(after))]
        }
        RedoOp::Delete { dba, slot, before } => {
            vec![row_op("d", *dba, *slot, Some(before), None)]
        }
        RedoOp::Update { dba, slot, before, after } => {
            vec![row_op("u", *dba, *slot, Some(before), Some(after))]
        }
        RedoOp::MultiInsert { dba, rows } => rows
            .iter()
            .map(|RowImage { slot, columns }| row_op("c", *dba, *slot, None, Some(columns)))
            .collect(),
        RedoOp::MultiDelete { dba, rows } => rows
            .iter()
            .map(|RowImage { slot, columns }| row_op("d", *dba, *slot, Some(columns), None))
            .collect(),
        RedoOp::Ddl { sql, name, .. } => {
            let mut map = Map::new();
            map.insert("op".into(), json!("ddl"));
            map.insert("schema".into(), schema_json(table, obj));
            map.insert("sql".into(), json!(sql));
            map.insert("name".into(), json!(name));
            if format.db.add_ddl() {
                map.insert("db".into(), json!(ctx.database.clone()));
            }
            vec![(Value::Object(map), Vec::new())]
        }
        other => {
            tracing::debug!(?other, "operation kind has no output encoding");
            Vec::new()
        }
    })
}

/// Wrap ops into the outer message envelope.
pub fn wrap_message(
    format: &Format,
    event: &CommitEvent,
    op_index: u64,
    ops: Vec<Value>,
) -> Value {
    let mut map = Map::new();
    map.insert("scn".into(), format_scn(format, event.commit_scn));
    map.insert("xid".into(), format_xid(format, event.xid));
    if format.message.add_sequences() {
        map.insert("seq".into(), json!(event.sequence.0));
    }
    if format.message.add_offset() {
        map.insert("num".into(), json!(op_index));
    }
    map.insert("payload".into(), Value::Array(ops));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::MessageFormat;
    use crate::metadata::schema::{SchemaSnapshot, SysCol, SysObj, SysTab, SysUser};

    fn event() -> CommitEvent {
        CommitEvent {
            handle: 0,
            xid: Xid::new(4, 5, 6),
            commit_scn: Scn(150),
            start_scn: Scn(100),
            sequence: Seq(3),
            name: "app_user".into(),
        }
    }

    fn schema_with_orders() -> Schema {
        let snapshot = SchemaSnapshot {
            sys_user: vec![SysUser { user: 1, name: "APP".into(), spare1: 0 }],
            sys_obj: vec![SysObj {
                obj: 81337,
                data_obj: 81337,
                owner: 1,
                name: "ORDERS".into(),
                ..SysObj::default()
            }],
            sys_tab: vec![SysTab { obj: 81337, ..SysTab::default() }],
            sys_col: vec![
                SysCol { obj: 81337, col: 1, seg_col: 1, name: "ID".into(), col_type: 2, ..SysCol::default() },
                SysCol { obj: 81337, col: 2, seg_col: 2, name: "REGION".into(), col_type: 1, ..SysCol::default() },
            ],
            ..SchemaSnapshot::default()
        };
        let filter = crate::config::FilterEntry {
            owner: "APP".into(),
            table: "ORDERS".into(),
            key: vec!["ID".into()],
            tag: vec!["REGION".into()],
            condition: None,
            options: None,
        };
        Schema::build(&snapshot, &[filter]).unwrap()
    }

    fn cols(pairs: &[(u16, ColumnValue)]) -> Vec<ColumnRef> {
        pairs.iter().map(|(c, v)| ColumnRef { col: *c, value: v.clone() }).collect()
    }

    #[test]
    fn insert_emits_after_image_only() {
        let format = Format::default();
        let ctx = Ctx::new("DB1");
        let schema = schema_with_orders();
        let lob = LobCtx::default();
        let op = RedoOp::Insert {
            dba: 4096,
            slot: 7,
            after: cols(&[(1, ColumnValue::Number("42".into())), (2, ColumnValue::Text("west".into()))]),
        };
        let out = dml_ops(&format, &ctx, &schema, &lob, &event(), 81337, &op).unwrap();
        assert_eq!(out.len(), 1);
        let (value, tag) = &out[0];
        assert_eq!(value["op"], "c");
        assert_eq!(value["schema"]["owner"], "APP");
        assert_eq!(value["after"]["ID"], 42);
        assert_eq!(value["after"]["REGION"], "west");
        assert!(value.get("before").is_none());
        assert_eq!(value["key"]["ID"], 42);
        assert_eq!(tag, b"west");
    }

    #[test]
    fn delete_emits_before_image_only() {
        let format = Format::default();
        let ctx = Ctx::new("DB1");
        let schema = schema_with_orders();
        let lob = LobCtx::default();
        let op = RedoOp::Delete {
            dba: 4096,
            slot: 7,
            before: cols(&[(1, ColumnValue::Number("42".into()))]),
        };
        let out = dml_ops(&format, &ctx, &schema, &lob, &event(), 81337, &op).unwrap();
        let (value, _) = &out[0];
        assert_eq!(value["op"], "d");
        assert!(value.get("after").is_none());
        assert_eq!(value["before"]["ID"], 42);
    }

    #[test]
    fn update_emits_both_images() {
        let format = Format::default();
        let ctx = Ctx::new("DB1");
        let schema = schema_with_orders();
        let lob = LobCtx::default();
        let op = RedoOp::Update {
            dba: 1,
            slot: 1,
            before: cols(&[(2, ColumnValue::Text("west".into()))]),
            after: cols(&[(2, ColumnValue::Text("east".into()))]),
        };
        let out = dml_ops(&format, &ctx, &schema, &lob, &event(), 81337, &op).unwrap();
        let (value, tag) = &out[0];
        assert_eq!(value["before"]["REGION"], "west");
        assert_eq!(value["after"]["REGION"], "east");
        // Tag comes from the after image.
        assert_eq!(tag, b"east");
    }

    #[test]
    fn untracked_object_is_skipped_without_schemaless() {
        let format = Format::default();
        let ctx = Ctx::new("DB1");
        let schema = schema_with_orders();
        let lob = LobCtx::default();
        let op = RedoOp::Insert { dba: 1, slot: 1, after: cols(&[(1, ColumnValue::Null)]) };
        let out = dml_ops(&format, &ctx, &schema, &lob, &event(), 999, &op).unwrap();
        assert!(out.is_empty());

        let ctx = Ctx::new("DB1").with_flags(&[RedoFlag::Schemaless]);
        let out = dml_ops(&format, &ctx, &schema, &lob, &event(), 999, &op).unwrap();
        assert_eq!(out[0].0["after"]["col1"], Value::Null);
    }

    #[test]
    fn timestamp_formats() {
        let us = 1_700_000_000_000_000i64;
        assert_eq!(format_timestamp(TimestampFormat::Unix, us), json!(1_700_000_000));
        assert_eq!(format_timestamp(TimestampFormat::UnixMilli, us), json!(1_700_000_000_000i64));
        assert_eq!(
            format_timestamp(TimestampFormat::UnixMicroString, us),
            json!("1700000000000000")
        );
        let iso = format_timestamp(TimestampFormat::Iso8601, us);
        assert_eq!(iso, json!("2023-11-14T22:13:20Z"));
        let iso_tz = format_timestamp_tz(TimestampTzFormat::Iso8601Tz, us, 120);
        assert_eq!(iso_tz, json!("2023-11-15T00:13:20+02:00"));
    }

    #[test]
    fn key_as_array_flag() {
        let format = Format::default();
        let ctx = Ctx::new("DB1").with_flags(&[RedoFlag::KeyAsArray]);
        let schema = schema_with_orders();
        let lob = LobCtx::default();
        let op = RedoOp::Insert {
            dba: 1,
            slot: 1,
            after: cols(&[(1, ColumnValue::Number("9".into()))]),
        };
        let out = dml_ops(&format, &ctx, &schema, &lob, &event(), 81337, &op).unwrap();
        assert_eq!(out[0].0["key"], json!([9]));
    }

    #[test]
    fn wrap_message_envelope() {
        let mut format = Format::default();
        format.message = MessageFormat(MessageFormat::ADD_SEQUENCES);
        let value = wrap_message(&format, &event(), 0, vec![json!({"op": "begin"})]);
        assert_eq!(value["scn"], 150);
        assert_eq!(value["xid"], "0x0004.005.00000006");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["payload"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn checkpoint_message_shape() {
        let data = checkpoint_message(Scn(1000), Seq(5), 1_700_000_000, FileOffset(8192), true);
        let value: Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value["checkpoint"]["scn"], 1000);
        assert_eq!(value["checkpoint"]["seq"], 5);
        assert_eq!(value["checkpoint"]["redo-switch"], true);
    }

    #[test]
    fn lob_locator_resolution() {
        let format = Format::default();
        let ctx = Ctx::new("DB1").with_flags(&[RedoFlag::Schemaless]);
        let schema = Schema::empty();
        let mut lob = LobCtx::default();
        lob.add_page(11, 0, vec![0xAB, 0xCD]);
        let op = RedoOp::Insert {
            dba: 1,
            slot: 1,
            after: cols(&[(1, ColumnValue::LobLocator(11)), (2, ColumnValue::LobLocator(99))]),
        };
        let out = dml_ops(&format, &ctx, &schema, &lob, &event(), 5, &op).unwrap();
        assert_eq!(out[0].0["after"]["col1"], "abcd");
        // Missing page without the null flag renders the unknown marker.
        assert_eq!(out[0].0["after"]["col2"], "?");

        let ctx = Ctx::new("DB1").with_flags(&[RedoFlag::Schemaless, RedoFlag::LobNullOnMissing]);
        let out = dml_ops(&format, &ctx, &schema, &lob, &event(), 5, &op).unwrap();
        assert_eq!(out[0].0["after"]["col2"], Value::Null);
    }
}
