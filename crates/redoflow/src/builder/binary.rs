//! Binary-schema output encoding.
//!
//! A message is a fixed envelope `{scn, c_scn, c_idx, code, count}`
//! followed by `count` payload ops. Values are the same formatted scalars
//! the JSON builder produces; this module only reframes them with
//! length-prefixed fields. The writer adds the outer 4-byte frame prefix
//! on the wire.

use crate::error::{RedoError, Result};
use crate::format::Format;
use crate::transaction::CommitEvent;
use crate::types::{FileOffset, Scn, Seq};
use bytes::{Buf, BufMut};
use serde_json::Value;

/// Envelope codes.
pub const CODE_DATA: u8 = 0;
pub const CODE_CHECKPOINT: u8 = 1;

/// Payload op codes.
pub const OP_BEGIN: u8 = b'B';
pub const OP_COMMIT: u8 = b'C';
pub const OP_INSERT: u8 = b'c';
pub const OP_UPDATE: u8 = b'u';
pub const OP_DELETE: u8 = b'd';
pub const OP_DDL: u8 = b'D';

const KIND_NULL: u8 = 0;
const KIND_STRING: u8 = 1;
const KIND_JSON: u8 = 2;

fn put_text(out: &mut Vec<u8>, text: &str) {
    out.put_u16_le(text.len() as u16);
    out.put_slice(text.as_bytes());
}

fn put_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.put_u8(KIND_NULL),
        Value::String(s) => {
            out.put_u8(KIND_STRING);
            out.put_u32_le(s.len() as u32);
            out.put_slice(s.as_bytes());
        }
        other => {
            out.put_u8(KIND_JSON);
            let text = other.to_string();
            out.put_u32_le(text.len() as u32);
            out.put_slice(text.as_bytes());
        }
    }
}

fn put_columns(out: &mut Vec<u8>, map: &Value) {
    let Some(obj) = map.as_object() else {
        out.put_u16_le(0);
        return;
    };
    out.put_u16_le(obj.len() as u16);
    for (name, value) in obj {
        put_text(out, name);
        put_value(out, value);
    }
}

fn encode_op(out: &mut Vec<u8>, op: &Value) -> Result<()> {
    let code = op
        .get("op")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RedoError::runtime(50022, "payload op without an op code"))?;
    match code {
        "begin" => {
            out.put_u8(OP_BEGIN);
            put_text(out, op.get("xid").and_then(|v| v.as_str()).unwrap_or(""));
        }
        "commit" => out.put_u8(OP_COMMIT),
        "c" | "u" | "d" => {
            out.put_u8(match code {
                "c" => OP_INSERT,
                "u" => OP_UPDATE,
                _ => OP_DELETE,
            });
            let schema = match (
                op.pointer("/schema/owner").and_then(|v| v.as_str()),
                op.pointer("/schema/table").and_then(|v| v.as_str()),
            ) {
                (Some(owner), Some(table)) => format!("{owner}.{table}"),
                _ => String::new(),
            };
            put_text(out, &schema);
            put_text(out, op.get("rid").and_then(|v| v.as_str()).unwrap_or(""));
            put_columns(out, op.get("key").unwrap_or(&Value::Null));
            put_columns(out, op.get("before").unwrap_or(&Value::Null));
            put_columns(out, op.get("after").unwrap_or(&Value::Null));
        }
        "ddl" => {
            out.put_u8(OP_DDL);
            put_text(out, op.get("sql").and_then(|v| v.as_str()).unwrap_or(""));
            put_text(out, op.get("name").and_then(|v| v.as_str()).unwrap_or(""));
        }
        other => {
            return Err(RedoError::runtime(50023, format!("unknown payload op: {other}")))
        }
    }
    Ok(())
}

/// Encode one wrapped message (the JSON builder's envelope) into the
/// binary frame.
pub fn encode_message(
    _format: &Format,
    event: &CommitEvent,
    c_scn: Scn,
    c_idx: u64,
    value: &Value,
) -> Result<Vec<u8>> {
    let payload = value
        .get("payload")
        .and_then(|v| v.as_array())
        .ok_or_else(|| RedoError::runtime(50024, "message without a payload array"))?;
    let mut out = Vec::with_capacity(64);
    out.put_u64_le(event.commit_scn.0);
    out.put_u64_le(c_scn.0);
    out.put_u64_le(c_idx);
    out.put_u8(CODE_DATA);
    out.put_u16_le(payload.len() as u16);
    for op in payload {
        encode_op(&mut out, op)?;
    }
    Ok(out)
}

/// Checkpoint boundary message in binary form.
pub fn encode_checkpoint(
    scn: Scn,
    sequence: Seq,
    timestamp: u32,
    offset: FileOffset,
    switch_redo: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(40);
    out.put_u64_le(scn.0);
    out.put_u64_le(scn.0);
    out.put_u64_le(0);
    out.put_u8(CODE_CHECKPOINT);
    out.put_u16_le(0);
    out.put_u32_le(sequence.0);
    out.put_u32_le(timestamp);
    out.put_u64_le(offset.0);
    out.put_u8(u8::from(switch_redo));
    out
}

// --- decoding, used by the stream client and the test-suite -------------

/// A decoded payload op.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedOp {
    Begin { xid: String },
    Commit,
    Row {
        op: u8,
        schema: String,
        rid: String,
        key: Vec<(String, Value)>,
        before: Vec<(String, Value)>,
        after: Vec<(String, Value)>,
    },
    Ddl { sql: String, name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub scn: Scn,
    pub c_scn: Scn,
    pub c_idx: u64,
    pub code: u8,
    pub ops: Vec<DecodedOp>,
}

fn get_text(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    let text = String::from_utf8(buf[..len].to_vec())
        .map_err(|_| RedoError::data(30020, "binary message text is not UTF-8"))?;
    buf.advance(len);
    Ok(text)
}

fn get_value(buf: &mut &[u8]) -> Result<Value> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    match buf.get_u8() {
        KIND_NULL => Ok(Value::Null),
        kind @ (KIND_STRING | KIND_JSON) => {
            if buf.remaining() < 4 {
                return Err(truncated());
            }
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(truncated());
            }
            let text = String::from_utf8(buf[..len].to_vec())
                .map_err(|_| RedoError::data(30020, "binary message text is not UTF-8"))?;
            buf.advance(len);
            if kind == KIND_STRING {
                Ok(Value::String(text))
            } else {
                serde_json::from_str(&text).map_err(RedoError::Json)
            }
        }
        other => Err(RedoError::data(30021, format!("unknown value kind: {other}"))),
    }
}

fn get_columns(buf: &mut &[u8]) -> Result<Vec<(String, Value)>> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    let count = buf.get_u16_le() as usize;
    let mut cols = Vec::with_capacity(count);
    for _ in 0..count {
        let name = get_text(buf)?;
        let value = get_value(buf)?;
        cols.push((name, value));
    }
    Ok(cols)
}

fn truncated() -> RedoError {
    RedoError::data(30022, "binary message truncated")
}

pub fn decode_message(mut buf: &[u8]) -> Result<DecodedMessage> {
    if buf.remaining() < 27 {
        return Err(truncated());
    }
    let scn = Scn(buf.get_u64_le());
    let c_scn = Scn(buf.get_u64_le());
    let c_idx = buf.get_u64_le();
    let code = buf.get_u8();
    let count = buf.get_u16_le() as usize;
    let mut ops = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.remaining() < 1 {
            return Err(truncated());
        }
        let op = match buf.get_u8() {
            OP_BEGIN => DecodedOp::Begin { xid: get_text(&mut buf)? },
            OP_COMMIT => DecodedOp::Commit,
            op @ (OP_INSERT | OP_UPDATE | OP_DELETE) => DecodedOp::Row {
                op,
                schema: get_text(&mut buf)?,
                rid: get_text(&mut buf)?,
                key: get_columns(&mut buf)?,
                before: get_columns(&mut buf)?,
                after: get_columns(&mut buf)?,
            },
            OP_DDL => DecodedOp::Ddl { sql: get_text(&mut buf)?, name: get_text(&mut buf)? },
            other => {
                return Err(RedoError::data(30023, format!("unknown payload op code: {other}")))
            }
        };
        ops.push(op);
    }
    Ok(DecodedMessage { scn, c_scn, c_idx, code, ops })
}
