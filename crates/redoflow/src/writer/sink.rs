//! Sink capability set and the consumer control protocol.
//!
//! A sink delivers framed messages and surfaces inbound control requests:
//! `INFO` (query state), `START` (begin replication from a point),
//! `CONTINUE` (resume after reconnect) and `CONFIRM` (acknowledge up to a
//! position). Requests and responses are small binary frames; the outer
//! 4-byte big-endian length prefix is the transport framing.

use crate::builder::OutputMessage;
use crate::error::{RedoError, Result};
use crate::types::{Scn, Seq};
use bytes::{Buf, BufMut};

/// Where replication should start, the `START` request's argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPoint {
    Scn(Scn),
    /// Wall-clock time, unix seconds
    Time(u64),
    /// Seconds before now
    TimeRel(u64),
}

/// Inbound control requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Info,
    Start { point: StartPoint, seq: Option<Seq> },
    Continue { c_scn: Scn, c_idx: u64 },
    Confirm { c_scn: Scn, c_idx: u64 },
}

/// Outbound control responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerResponse {
    Ready { first_data_scn: Scn, c_scn: Scn, c_idx: u64 },
    Starting,
    Replicate { first_data_scn: Scn, c_scn: Scn, c_idx: u64 },
    FailedStart,
}

const REQ_INFO: u8 = 1;
const REQ_START: u8 = 2;
const REQ_CONTINUE: u8 = 3;
const REQ_CONFIRM: u8 = 4;

const RESP_READY: u8 = 1;
const RESP_STARTING: u8 = 2;
const RESP_REPLICATE: u8 = 3;
const RESP_FAILED_START: u8 = 4;

const TM_SCN: u8 = 0;
const TM_TMS: u8 = 1;
const TM_REL: u8 = 2;

impl ClientRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        match self {
            ClientRequest::Info => out.put_u8(REQ_INFO),
            ClientRequest::Start { point, seq } => {
                out.put_u8(REQ_START);
                match point {
                    StartPoint::Scn(scn) => {
                        out.put_u8(TM_SCN);
                        out.put_u64_le(scn.0);
                    }
                    StartPoint::Time(t) => {
                        out.put_u8(TM_TMS);
                        out.put_u64_le(*t);
                    }
                    StartPoint::TimeRel(t) => {
                        out.put_u8(TM_REL);
                        out.put_u64_le(*t);
                    }
                }
                match seq {
                    Some(seq) => {
                        out.put_u8(1);
                        out.put_u32_le(seq.0);
                    }
                    None => out.put_u8(0),
                }
            }
            ClientRequest::Continue { c_scn, c_idx } => {
                out.put_u8(REQ_CONTINUE);
                out.put_u64_le(c_scn.0);
                out.put_u64_le(*c_idx);
            }
            ClientRequest::Confirm { c_scn, c_idx } => {
                out.put_u8(REQ_CONFIRM);
                out.put_u64_le(c_scn.0);
                out.put_u64_le(*c_idx);
            }
        }
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<ClientRequest> {
        if buf.remaining() < 1 {
            return Err(bad_frame("empty request"));
        }
        let code = buf.get_u8();
        Ok(match code {
            REQ_INFO => ClientRequest::Info,
            REQ_START => {
                if buf.remaining() < 10 {
                    return Err(bad_frame("short start request"));
                }
                let kind = buf.get_u8();
                let value = buf.get_u64_le();
                let point = match kind {
                    TM_SCN => StartPoint::Scn(Scn(value)),
                    TM_TMS => StartPoint::Time(value),
                    TM_REL => StartPoint::TimeRel(value),
                    other => return Err(bad_frame(&format!("unknown start kind {other}"))),
                };
                let seq = if buf.get_u8() != 0 {
                    if buf.remaining() < 4 {
                        return Err(bad_frame("short start sequence"));
                    }
                    Some(Seq(buf.get_u32_le()))
                } else {
                    None
                };
                ClientRequest::Start { point, seq }
            }
            REQ_CONTINUE => {
                if buf.remaining() < 16 {
                    return Err(bad_frame("short continue request"));
                }
                ClientRequest::Continue { c_scn: Scn(buf.get_u64_le()), c_idx: buf.get_u64_le() }
            }
            REQ_CONFIRM => {
                if buf.remaining() < 16 {
                    return Err(bad_frame("short confirm request"));
                }
                ClientRequest::Confirm { c_scn: Scn(buf.get_u64_le()), c_idx: buf.get_u64_le() }
            }
            other => return Err(bad_frame(&format!("unknown request code {other}"))),
        })
    }
}

impl ServerResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(25);
        match self {
            ServerResponse::Ready { first_data_scn, c_scn, c_idx } => {
                out.put_u8(RESP_READY);
                out.put_u64_le(first_data_scn.0);
                out.put_u64_le(c_scn.0);
                out.put_u64_le(*c_idx);
            }
            ServerResponse::Starting => out.put_u8(RESP_STARTING),
            ServerResponse::Replicate { first_data_scn, c_scn, c_idx } => {
                out.put_u8(RESP_REPLICATE);
                out.put_u64_le(first_data_scn.0);
                out.put_u64_le(c_scn.0);
                out.put_u64_le(*c_idx);
            }
            ServerResponse::FailedStart => out.put_u8(RESP_FAILED_START),
        }
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<ServerResponse> {
        if buf.remaining() < 1 {
            return Err(bad_frame("empty response"));
        }
        Ok(match buf.get_u8() {
            code @ (RESP_READY | RESP_REPLICATE) => {
                if buf.remaining() < 24 {
                    return Err(bad_frame("short state response"));
                }
                let first_data_scn = Scn(buf.get_u64_le());
                let c_scn = Scn(buf.get_u64_le());
                let c_idx = buf.get_u64_le();
                if code == RESP_READY {
                    ServerResponse::Ready { first_data_scn, c_scn, c_idx }
                } else {
                    ServerResponse::Replicate { first_data_scn, c_scn, c_idx }
                }
            }
            RESP_STARTING => ServerResponse::Starting,
            RESP_FAILED_START => ServerResponse::FailedStart,
            other => return Err(bad_frame(&format!("unknown response code {other}"))),
        })
    }
}

fn bad_frame(what: &str) -> RedoError {
    RedoError::network(20002, format!("malformed control frame: {what}"))
}

/// A message delivery target with optional consumer acknowledgments.
pub trait Sink: Send {
    fn name(&self) -> &'static str;

    /// Non-blocking-ish check for an inbound control request.
    fn poll(&mut self) -> Result<Option<ClientRequest>>;

    /// Deliver one message.
    fn send(&mut self, msg: &OutputMessage) -> Result<()>;

    /// Answer a control request.
    fn respond(&mut self, resp: &ServerResponse) -> Result<()>;

    /// Sinks without a control channel confirm every message on send.
    fn auto_confirm(&self) -> bool {
        false
    }

    /// Whether a consumer is attached right now.
    fn connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let cases = vec![
            ClientRequest::Info,
            ClientRequest::Start { point: StartPoint::Scn(Scn(1_000_000)), seq: None },
            ClientRequest::Start { point: StartPoint::Time(1_700_000_000), seq: Some(Seq(7)) },
            ClientRequest::Start { point: StartPoint::TimeRel(3600), seq: None },
            ClientRequest::Continue { c_scn: Scn(5000), c_idx: 3 },
            ClientRequest::Confirm { c_scn: Scn(5000), c_idx: 3 },
        ];
        for case in cases {
            let bytes = case.encode();
            assert_eq!(ClientRequest::decode(&bytes).unwrap(), case);
        }
    }

    #[test]
    fn response_round_trips() {
        let cases = vec![
            ServerResponse::Ready { first_data_scn: Scn(100), c_scn: Scn::NONE, c_idx: 0 },
            ServerResponse::Starting,
            ServerResponse::Replicate { first_data_scn: Scn(100), c_scn: Scn(99), c_idx: 5 },
            ServerResponse::FailedStart,
        ];
        for case in cases {
            let bytes = case.encode();
            assert_eq!(ServerResponse::decode(&bytes).unwrap(), case);
        }
    }

    #[test]
    fn malformed_frames_are_network_errors() {
        let err = ClientRequest::decode(&[]).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Network);
        let err = ClientRequest::decode(&[REQ_START, 9]).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Network);
        let err = ClientRequest::decode(&[99]).unwrap_err();
        assert_eq!(err.code(), 20002);
    }
}
