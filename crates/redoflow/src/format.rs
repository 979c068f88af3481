//! Output formatting options.
//!
//! Mirrors the `format` section of the config file. The builder consults
//! this struct for every value it emits; nothing else reads it.

use crate::config::FormatConfig;
use crate::error::{RedoError, Result};
use serde::{Deserialize, Serialize};

/// Output encoding selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputKind {
    #[default]
    Json,
    /// Length-prefixed framed payload `{scn, c_scn, c_idx, code, payload[]}`
    Binary,
}

/// Message grouping options, a bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFormat(pub u8);

impl MessageFormat {
    pub const FULL: u8 = 1 << 0;
    pub const ADD_SEQUENCES: u8 = 1 << 1;
    pub const SKIP_BEGIN: u8 = 1 << 2;
    pub const SKIP_COMMIT: u8 = 1 << 3;
    pub const ADD_OFFSET: u8 = 1 << 4;

    pub fn is_full(&self) -> bool {
        self.0 & Self::FULL != 0
    }

    pub fn add_sequences(&self) -> bool {
        self.0 & Self::ADD_SEQUENCES != 0
    }

    pub fn skip_begin(&self) -> bool {
        self.0 & Self::SKIP_BEGIN != 0
    }

    pub fn skip_commit(&self) -> bool {
        self.0 & Self::SKIP_COMMIT != 0
    }

    pub fn add_offset(&self) -> bool {
        self.0 & Self::ADD_OFFSET != 0
    }
}

/// Timestamp rendering for columns without timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampFormat {
    UnixNano,
    UnixMicro,
    UnixMilli,
    Unix,
    UnixNanoString,
    UnixMicroString,
    UnixMilliString,
    UnixString,
    Iso8601NanoTz,
    Iso8601MicroTz,
    Iso8601MilliTz,
    Iso8601Tz,
    Iso8601Nano,
    Iso8601Micro,
    Iso8601Milli,
    #[default]
    Iso8601,
}

/// Timestamp rendering for columns with timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampTzFormat {
    UnixNanoString,
    UnixMicroString,
    UnixMilliString,
    UnixString,
    Iso8601NanoTz,
    Iso8601MicroTz,
    Iso8601MilliTz,
    #[default]
    Iso8601Tz,
    Iso8601Nano,
    Iso8601Micro,
    Iso8601Milli,
    Iso8601,
}

/// Where schema attributes are attached, a bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttributesFormat(pub u8);

impl AttributesFormat {
    pub const BEGIN: u8 = 1 << 0;
    pub const DML: u8 = 1 << 1;
    pub const COMMIT: u8 = 1 << 2;

    pub fn on_begin(&self) -> bool {
        self.0 & Self::BEGIN != 0
    }

    pub fn on_dml(&self) -> bool {
        self.0 & Self::DML != 0
    }

    pub fn on_commit(&self) -> bool {
        self.0 & Self::COMMIT != 0
    }
}

/// Database-name attachment, a bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DbFormat(pub u8);

impl DbFormat {
    pub const ADD_DML: u8 = 1 << 0;
    pub const ADD_DDL: u8 = 1 << 1;

    pub fn add_dml(&self) -> bool {
        self.0 & Self::ADD_DML != 0
    }

    pub fn add_ddl(&self) -> bool {
        self.0 & Self::ADD_DDL != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScnFormat {
    #[default]
    Numeric,
    TextHex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RidFormat {
    #[default]
    Skip,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XidFormat {
    #[default]
    TextHex,
    TextDec,
    Numeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownFormat {
    #[default]
    QuestionMark,
    Dump,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnFormat {
    /// Only changed columns for updates, plus key columns
    #[default]
    Changed,
    /// Full null sets for insert and delete
    FullInsDec,
    /// Everything present in the redo record
    FullUpd,
}

/// The resolved formatting configuration handed to the builder.
#[derive(Debug, Clone, Default)]
pub struct Format {
    pub kind: OutputKind,
    pub message: MessageFormat,
    pub timestamp: TimestampFormat,
    pub timestamp_tz: TimestampTzFormat,
    pub attributes: AttributesFormat,
    pub db: DbFormat,
    pub scn: ScnFormat,
    pub rid: RidFormat,
    pub xid: XidFormat,
    pub unknown: UnknownFormat,
    pub column: ColumnFormat,
}

impl Format {
    /// Resolve the config-file strings into the typed options.
    pub fn from_config(cfg: &FormatConfig) -> Result<Format> {
        let mut format = Format { kind: cfg.kind, ..Format::default() };

        for opt in &cfg.message {
            format.message.0 |= match opt.as_str() {
                "full" => MessageFormat::FULL,
                "add-sequences" => MessageFormat::ADD_SEQUENCES,
                "skip-begin" => MessageFormat::SKIP_BEGIN,
                "skip-commit" => MessageFormat::SKIP_COMMIT,
                "add-offset" => MessageFormat::ADD_OFFSET,
                other => return Err(bad_option("format.message", other)),
            };
        }
        for opt in &cfg.attributes {
            format.attributes.0 |= match opt.as_str() {
                "begin" => AttributesFormat::BEGIN,
                "dml" => AttributesFormat::DML,
                "commit" => AttributesFormat::COMMIT,
                other => return Err(bad_option("format.attributes", other)),
            };
        }
        for opt in &cfg.db {
            format.db.0 |= match opt.as_str() {
                "add-dml" => DbFormat::ADD_DML,
                "add-ddl" => DbFormat::ADD_DDL,
                other => return Err(bad_option("format.db", other)),
            };
        }
        if let Some(ts) = &cfg.timestamp {
            format.timestamp = parse_timestamp(ts)?;
        }
        if let Some(ts) = &cfg.timestamp_tz {
            format.timestamp_tz = parse_timestamp_tz(ts)?;
        }
        if let Some(scn) = &cfg.scn {
            format.scn = match scn.as_str() {
                "numeric" => ScnFormat::Numeric,
                "text-hex" => ScnFormat::TextHex,
                other => return Err(bad_option("format.scn", other)),
            };
        }
        if let Some(rid) = &cfg.rid {
            format.rid = match rid.as_str() {
                "skip" => RidFormat::Skip,
                "text" => RidFormat::Text,
                other => return Err(bad_option("format.rid", other)),
            };
        }
        if let Some(xid) = &cfg.xid {
            format.xid = match xid.as_str() {
                "text-hex" => XidFormat::TextHex,
                "text-dec" => XidFormat::TextDec,
                "numeric" => XidFormat::Numeric,
                other => return Err(bad_option("format.xid", other)),
            };
        }
        if let Some(unknown) = &cfg.unknown {
            format.unknown = match unknown.as_str() {
                "question-mark" => UnknownFormat::QuestionMark,
                "dump" => UnknownFormat::Dump,
                other => return Err(bad_option("format.unknown", other)),
            };
        }
        if let Some(column) = &cfg.column {
            format.column = match column.as_str() {
                "changed" => ColumnFormat::Changed,
                "full-ins-dec" => ColumnFormat::FullInsDec,
                "full-upd" => ColumnFormat::FullUpd,
                other => return Err(bad_option("format.column", other)),
            };
        }
        Ok(format)
    }
}

fn bad_option(section: &str, value: &str) -> RedoError {
    RedoError::config(10010, format!("unknown {section} option: {value}"))
}

fn parse_timestamp(value: &str) -> Result<TimestampFormat> {
    Ok(match value {
        "unix-nano" => TimestampFormat::UnixNano,
        "unix-micro" => TimestampFormat::UnixMicro,
        "unix-milli" => TimestampFormat::UnixMilli,
        "unix" => TimestampFormat::Unix,
        "unix-nano-string" => TimestampFormat::UnixNanoString,
        "unix-micro-string" => TimestampFormat::UnixMicroString,
        "unix-milli-string" => TimestampFormat::UnixMilliString,
        "unix-string" => TimestampFormat::UnixString,
        "iso8601-nano-tz" => TimestampFormat::Iso8601NanoTz,
        "iso8601-micro-tz" => TimestampFormat::Iso8601MicroTz,
        "iso8601-milli-tz" => TimestampFormat::Iso8601MilliTz,
        "iso8601-tz" => TimestampFormat::Iso8601Tz,
        "iso8601-nano" => TimestampFormat::Iso8601Nano,
        "iso8601-micro" => TimestampFormat::Iso8601Micro,
        "iso8601-milli" => TimestampFormat::Iso8601Milli,
        "iso8601" => TimestampFormat::Iso8601,
        other => return Err(bad_option("format.timestamp", other)),
    })
}

fn parse_timestamp_tz(value: &str) -> Result<TimestampTzFormat> {
    Ok(match value {
        "unix-nano-string" => TimestampTzFormat::UnixNanoString,
        "unix-micro-string" => TimestampTzFormat::UnixMicroString,
        "unix-milli-string" => TimestampTzFormat::UnixMilliString,
        "unix-string" => TimestampTzFormat::UnixString,
        "iso8601-nano-tz" => TimestampTzFormat::Iso8601NanoTz,
        "iso8601-micro-tz" => TimestampTzFormat::Iso8601MicroTz,
        "iso8601-milli-tz" => TimestampTzFormat::Iso8601MilliTz,
        "iso8601-tz" => TimestampTzFormat::Iso8601Tz,
        "iso8601-nano" => TimestampTzFormat::Iso8601Nano,
        "iso8601-micro" => TimestampTzFormat::Iso8601Micro,
        "iso8601-milli" => TimestampTzFormat::Iso8601Milli,
        "iso8601" => TimestampTzFormat::Iso8601,
        other => return Err(bad_option("format.timestamp-tz", other)),
    })
}
