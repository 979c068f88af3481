//! Configuration file model.
//!
//! The daemon loads a single JSON document. Unknown keys are rejected before
//! deserialization unless `disable-checks` contains `"json-tags"`; the check
//! runs on the raw document so a typo like `"start-skn"` fails fast instead
//! of being silently dropped.

use crate::error::{RedoError, Result};
use crate::types::Scn;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Runtime behavior flags (`flags` array in the config file).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedoFlag {
    /// Warn-and-continue on malformed records and metadata
    IgnoreDataErrors,
    /// Emit rows without consulting the schema snapshot
    Schemaless,
    /// Build the schema incrementally from the redo stream
    AdaptiveSchema,
    /// Emit primary-key values as an array instead of an object
    KeyAsArray,
    /// Emit null for LOB pages missing from the LOB context
    LobNullOnMissing,
    /// Disable O_DIRECT on swap files
    NoDirectSwap,
}

impl RedoFlag {
    pub fn bit(&self) -> u64 {
        1u64 << (*self as u64)
    }
}

/// Consistency checks that can be switched off (`disable-checks`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisableCheck {
    /// Skip block checksum verification
    BlockSum,
    /// Accept unknown keys in the config file
    JsonTags,
    /// Skip database version whitelist
    DbVersion,
}

/// One table filter entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterEntry {
    pub owner: String,
    pub table: String,
    /// Columns forming the message key
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<String>,
    /// Columns forming the routing tag preamble
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<u64>,
}

/// Memory sizing: one fixed chunk size, per-subsystem chunk quotas.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct MemoryConfig {
    /// Chunk size in MiB
    #[serde(default = "default_chunk_mb")]
    pub chunk_mb: u64,
    #[serde(default = "default_reader_chunks")]
    pub reader_chunks: usize,
    #[serde(default = "default_parser_chunks")]
    pub parser_chunks: usize,
    #[serde(default = "default_transaction_chunks")]
    pub transaction_chunks: usize,
    #[serde(default = "default_builder_chunks")]
    pub builder_chunks: usize,
    #[serde(default = "default_writer_chunks")]
    pub writer_chunks: usize,
    /// Spill directory for oversized transactions
    #[serde(default = "default_swap_path")]
    pub swap_path: PathBuf,
}

fn default_chunk_mb() -> u64 {
    64
}
fn default_reader_chunks() -> usize {
    4
}
fn default_parser_chunks() -> usize {
    16
}
fn default_transaction_chunks() -> usize {
    32
}
fn default_builder_chunks() -> usize {
    8
}
fn default_writer_chunks() -> usize {
    4
}
fn default_swap_path() -> PathBuf {
    PathBuf::from("swap")
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            chunk_mb: default_chunk_mb(),
            reader_chunks: default_reader_chunks(),
            parser_chunks: default_parser_chunks(),
            transaction_chunks: default_transaction_chunks(),
            builder_chunks: default_builder_chunks(),
            writer_chunks: default_writer_chunks(),
            swap_path: default_swap_path(),
        }
    }
}

impl MemoryConfig {
    pub fn chunk_size(&self) -> usize {
        (self.chunk_mb as usize) * 1024 * 1024
    }
}

/// One online redo log group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnlineLog {
    pub group: i32,
    pub path: PathBuf,
}

/// Reader settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ReaderConfig {
    /// Directory holding archived logs named `<db>_<seq>.arc`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub online_logs: Vec<OnlineLog>,
    /// Poll interval while waiting for new data, microseconds
    #[serde(default = "default_read_sleep_us")]
    pub redo_read_sleep_us: u64,
    /// Age a scanned online block must reach before it is trusted;
    /// 0 disables two-phase verify
    #[serde(default)]
    pub redo_verify_delay_us: u64,
    /// Mirror every read into `<redo-copy-path>/<db>_<seq>.arc`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redo_copy_path: Option<PathBuf>,
    /// The database is configured with block checksums
    #[serde(default = "default_true")]
    pub block_checksum: bool,
}

fn default_read_sleep_us() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}

/// Writer/sink settings. Unknown keys inside this section pass through the
/// top-level whitelist, so only the variant fields are validated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", rename_all_fields = "kebab-case", tag = "type")]
pub enum WriterConfig {
    /// Length-prefixed frames over TCP with the consumer-ack protocol
    Stream {
        bind: String,
        #[serde(default = "default_queue_size")]
        queue_size: usize,
        #[serde(default = "default_checkpoint_interval_s")]
        checkpoint_interval_s: u64,
        #[serde(default = "default_checkpoint_interval_mb")]
        checkpoint_interval_mb: u64,
    },
    /// Append to a file (or stdout when path is absent); auto-confirming
    File {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
        #[serde(default = "default_checkpoint_interval_s")]
        checkpoint_interval_s: u64,
        #[serde(default = "default_checkpoint_interval_mb")]
        checkpoint_interval_mb: u64,
    },
}

fn default_queue_size() -> usize {
    65_536
}
fn default_checkpoint_interval_s() -> u64 {
    10
}
fn default_checkpoint_interval_mb() -> u64 {
    500
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig::File {
            path: None,
            checkpoint_interval_s: default_checkpoint_interval_s(),
            checkpoint_interval_mb: default_checkpoint_interval_mb(),
        }
    }
}

/// Output format options; mapped onto [`crate::format::Format`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FormatConfig {
    #[serde(default)]
    pub kind: crate::format::OutputKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_tz: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub db: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unknown: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_scn: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_seq: Option<u32>,
    /// `YYYY-MM-DD HH:MM:SS` local to the log timezone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    /// Seconds before "now"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_rel: Option<u64>,
    /// Metadata/checkpoint directory
    pub schema: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<FilterEntry>,
    #[serde(default)]
    pub format: FormatConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<RedoFlag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disable_checks: Vec<DisableCheck>,
}

impl Config {
    /// Parse and validate a configuration document.
    pub fn from_json(text: &str) -> Result<Config> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| RedoError::config(10001, format!("config is not valid JSON: {e}")))?;

        let disable_tags = value
            .get("disable-checks")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().any(|c| c.as_str() == Some("json-tags")))
            .unwrap_or(false);

        if !disable_tags {
            check_known_keys(&value)?;
        }

        let config: Config = serde_json::from_value(value)
            .map_err(|e| RedoError::config(10002, format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RedoError::config(10003, format!("config file {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.database.is_empty() {
            return Err(RedoError::config(10004, "database name must not be empty"));
        }
        let starts = [
            self.start_scn.is_some(),
            self.start_seq.is_some(),
            self.start_time.is_some(),
            self.start_time_rel.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count();
        if starts > 1 {
            return Err(RedoError::config(
                10005,
                "only one of start-scn, start-seq, start-time, start-time-rel may be set",
            ));
        }
        if self.memory.chunk_mb == 0 {
            return Err(RedoError::config(10006, "memory.chunk-mb must be positive"));
        }
        if self.memory.reader_chunks < 2 {
            return Err(RedoError::config(10007, "memory.reader-chunks must be at least 2"));
        }
        for f in &self.filter {
            if f.owner.is_empty() || f.table.is_empty() {
                return Err(RedoError::config(10008, "filter entries need owner and table"));
            }
        }
        Ok(())
    }

    /// Requested start SCN; NONE means "start at the current tail".
    pub fn start_scn(&self) -> Scn {
        self.start_scn.map(Scn).unwrap_or(Scn::NONE)
    }
}

const TOP_LEVEL_KEYS: &[&str] = &[
    "database",
    "start-scn",
    "start-seq",
    "start-time",
    "start-time-rel",
    "schema",
    "filter",
    "format",
    "memory",
    "reader",
    "writer",
    "flags",
    "disable-checks",
];

fn check_known_keys(value: &serde_json::Value) -> Result<()> {
    let obj = value
        .as_object()
        .ok_or_else(|| RedoError::config(10001, "config root must be an object"))?;
    let known: HashSet<&str> = TOP_LEVEL_KEYS.iter().copied().collect();
    for key in obj.keys() {
        if !known.contains(key.as_str()) {
            return Err(RedoError::config(
                10009,
                format!("unknown config key: {key} (set disable-checks: [\"json-tags\"] to allow)"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> &'static str {
        r#"{"database": "DB1", "schema": "/var/lib/redoflow"}"#
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg = Config::from_json(minimal()).unwrap();
        assert_eq!(cfg.database, "DB1");
        assert_eq!(cfg.memory.chunk_mb, 64);
        assert_eq!(cfg.memory.reader_chunks, 4);
        assert!(cfg.start_scn().is_none());
        assert!(matches!(cfg.writer, WriterConfig::File { .. }));
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let err = Config::from_json(r#"{"database":"D","schema":"s","start-skn":5}"#).unwrap_err();
        assert_eq!(err.code(), 10009);
    }

    #[test]
    fn unknown_key_allowed_with_json_tags() {
        let cfg = Config::from_json(
            r#"{"database":"D","schema":"s","disable-checks":["json-tags"]}"#,
        );
        assert!(cfg.is_ok());
    }

    #[test]
    fn conflicting_start_points_rejected() {
        let err = Config::from_json(
            r#"{"database":"D","schema":"s","start-scn":10,"start-seq":3}"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), 10005);
    }

    #[test]
    fn filter_and_flags_parse() {
        let cfg = Config::from_json(
            r#"{
                "database": "D",
                "schema": "s",
                "filter": [{"owner": "APP", "table": "ORDERS", "key": ["ID"], "tag": ["REGION"]}],
                "flags": ["ignore-data-errors", "schemaless"],
                "writer": {"type": "stream", "bind": "0.0.0.0:7070"}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.filter.len(), 1);
        assert_eq!(cfg.filter[0].key, vec!["ID"]);
        assert!(cfg.flags.contains(&RedoFlag::IgnoreDataErrors));
        assert!(matches!(cfg.writer, WriterConfig::Stream { .. }));
    }

    #[test]
    fn start_scn_none_means_now() {
        let cfg = Config::from_json(minimal()).unwrap();
        assert_eq!(cfg.start_scn(), Scn::NONE);
        let cfg = Config::from_json(
            r#"{"database":"D","schema":"s","start-scn":1000000}"#,
        )
        .unwrap();
        assert_eq!(cfg.start_scn(), Scn(1000000));
    }
}
