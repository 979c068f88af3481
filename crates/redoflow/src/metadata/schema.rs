//! Schema snapshot: the dictionary slice the builder needs to turn raw
//! column lists into named, typed values.
//!
//! The snapshot is persisted as JSON next to the checkpoints. A checkpoint
//! either embeds the full snapshot (`schema-scn`) or points at an earlier
//! checkpoint that carries it (`schema-ref-scn`).

use crate::error::{RedoError, Result};
use crate::types::Scn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Dictionary object row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SysObj {
    pub obj: u32,
    pub data_obj: u32,
    pub owner: u32,
    pub name: String,
    #[serde(default)]
    pub obj_type: u16,
    #[serde(default)]
    pub flags: u64,
}

/// Table row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SysTab {
    pub obj: u32,
    #[serde(default)]
    pub data_obj: u32,
    #[serde(default)]
    pub ts: u32,
    #[serde(default)]
    pub clu_cols: u16,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub properties: u64,
}

/// Column row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SysCol {
    pub obj: u32,
    pub col: u16,
    pub seg_col: u16,
    pub name: String,
    #[serde(default)]
    pub col_type: u16,
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub precision: i16,
    #[serde(default)]
    pub scale: i16,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

/// User row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SysUser {
    pub user: u32,
    pub name: String,
    #[serde(default)]
    pub spare1: u64,
}

/// LOB dictionary row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SysLob {
    pub obj: u32,
    pub col: u16,
    pub l_obj: u32,
    #[serde(default)]
    pub ts: u32,
}

/// Tablespace row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SysTs {
    pub ts: u32,
    pub name: String,
    #[serde(default)]
    pub block_size: u32,
}

/// One database incarnation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Incarnation {
    pub incarnation: u32,
    pub resetlogs_scn: u64,
    pub resetlogs: u32,
    #[serde(default)]
    pub current: bool,
}

/// One online redo log group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OnlineRedo {
    pub group: i32,
    pub path: String,
}

/// Column datatypes the builder can format. The numeric `col_type` in
/// [`SysCol`] maps onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Varchar,
    Number,
    Date,
    Timestamp,
    TimestampTz,
    IntervalDs,
    IntervalYm,
    Raw,
    Blob,
    Clob,
    Unknown(u16),
}

impl ColumnType {
    pub fn from_code(code: u16) -> Self {
        match code {
            1 | 96 => ColumnType::Varchar,
            2 => ColumnType::Number,
            12 => ColumnType::Date,
            180 => ColumnType::Timestamp,
            181 => ColumnType::TimestampTz,
            182 => ColumnType::IntervalYm,
            183 => ColumnType::IntervalDs,
            23 => ColumnType::Raw,
            112 => ColumnType::Clob,
            113 => ColumnType::Blob,
            other => ColumnType::Unknown(other),
        }
    }
}

/// Resolved table definition after joining the dictionary rows.
#[derive(Debug, Clone)]
pub struct TableDef {
    pub obj: u32,
    pub owner: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Columns forming the message key
    pub key_cols: Vec<u16>,
    /// Columns forming the routing tag preamble
    pub tag_cols: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub col: u16,
    pub name: String,
    pub col_type: ColumnType,
    pub nullable: bool,
}

impl TableDef {
    pub fn column(&self, col: u16) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.col == col)
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.owner, self.name)
    }
}

/// The full serialized snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchemaSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_scn: Option<Scn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_ref_scn: Option<Scn>,
    #[serde(default)]
    pub sys_obj: Vec<SysObj>,
    #[serde(default)]
    pub sys_tab: Vec<SysTab>,
    #[serde(default)]
    pub sys_col: Vec<SysCol>,
    #[serde(default)]
    pub sys_ccol: Vec<serde_json::Value>,
    #[serde(default)]
    pub sys_cdef: Vec<serde_json::Value>,
    #[serde(default)]
    pub sys_deferredstg: Vec<serde_json::Value>,
    #[serde(default)]
    pub sys_ecol: Vec<serde_json::Value>,
    #[serde(default)]
    pub sys_lob: Vec<SysLob>,
    #[serde(default)]
    pub sys_lob_comp_part: Vec<serde_json::Value>,
    #[serde(default)]
    pub sys_lob_frag: Vec<serde_json::Value>,
    #[serde(default)]
    pub sys_tabpart: Vec<serde_json::Value>,
    #[serde(default)]
    pub sys_tabcompart: Vec<serde_json::Value>,
    #[serde(default)]
    pub sys_tabsubpart: Vec<serde_json::Value>,
    #[serde(default)]
    pub sys_ts: Vec<SysTs>,
    #[serde(default)]
    pub sys_user: Vec<SysUser>,
    #[serde(default)]
    pub xdb_ttset: Vec<serde_json::Value>,
    #[serde(default)]
    pub incarnations: Vec<Incarnation>,
    #[serde(default)]
    pub online_redo: Vec<OnlineRedo>,
    #[serde(default)]
    pub users: Vec<String>,
}

impl SchemaSnapshot {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| RedoError::data(30005, format!("malformed schema snapshot: {e}")))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Whether this snapshot carries the dictionary itself or only a
    /// reference to an earlier checkpoint.
    pub fn is_reference(&self) -> bool {
        self.schema_ref_scn.is_some() && self.schema_scn.is_none()
    }
}

/// The in-memory schema: dictionary rows joined into table definitions,
/// restricted by the configured filters.
#[derive(Debug)]
pub struct Schema {
    tables_by_obj: HashMap<u32, TableDef>,
    pub loaded: bool,
}

impl Schema {
    pub fn empty() -> Self {
        Schema { tables_by_obj: HashMap::new(), loaded: false }
    }

    /// Join the snapshot into table definitions. Filters choose which tables
    /// are tracked; key/tag column names resolve to column numbers here so
    /// the hot path never compares strings.
    pub fn build(snapshot: &SchemaSnapshot, filters: &[crate::config::FilterEntry]) -> Result<Self> {
        let users: HashMap<u32, &str> =
            snapshot.sys_user.iter().map(|u| (u.user, u.name.as_str())).collect();
        let tabs: HashMap<u32, &SysTab> = snapshot.sys_tab.iter().map(|t| (t.obj, t)).collect();

        let mut cols_by_obj: HashMap<u32, Vec<&SysCol>> = HashMap::new();
        for col in &snapshot.sys_col {
            cols_by_obj.entry(col.obj).or_default().push(col);
        }

        let mut tables_by_obj = HashMap::new();
        for obj in &snapshot.sys_obj {
            if !tabs.contains_key(&obj.obj) {
                continue;
            }
            let owner = match users.get(&obj.owner) {
                Some(name) => *name,
                None => {
                    return Err(RedoError::data(
                        30006,
                        format!("schema references missing user id {} for {}", obj.owner, obj.name),
                    ))
                }
            };
            let filter = match matching_filter(filters, owner, &obj.name) {
                Some(f) => f,
                None => continue,
            };

            let mut columns: Vec<ColumnDef> = cols_by_obj
                .remove(&obj.obj)
                .unwrap_or_default()
                .into_iter()
                .map(|c| ColumnDef {
                    col: c.col,
                    name: c.name.clone(),
                    col_type: ColumnType::from_code(c.col_type),
                    nullable: c.nullable,
                })
                .collect();
            columns.sort_by_key(|c| c.col);

            let resolve = |names: &[String]| -> Result<Vec<u16>> {
                names
                    .iter()
                    .map(|n| {
                        columns
                            .iter()
                            .find(|c| c.name == *n)
                            .map(|c| c.col)
                            .ok_or_else(|| {
                                RedoError::data(
                                    30007,
                                    format!("filter column {n} not found in {}.{}", owner, obj.name),
                                )
                            })
                    })
                    .collect()
            };
            let key_cols = resolve(&filter.key)?;
            let tag_cols = resolve(&filter.tag)?;

            tables_by_obj.insert(
                obj.obj,
                TableDef {
                    obj: obj.obj,
                    owner: owner.to_string(),
                    name: obj.name.clone(),
                    columns,
                    key_cols,
                    tag_cols,
                },
            );
        }

        Ok(Schema { tables_by_obj, loaded: true })
    }

    pub fn table(&self, obj: u32) -> Option<&TableDef> {
        self.tables_by_obj.get(&obj)
    }

    pub fn table_count(&self) -> usize {
        self.tables_by_obj.len()
    }
}

fn glob_match(pattern: &str, value: &str) -> bool {
    pattern == "*" || pattern.eq_ignore_ascii_case(value)
}

fn matching_filter<'a>(
    filters: &'a [crate::config::FilterEntry],
    owner: &str,
    table: &str,
) -> Option<&'a crate::config::FilterEntry> {
    filters
        .iter()
        .find(|f| glob_match(&f.owner, owner) && glob_match(&f.table, table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterEntry;

    fn snapshot() -> SchemaSnapshot {
        SchemaSnapshot {
            schema_scn: Some(Scn(500)),
            sys_user: vec![SysUser { user: 10, name: "APP".into(), spare1: 0 }],
            sys_obj: vec![SysObj {
                obj: 81337,
                data_obj: 81337,
                owner: 10,
                name: "ORDERS".into(),
                ..SysObj::default()
            }],
            sys_tab: vec![SysTab { obj: 81337, ..SysTab::default() }],
            sys_col: vec![
                SysCol { obj: 81337, col: 1, seg_col: 1, name: "ID".into(), col_type: 2, ..SysCol::default() },
                SysCol { obj: 81337, col: 2, seg_col: 2, name: "NAME".into(), col_type: 1, ..SysCol::default() },
                SysCol { obj: 81337, col: 3, seg_col: 3, name: "CREATED".into(), col_type: 180, ..SysCol::default() },
            ],
            ..SchemaSnapshot::default()
        }
    }

    fn filter(owner: &str, table: &str) -> FilterEntry {
        FilterEntry {
            owner: owner.into(),
            table: table.into(),
            key: vec!["ID".into()],
            tag: vec![],
            condition: None,
            options: None,
        }
    }

    #[test]
    fn snapshot_json_round_trip() {
        let snap = snapshot();
        let bytes = snap.to_json().unwrap();
        let parsed = SchemaSnapshot::from_json(&bytes).unwrap();
        assert_eq!(parsed.schema_scn, Some(Scn(500)));
        assert_eq!(parsed.sys_obj.len(), 1);
        assert_eq!(parsed.sys_col.len(), 3);
        assert!(!parsed.is_reference());
    }

    #[test]
    fn reference_snapshot() {
        let snap = SchemaSnapshot { schema_ref_scn: Some(Scn(400)), ..SchemaSnapshot::default() };
        assert!(snap.is_reference());
    }

    #[test]
    fn build_joins_dictionary_rows() {
        let schema = Schema::build(&snapshot(), &[filter("APP", "ORDERS")]).unwrap();
        let table = schema.table(81337).unwrap();
        assert_eq!(table.full_name(), "APP.ORDERS");
        assert_eq!(table.columns.len(), 3);
        assert_eq!(table.column(3).unwrap().col_type, ColumnType::Timestamp);
        assert_eq!(table.key_cols, vec![1]);
    }

    #[test]
    fn filters_restrict_tables() {
        let schema = Schema::build(&snapshot(), &[filter("APP", "OTHER")]).unwrap();
        assert_eq!(schema.table_count(), 0);
        let schema = Schema::build(&snapshot(), &[filter("*", "*")]).unwrap();
        assert_eq!(schema.table_count(), 1);
    }

    #[test]
    fn missing_user_is_data_error() {
        let mut snap = snapshot();
        snap.sys_user.clear();
        let err = Schema::build(&snap, &[filter("APP", "ORDERS")]).unwrap_err();
        assert_eq!(err.code(), 30006);
    }

    #[test]
    fn missing_key_column_is_data_error() {
        let mut f = filter("APP", "ORDERS");
        f.key = vec!["NO_SUCH".into()];
        let err = Schema::build(&snapshot(), &[f]).unwrap_err();
        assert_eq!(err.code(), 30007);
    }

    #[test]
    fn column_type_mapping() {
        assert_eq!(ColumnType::from_code(2), ColumnType::Number);
        assert_eq!(ColumnType::from_code(180), ColumnType::Timestamp);
        assert_eq!(ColumnType::from_code(181), ColumnType::TimestampTz);
        assert_eq!(ColumnType::from_code(999), ColumnType::Unknown(999));
    }
}
