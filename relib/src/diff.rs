//! Diff and copy utilities.
//!
//! Table-level and metadata-level comparisons, used by the reconciliation
//! tooling to explain a checksum mismatch, plus deep copies produced by a
//! serialize/deserialize round-trip.

use crate::backend::MemoryBackend;
use crate::error::Result;
use crate::store::TableStore;
use crate::table::Table;
use serde_json::Value;
use std::collections::BTreeSet;

/// Row-level difference between two tables.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableDiff {
    /// True when the tables hold identical rows.
    pub identical: bool,
    /// Rows present in the first table only.
    pub new_rows: Vec<Value>,
    /// Rows present in the second table only.
    pub deleted_rows: Vec<Value>,
    /// Rows present in both but with different content.
    pub modified_rows: Vec<RowChange>,
}

/// A row that differs between two tables.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub first: Value,
    pub second: Value,
}

/// Compare `first` to `second` and report the difference.
pub fn diff_tables(first: &Table, second: &Table) -> TableDiff {
    if first.rows() == second.rows() {
        return TableDiff {
            identical: true,
            ..TableDiff::default()
        };
    }

    let first_keys: BTreeSet<&String> = first.rows().keys().collect();
    let second_keys: BTreeSet<&String> = second.rows().keys().collect();

    let mut diff = TableDiff::default();
    for key in first_keys.difference(&second_keys) {
        diff.new_rows.push(first.rows()[*key].clone());
    }
    for key in second_keys.difference(&first_keys) {
        diff.deleted_rows.push(second.rows()[*key].clone());
    }
    for key in first_keys.intersection(&second_keys) {
        let a = &first.rows()[*key];
        let b = &second.rows()[*key];
        if a != b {
            diff.modified_rows.push(RowChange {
                first: a.clone(),
                second: b.clone(),
            });
        }
    }

    diff
}

/// Difference between two metadata documents.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetaDiff {
    /// True when the documents are identical.
    pub identical: bool,
    /// Store checksums of the first and second document.
    pub checksum: Option<(String, String)>,
    /// Absolute difference between the two `last_modified` stamps, in
    /// seconds, when both parse.
    pub modified_diff_seconds: Option<i64>,
    /// Table names present in the first document only.
    pub new_tables: Vec<String>,
    /// Table names present in the second document only.
    pub deleted_tables: Vec<String>,
    /// Table names whose digest differs.
    pub modified_tables: Vec<String>,
}

/// Return a diff report on two metadata documents.
pub fn diff_meta(first: &Value, second: &Value) -> MetaDiff {
    if first == second {
        return MetaDiff {
            identical: true,
            ..MetaDiff::default()
        };
    }

    let mut diff = MetaDiff::default();
    diff.checksum = Some((
        text_field(first, "checksum"),
        text_field(second, "checksum"),
    ));

    let parse = |meta: &Value| {
        meta.get("last_modified")
            .and_then(Value::as_str)
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
    };
    if let (Some(a), Some(b)) = (parse(first), parse(second)) {
        diff.modified_diff_seconds = Some((b - a).num_seconds().abs());
    }

    let digests = |meta: &Value| -> Vec<(String, String)> {
        meta.get("tables")
            .and_then(Value::as_array)
            .map(|tables| {
                tables
                    .iter()
                    .map(|t| (text_field(t, "table_name"), text_field(t, "md5")))
                    .collect()
            })
            .unwrap_or_default()
    };
    let first_tables = digests(first);
    let second_tables = digests(second);

    for (name, _) in &first_tables {
        if !second_tables.iter().any(|(n, _)| n == name) {
            diff.new_tables.push(name.clone());
        }
    }
    for (name, digest) in &second_tables {
        match first_tables.iter().find(|(n, _)| n == name) {
            None => diff.deleted_tables.push(name.clone()),
            Some((_, first_digest)) if first_digest != digest => {
                diff.modified_tables.push(name.clone());
            }
            Some(_) => {}
        }
    }

    diff
}

fn text_field(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Return a stand-alone deep copy of `table_store`, produced by a
/// round-trip through a scratch in-memory backend.
pub fn copy_table_store(table_store: &mut TableStore) -> Result<TableStore> {
    let mut backend = MemoryBackend::scratch();
    table_store.save_to_backend(&mut backend)?;
    TableStore::from_backend(&mut backend)
}
