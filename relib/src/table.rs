//! Table - the in-memory row container.
//!
//! A table holds JSON rows keyed by their canonical primary key string and
//! enforces the constraints declared on it. Rows are kept in a `BTreeMap`
//! so iteration, serialization and checksums are deterministic without a
//! separate sort step.

use crate::canon::{self, Checksum};
use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// Table names double as path components, so the grammar is strict.
static TABLENAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9.-]{1,50}$").expect("hard-coded regex"));

/// Canonical primary keys are reused verbatim as file name components.
static PK_VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,50}$").expect("hard-coded regex"));

/// Dynamic default sentinel: current UTC timestamp, resolved at add time.
pub const DEFAULT_UTCNOW: &str = "@@utcnow";
/// Dynamic default sentinel: max existing integer value of the field plus one.
pub const DEFAULT_IDENTITY: &str = "@@identity";

/// A constraint declared on a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    /// The row identity. Field order for key construction is kept on the
    /// table itself; the constraint stores the sorted field set.
    PrimaryKey { fields: Vec<String> },
    /// No two rows may share values for this field set.
    Unique { fields: Vec<String> },
    /// Values of `fields` must resolve to a row in `table` via that table's
    /// `alias_fields` (a primary key or unique field set there).
    ForeignKey {
        fields: Vec<String>,
        table: String,
        alias_fields: Vec<String>,
    },
}

/// The serializable shape of a table declaration.
///
/// A sequence of these, in declaration order, makes up the store definition
/// document (`#tsdef.json`). Ordering matters: foreign key targets always
/// precede their referrers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub table_name: String,
    #[serde(default)]
    pub single_row: bool,
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub default_values: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subfolder: Option<String>,
}

/// An ordered mapping from canonical primary key to JSON row.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    name: String,
    single_row: bool,
    system: bool,
    pk_fields: Vec<String>,
    constraints: Vec<Constraint>,
    schema: Option<Value>,
    default_values: Map<String, Value>,
    group_by: Option<Vec<String>>,
    subfolder: Option<String>,
    rows: BTreeMap<String, Value>,
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Table('{}')", self.name)
    }
}

impl Table {
    pub(crate) fn new(name: &str) -> Result<Self> {
        // System table names are prefixed with '#' and bypass the grammar.
        if !name.starts_with('#') && !TABLENAME_RE.is_match(name) {
            return Err(Error::Table(format!(
                "Table name '{}' didn't match pattern '{}'.",
                name,
                TABLENAME_RE.as_str()
            )));
        }

        Ok(Self {
            name: name.to_string(),
            single_row: false,
            system: false,
            pk_fields: Vec::new(),
            constraints: Vec::new(),
            schema: None,
            default_values: Map::new(),
            group_by: None,
            subfolder: None,
            rows: BTreeMap::new(),
        })
    }

    /// A single row table always holds one, and only one, row.
    pub(crate) fn new_single_row(name: &str) -> Result<Self> {
        let mut table = Self::new(name)?;
        table.single_row = true;
        table.rows.insert(String::new(), Value::Object(Map::new()));
        Ok(table)
    }

    pub(crate) fn from_definition(def: TableDefinition) -> Result<Self> {
        let mut table = Self::new(&def.table_name)?;
        table.single_row = def.single_row;
        table.system = def.system;
        table.pk_fields = def.primary_key;
        table.constraints = def.constraints;
        table.schema = def.schema;
        table.default_values = def.default_values;
        table.group_by = def.group_by;
        table.subfolder = def.subfolder;
        if table.single_row {
            table
                .rows
                .insert(String::new(), Value::Object(table.resolved_defaults()));
        }
        Ok(table)
    }

    pub(crate) fn definition(&self) -> TableDefinition {
        TableDefinition {
            table_name: self.name.clone(),
            single_row: self.single_row,
            system: self.system,
            primary_key: self.pk_fields.clone(),
            constraints: self.constraints.clone(),
            schema: self.schema.clone(),
            default_values: self.default_values.clone(),
            group_by: self.group_by.clone(),
            subfolder: self.subfolder.clone(),
        }
    }

    /// The table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is a reserved system table (excluded from user-visible
    /// enumeration and from the store checksum).
    pub fn is_system(&self) -> bool {
        self.system
    }

    pub(crate) fn set_system(&mut self, system: bool) {
        self.system = system;
    }

    /// Whether this table holds exactly one row.
    pub fn is_single_row(&self) -> bool {
        self.single_row
    }

    /// Primary key field names in declaration order.
    pub fn primary_key_fields(&self) -> &[String] {
        &self.pk_fields
    }

    /// All declared constraints.
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub(crate) fn group_by_fields(&self) -> Option<&[String]> {
        self.group_by.as_deref()
    }

    pub(crate) fn schema(&self) -> Option<&Value> {
        self.schema.as_ref()
    }

    pub(crate) fn push_constraint(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    /// Declare the primary key. Field order determines how the canonical
    /// key string is constructed. Declaring a primary key twice is an error.
    pub fn add_primary_key(&mut self, fields: &[&str]) -> Result<()> {
        if self.single_row {
            return Err(Error::Table(format!(
                "Single row table '{}' can't have a primary key.",
                self.name
            )));
        }
        if !self.pk_fields.is_empty() {
            return Err(Error::Table(format!(
                "Primary key already declared for table '{}'.",
                self.name
            )));
        }
        if fields.is_empty() {
            return Err(Error::Table(format!(
                "Primary key for table '{}' needs at least one field.",
                self.name
            )));
        }

        self.pk_fields = fields.iter().map(|f| f.to_string()).collect();
        let mut sorted = self.pk_fields.clone();
        sorted.sort();
        self.constraints.push(Constraint::PrimaryKey { fields: sorted });
        Ok(())
    }

    /// Add a unique constraint over the given field set.
    pub fn add_unique_constraint(&mut self, fields: &[&str]) -> Result<()> {
        if fields.is_empty() {
            return Err(Error::Table(format!(
                "Unique constraint for table '{}' needs at least one field.",
                self.name
            )));
        }
        let mut sorted: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        sorted.sort();
        self.constraints.push(Constraint::Unique { fields: sorted });
        Ok(())
    }

    /// Attach a JSON schema for row validation.
    pub fn add_schema(&mut self, schema: Value) {
        self.schema = Some(schema);
    }

    /// Define default values merged into every added row. Values may use
    /// the `@@utcnow` and `@@identity` sentinels, resolved at add time.
    ///
    /// On a single row table this re-initializes the row from the defaults.
    pub fn add_default_values(&mut self, default_values: Value) -> Result<()> {
        let Value::Object(defaults) = default_values else {
            return Err(Error::Table(format!(
                "Default values for table '{}' must be an object.",
                self.name
            )));
        };
        self.default_values = defaults;
        if self.single_row {
            self.rows
                .insert(String::new(), Value::Object(self.resolved_defaults()));
        }
        Ok(())
    }

    /// Place the table file or files in a subfolder called `subfolder_name`.
    pub fn set_subfolder_name(&mut self, subfolder_name: &str) {
        self.subfolder = Some(subfolder_name.to_string());
    }

    /// Serialize rows into separate files instead of one table file.
    ///
    /// `group_by` is a subset of the primary key fields to group rows by.
    /// If not set, every row gets its own file. If `subfolder_name` is set,
    /// all row files are placed in a subfolder with that name.
    pub fn set_row_as_file(
        &mut self,
        subfolder_name: Option<&str>,
        group_by: Option<&[&str]>,
    ) -> Result<()> {
        if self.single_row {
            return Err(Error::Table(format!(
                "Single row table '{}' is always serialized as one document.",
                self.name
            )));
        }

        match group_by {
            Some(fields) => {
                let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
                if !fields.iter().all(|f| self.pk_fields.contains(f)) {
                    return Err(Error::Table(format!(
                        "'group_by' fields {:?} must be part of primary key fields {:?}.",
                        fields, self.pk_fields
                    )));
                }
                self.group_by = Some(fields);
            }
            None => self.group_by = Some(self.pk_fields.clone()),
        }

        self.subfolder = subfolder_name.map(|s| s.to_string());
        Ok(())
    }

    /// Build the canonical string representation of a primary key.
    ///
    /// `source` is any object carrying at least the primary key fields -
    /// usually a full row. The result conforms to the key grammar so it can
    /// be used in file names as well.
    pub(crate) fn canonical_key(&self, source: &Value, use_group_by: bool) -> Result<String> {
        if self.single_row {
            return Ok(String::new());
        }

        let fields = if use_group_by {
            self.group_by.as_deref().unwrap_or(&self.pk_fields)
        } else {
            &self.pk_fields
        };

        let source_obj = source.as_object();
        let have: Vec<&String> = source_obj
            .map(|obj| obj.keys().collect())
            .unwrap_or_default();
        let missing = source_obj.is_none()
            || fields
                .iter()
                .any(|f| !source_obj.is_some_and(|obj| obj.contains_key(f)));
        if fields.is_empty() || missing {
            return Err(Error::Table(format!(
                "For table '{}', can't make primary key. Need {:?} but got {:?}.",
                self.name, fields, have
            )));
        }

        let mut parts = Vec::with_capacity(fields.len());
        for field in fields {
            // Presence was checked above, so the lookup can't miss.
            let value = source_obj.and_then(|obj| obj.get(field)).ok_or_else(|| {
                Error::Table(format!(
                    "For table '{}', can't make primary key. Need {:?} but got {:?}.",
                    self.name, fields, have
                ))
            })?;
            parts.push(key_fragment(&self.name, field, value)?);
        }
        let canonicalized = parts.join(".");

        if !PK_VALUE_RE.is_match(&canonicalized) {
            return Err(Error::Constraint(format!(
                "Primary key value '{}' didn't match pattern '{}'.",
                canonicalized,
                PK_VALUE_RE.as_str()
            )));
        }

        Ok(canonicalized)
    }

    /// Get the row pointed to by `primary_key`, an object containing all
    /// the fields that make up the primary key.
    pub fn get(&self, primary_key: &Value) -> Result<Option<&Value>> {
        let key = self.canonical_key(primary_key, false)?;
        Ok(self.rows.get(&key))
    }

    /// Mutable access to a row. Primary key and unique constraint fields
    /// may not be altered without compromising relational integrity; any
    /// other modification is fair game.
    pub fn get_mut(&mut self, primary_key: &Value) -> Result<Option<&mut Value>> {
        let key = self.canonical_key(primary_key, false)?;
        Ok(self.rows.get_mut(&key))
    }

    /// The document of a single row table.
    pub fn get_single(&self) -> Option<&Value> {
        self.rows.get("")
    }

    /// Mutable document of a single row table.
    pub fn get_single_mut(&mut self) -> Option<&mut Value> {
        self.rows.get_mut("")
    }

    /// Convenience accessor for a field of a single row table.
    pub fn single_field(&self, field: &str) -> Option<&Value> {
        self.get_single().and_then(|row| row.get(field))
    }

    /// Find all rows matching `criteria`, a map of field=value pairs.
    /// `None` returns all rows.
    pub fn find(&self, criteria: Option<&Value>) -> Vec<&Value> {
        let Some(criteria) = criteria else {
            return self.rows.values().collect();
        };
        let Some(criteria) = criteria.as_object() else {
            return Vec::new();
        };

        self.rows
            .values()
            .filter(|row| {
                criteria
                    .iter()
                    .all(|(field, expected)| row.get(field) == Some(expected))
            })
            .collect()
    }

    /// Remove the row identified by `primary_key` and return it.
    /// No cascading; use `TableStore::find_references` first.
    pub fn remove(&mut self, primary_key: &Value) -> Result<Value> {
        if self.single_row {
            return Err(Error::Table(format!(
                "Can't remove the row of single row table '{}'.",
                self.name
            )));
        }
        let key = self.canonical_key(primary_key, false)?;
        self.rows
            .remove(&key)
            .ok_or_else(|| Error::Table(format!("No row '{}' in table '{}'.", key, self.name)))
    }

    /// Remove all rows. A single row table resets to its default document.
    pub fn clear(&mut self) {
        self.rows.clear();
        if self.single_row {
            self.rows
                .insert(String::new(), Value::Object(self.resolved_defaults()));
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate rows as (canonical key, row), ordered by key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.rows.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn rows(&self) -> &BTreeMap<String, Value> {
        &self.rows
    }

    pub(crate) fn insert_unchecked(&mut self, key: String, row: Value) {
        if self.single_row {
            self.rows.clear();
        }
        self.rows.insert(key, row);
    }

    /// Default values with dynamic sentinels resolved.
    pub(crate) fn resolved_defaults(&self) -> Map<String, Value> {
        let mut defaults = self.default_values.clone();
        for (field, value) in defaults.iter_mut() {
            let Some(text) = value.as_str() else { continue };
            if !text.starts_with("@@") {
                continue;
            }
            match text {
                DEFAULT_UTCNOW => *value = Value::String(canon::utc_now_iso()),
                DEFAULT_IDENTITY => {
                    let next = self
                        .rows
                        .values()
                        .filter_map(|row| row.get(field).and_then(Value::as_i64))
                        .max()
                        .map_or(1, |max| max + 1);
                    *value = Value::from(next);
                }
                other => {
                    warn!(
                        "Unknown dynamic default value '{}' defined in table '{}'",
                        other, self.name
                    );
                }
            }
        }
        defaults
    }

    /// Merge table defaults into `row` and return the resulting row.
    pub(crate) fn merge_defaults(&self, row: Value) -> Result<Value> {
        let Value::Object(row) = row else {
            return Err(Error::Table(format!(
                "Row data for table '{}' must be an object.",
                self.name
            )));
        };
        let mut target = self.resolved_defaults();
        for (field, value) in row {
            target.insert(field, value);
        }
        Ok(Value::Object(target))
    }

    /// Check that the fields of `constraint_fields` are present in `row`.
    pub(crate) fn check_presence(&self, row: &Value, constraint: &Constraint) -> Result<()> {
        let fields = match constraint {
            Constraint::PrimaryKey { fields } | Constraint::Unique { fields } => fields,
            Constraint::ForeignKey { .. } => return Ok(()),
        };
        let present = row
            .as_object()
            .is_some_and(|obj| fields.iter().all(|f| obj.contains_key(f)));
        if !present {
            return Err(Error::Constraint(format!(
                "In table '{}', row violates constraint {:?}: {}",
                self.name, constraint, row
            )));
        }
        Ok(())
    }

    /// Check a unique constraint against the stored rows.
    pub(crate) fn check_unique(&self, row: &Value, fields: &[String]) -> Result<()> {
        let mut criteria = Map::new();
        for field in fields {
            if let Some(value) = row.get(field) {
                criteria.insert(field.clone(), value.clone());
            }
        }
        let criteria = Value::Object(criteria);
        let found = self.find(Some(&criteria));
        if !found.is_empty() {
            return Err(Error::Constraint(format!(
                "Unique constraint violation in table '{}' on {} because of existing row.",
                self.name, criteria
            )));
        }
        Ok(())
    }

    /// Return a file name for this table and `row` for serialization.
    ///
    /// If the table is serialized as a single file, `row` should be `None`.
    /// If `is_index_file` is set, the name of the table index file is
    /// returned instead.
    pub fn get_filename(&self, row: Option<&Value>, is_index_file: bool) -> Result<String> {
        if self.group_by.is_some() && row.is_none() && !is_index_file {
            return Err(Error::Table(format!(
                "Need 'row' to generate a file name because rows in table '{}' are serialized separately.",
                self.name
            )));
        }
        if row.is_some() && self.group_by.is_none() {
            return Err(Error::Table(format!(
                "Can't create filename for table '{}' using 'row' fields without a prior call to set_row_as_file().",
                self.name
            )));
        }

        let mut file_name = if is_index_file {
            format!("#.{}", self.name)
        } else {
            self.name.clone()
        };

        if let Some(subfolder) = &self.subfolder {
            file_name = format!("{}/{}", subfolder, file_name);
        }

        if let Some(row) = row {
            file_name.push('.');
            file_name.push_str(&self.canonical_key(row, true)?);
        }

        file_name.push_str(".json");
        Ok(file_name)
    }

    /// Write all table data through `sink` and return the SHA-256 hex
    /// digest of exactly the bytes written, in write order.
    pub(crate) fn save(
        &self,
        sink: &mut dyn FnMut(&str, &[u8]) -> Result<()>,
    ) -> Result<String> {
        let mut checksum = Checksum::new();
        let mut write = |file_name: &str, data: &[u8]| -> Result<()> {
            checksum.update(data);
            sink(file_name, data)
        };

        if self.single_row {
            let empty = Value::Object(Map::new());
            let doc = self.rows.get("").unwrap_or(&empty);
            let data = canon::to_canonical_json(doc);
            write(&self.get_filename(None, false)?, &data)?;
            return Ok(checksum.hexdigest());
        }

        match &self.group_by {
            Some(group_fields) => {
                let row_per_file = *group_fields == self.pk_fields;

                if row_per_file {
                    for row in self.rows.values() {
                        let data = canon::to_canonical_json(row);
                        write(&self.get_filename(Some(row), false)?, &data)?;
                    }
                } else {
                    // Coalesce rows sharing a group key into one file.
                    let mut groups: BTreeMap<String, Vec<&Value>> = BTreeMap::new();
                    for row in self.rows.values() {
                        let key = self.canonical_key(row, true)?;
                        groups.entry(key).or_default().push(row);
                    }
                    for rowset in groups.values() {
                        let doc = Value::Array(rowset.iter().map(|r| (*r).clone()).collect());
                        let data = canon::to_canonical_json(&doc);
                        write(&self.get_filename(Some(rowset[0]), false)?, &data)?;
                    }
                }

                // The index lists all primary keys so the table can be read
                // back without scanning directories.
                let index: Vec<Value> = self
                    .rows
                    .values()
                    .map(|row| {
                        let mut entry = Map::new();
                        for field in &self.pk_fields {
                            if let Some(value) = row.get(field) {
                                entry.insert(field.clone(), value.clone());
                            }
                        }
                        Value::Object(entry)
                    })
                    .collect();
                let data = canon::to_canonical_json(&Value::Array(index));
                write(&self.get_filename(None, true)?, &data)?;
            }
            None => {
                let doc = Value::Array(self.rows.values().cloned().collect());
                let data = canon::to_canonical_json(&doc);
                write(&self.get_filename(None, false)?, &data)?;
            }
        }

        Ok(checksum.hexdigest())
    }
}

fn key_fragment(table: &str, field: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(Error::Table(format!(
            "For table '{}', field '{}' with value {} can't be part of a primary key.",
            table, field, other
        ))),
    }
}
