//! TableStore - the collection of named tables.
//!
//! The store owns every table and is the entry point for all cross-table
//! work: row insertion (foreign keys need sibling lookups), foreign row
//! resolution, reference walks, serialization to a backend and the
//! checksum-carrying metadata table.

use crate::backend::{Backend, MemoryBackend};
use crate::canon::{self, Checksum};
use crate::error::{Error, Result};
use crate::integrity;
use crate::schema::check_schema;
use crate::table::{Constraint, Table, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

/// Reserved path of the schema definition document.
pub const TS_DEF_FILENAME: &str = "#tsdef.json";
/// Reserved name of the metadata single row table.
pub const TS_META_TABLENAME: &str = "#tsmeta";

/// The serializable shape of a whole store declaration: every table's
/// definition, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDefinition {
    pub tables: Vec<TableDefinition>,
}

/// An ordered mapping from table name to table, plus the reserved
/// metadata table.
#[derive(Debug, Clone)]
pub struct TableStore {
    tables: Vec<Table>,
    origin_label: String,
    meta_locked: bool,
}

impl std::fmt::Display for TableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TableStore(Origin: {}. Tables: {})",
            self.origin_label,
            self.tables.len()
        )
    }
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TableStore {
    /// Create an empty store containing only the metadata table.
    pub fn new() -> Self {
        let mut ts = Self {
            tables: Vec::new(),
            origin_label: "clean".to_string(),
            meta_locked: false,
        };
        ts.add_meta_table();
        ts
    }

    /// Create a store by loading definition and data from `backend`.
    pub fn from_backend(backend: &mut dyn Backend) -> Result<Self> {
        let mut ts = Self::new();
        ts.load_from_backend(backend, false)?;
        Ok(ts)
    }

    fn add_meta_table(&mut self) {
        // The meta table is declared through the public path so its
        // definition round-trips like any other table.
        let meta_schema = json!({
            "type": "object",
            "properties": {
                "created_on": {"format": "date-time"},
                "last_modified": {"format": "date-time"},
                "origin": {"type": "string"},
                "version": {"type": "integer"},
                "checksum": {"type": "string"},
                "tables": {"type": "array", "items": {
                    "type": "object",
                    "properties": {
                        "table_name": {"type": "string"},
                        "md5": {"type": "string"},
                        "last_modified": {"format": "date-time"},
                    },
                }},
            },
        });
        let meta_defaults = json!({
            "created_on": "@@utcnow",
            "last_modified": "@@utcnow",
            "version": 1,
            "checksum": "",
            "origin": "",
            "tables": [],
        });

        // The meta table name starts with '#', which always passes the
        // name check, so these cannot fail.
        if let Ok(meta) = self.add_single_row_table(TS_META_TABLENAME) {
            meta.set_system(true);
            meta.add_schema(meta_schema);
            let _ = meta.add_default_values(meta_defaults);
        }
    }

    fn position(&self, table_name: &str) -> Option<usize> {
        self.tables.iter().position(|t| t.name() == table_name)
    }

    /// Add a regular table to the store.
    pub fn add_table(&mut self, table_name: &str) -> Result<&mut Table> {
        if self.position(table_name).is_some() {
            return Err(Error::Table(format!(
                "Table '{}' already exists in the store.",
                table_name
            )));
        }
        self.tables.push(Table::new(table_name)?);
        Ok(self.tables.last_mut().expect("just pushed"))
    }

    /// Add a single row table to the store.
    pub fn add_single_row_table(&mut self, table_name: &str) -> Result<&mut Table> {
        if self.position(table_name).is_some() {
            return Err(Error::Table(format!(
                "Table '{}' already exists in the store.",
                table_name
            )));
        }
        self.tables.push(Table::new_single_row(table_name)?);
        Ok(self.tables.last_mut().expect("just pushed"))
    }

    /// Get a table by name.
    pub fn get_table(&self, table_name: &str) -> Result<&Table> {
        self.position(table_name)
            .map(|i| &self.tables[i])
            .ok_or_else(|| Error::Table(format!("No table named '{}' in the store.", table_name)))
    }

    /// Get a table by name for mutation. The metadata table is refused
    /// while a transaction holds the meta lock.
    pub fn get_table_mut(&mut self, table_name: &str) -> Result<&mut Table> {
        if self.meta_locked && table_name == TS_META_TABLENAME {
            return Err(Error::Table(
                "The metadata table is read-only while a transaction is open.".to_string(),
            ));
        }
        let i = self
            .position(table_name)
            .ok_or_else(|| Error::Table(format!("No table named '{}' in the store.", table_name)))?;
        Ok(&mut self.tables[i])
    }

    /// User-visible tables in declaration order (system tables excluded).
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().filter(|t| !t.is_system())
    }

    /// The reserved metadata table.
    pub fn meta(&self) -> &Table {
        // The meta table is created in `new` and never dropped.
        self.tables
            .iter()
            .find(|t| t.name() == TS_META_TABLENAME)
            .expect("meta table is created with the store")
    }

    /// The metadata document.
    pub fn meta_row(&self) -> Result<&Value> {
        self.meta().get_single().ok_or_else(|| {
            Error::Table("The metadata table has lost its row.".to_string())
        })
    }

    /// The store checksum recorded in the metadata table.
    pub fn checksum(&self) -> Result<String> {
        Ok(self
            .meta_row()?
            .get("checksum")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    fn meta_row_mut(&mut self) -> Result<&mut Value> {
        let i = self
            .position(TS_META_TABLENAME)
            .ok_or_else(|| Error::Table("The metadata table is missing.".to_string()))?;
        self.tables[i].get_single_mut().ok_or_else(|| {
            Error::Table("The metadata table has lost its row.".to_string())
        })
    }

    /// Mark the metadata table read-only, refusing mutable access until
    /// `unlock_meta` is called. Used by editing transactions.
    pub fn lock_meta(&mut self) {
        self.meta_locked = true;
    }

    /// Release the meta lock.
    pub fn unlock_meta(&mut self) {
        self.meta_locked = false;
    }

    /// Declare a foreign key relationship from `table_name` to
    /// `target_table`.
    ///
    /// The foreign key must link to a primary key or unique constraint in
    /// the target table, which must already be defined - except that a
    /// table may reference itself. If the field names differ between the
    /// tables, `alias_fields` identifies them on the target side.
    pub fn add_foreign_key(
        &mut self,
        table_name: &str,
        fields: &[&str],
        target_table: &str,
        alias_fields: Option<&[&str]>,
    ) -> Result<()> {
        let mut fk_fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        fk_fields.sort();
        let mut aliased: Vec<String> = alias_fields
            .unwrap_or(fields)
            .iter()
            .map(|f| f.to_string())
            .collect();
        aliased.sort();

        // The target must already be declared; this keeps the table order a
        // DAG (with self-references as the only loops) so that reload can
        // always insert referenced rows first.
        let target = self.get_table(target_table).map_err(|_| {
            Error::Table(format!(
                "Foreign key target '{}' must be defined before table '{}' references it.",
                target_table, table_name
            ))
        })?;

        let alias_set: HashSet<&String> = aliased.iter().collect();
        let linked = target.constraints().iter().any(|c| match c {
            Constraint::PrimaryKey { fields } | Constraint::Unique { fields } => {
                alias_set.is_subset(&fields.iter().collect())
            }
            Constraint::ForeignKey { .. } => false,
        });
        if !linked {
            return Err(Error::Constraint(format!(
                "Can't create foreign key relationship from {} {:?} to {}.",
                table_name, aliased, target_table
            )));
        }

        let table = self.get_table_mut(table_name)?;
        table.push_constraint(Constraint::ForeignKey {
            fields: fk_fields,
            table: target_table.to_string(),
            alias_fields: aliased,
        });
        Ok(())
    }

    /// Add a row to a table, merging defaults and enforcing all integrity
    /// checks. Returns the stored row.
    pub fn add_row(&mut self, table_name: &str, row: Value) -> Result<Value> {
        if self.meta_locked && table_name == TS_META_TABLENAME {
            return Err(Error::Table(
                "The metadata table is read-only while a transaction is open.".to_string(),
            ));
        }
        self.insert_validated(table_name, row)
    }

    /// Validate a row exactly as `add_row` would, without storing it.
    /// Returns the row with defaults merged in.
    pub fn check_row(&self, table_name: &str, row: Value) -> Result<Value> {
        let (_, merged) = self.validate_row(table_name, row)?;
        Ok(merged)
    }

    fn insert_validated(&mut self, table_name: &str, row: Value) -> Result<Value> {
        let (key, merged) = self.validate_row(table_name, row)?;
        let i = self
            .position(table_name)
            .ok_or_else(|| Error::Table(format!("No table named '{}' in the store.", table_name)))?;
        self.tables[i].insert_unchecked(key, merged.clone());
        Ok(merged)
    }

    /// The constraint check ladder. Order is stable and observable through
    /// error messages: primary key presence, primary key format, unique
    /// field presence, unique field uniqueness, foreign key resolution,
    /// schema validation, primary key duplication.
    fn validate_row(&self, table_name: &str, row: Value) -> Result<(String, Value)> {
        let checks = integrity::current();
        let table = self.get_table(table_name)?;
        let merged = table.merge_defaults(row)?;

        if table.is_single_row() {
            if checks.schema {
                if let Some(schema) = table.schema() {
                    check_schema(&merged, schema, &format!("Adding row to {}", table))?;
                }
            }
            return Ok((String::new(), merged));
        }

        if checks.constraints {
            for constraint in table.constraints() {
                if matches!(constraint, Constraint::PrimaryKey { .. }) {
                    table.check_presence(&merged, constraint)?;
                }
            }
        }

        let key = table.canonical_key(&merged, false)?;

        for constraint in table.constraints() {
            if let Constraint::Unique { fields } = constraint {
                if checks.constraints {
                    table.check_presence(&merged, constraint)?;
                }
                if checks.unique {
                    table.check_unique(&merged, fields)?;
                }
            }
        }

        if checks.fk {
            for constraint in table.constraints() {
                let Constraint::ForeignKey { fields, table: target, alias_fields } = constraint
                else {
                    continue;
                };
                // A foreign key is only verified when all its fields are set.
                let present = merged
                    .as_object()
                    .is_some_and(|obj| fields.iter().all(|f| obj.contains_key(f)));
                if !present {
                    continue;
                }
                let found =
                    self.resolve_foreign(table, &merged, fields, target, alias_fields)?;
                if found.is_empty() {
                    let key_values: Map<String, Value> = fields
                        .iter()
                        .map(|f| (f.clone(), merged.get(f).cloned().unwrap_or(Value::Null)))
                        .collect();
                    return Err(Error::Constraint(format!(
                        "In table '{}', foreign key record in '{}' not found {}.",
                        table.name(),
                        target,
                        Value::Object(key_values)
                    )));
                }
            }
        }

        if checks.schema {
            if let Some(schema) = table.schema() {
                check_schema(&merged, schema, &format!("Adding row to {}", table))?;
            }
        }

        if checks.pk && table.rows().contains_key(&key) {
            return Err(Error::Constraint(format!(
                "Primary key violation in table '{}': {}",
                table.name(),
                key
            )));
        }

        Ok((key, merged))
    }

    fn resolve_foreign<'a>(
        &'a self,
        table: &Table,
        row: &'a Value,
        fields: &[String],
        target: &str,
        alias_fields: &[String],
    ) -> Result<Vec<&'a Value>> {
        let mut criteria = Map::new();
        for (field, alias) in fields.iter().zip(alias_fields) {
            criteria.insert(
                alias.clone(),
                row.get(field).cloned().unwrap_or(Value::Null),
            );
        }

        // Special case: the foreign row is the row itself, which may be in
        // the process of being inserted. This must precede the normal
        // lookup, which would fail because the row is not yet stored.
        if table.name() == target {
            let is_self = criteria
                .iter()
                .all(|(field, value)| row.get(field) == Some(value));
            if is_self {
                return Ok(vec![row]);
            }
        }

        let target_table = self.get_table(target)?;
        Ok(target_table.find(Some(&Value::Object(criteria))))
    }

    /// Fetch the foreign row in `target_table` referenced by `row` of
    /// `table_name`. If more than one foreign key relationship exists
    /// between the tables, `fk_fields` disambiguates (sorted field names).
    pub fn get_foreign_row<'a>(
        &'a self,
        table_name: &str,
        row: &'a Value,
        target_table: &str,
        fk_fields: Option<&[String]>,
    ) -> Result<Option<&'a Value>> {
        let table = self.get_table(table_name)?;

        let constraint = table
            .constraints()
            .iter()
            .find_map(|c| match c {
                Constraint::ForeignKey { fields, table: target, alias_fields }
                    if target.as_str() == target_table
                        && fk_fields.map_or(true, |wanted| wanted == fields.as_slice()) =>
                {
                    Some((fields, alias_fields))
                }
                _ => None,
            })
            .ok_or_else(|| {
                Error::Table(format!(
                    "No foreign key relationship found between '{}' and '{}'.",
                    table_name, target_table
                ))
            })?;

        let (fields, alias_fields) = constraint;
        let present = row
            .as_object()
            .is_some_and(|obj| fields.iter().all(|f| obj.contains_key(f)));
        if !present {
            return Ok(None);
        }

        let found = self.resolve_foreign(table, row, fields, target_table, alias_fields)?;
        Ok(found.into_iter().next())
    }

    /// Transitively collect rows in any table (including `table_name`
    /// itself) that reference `row` via foreign key. Used for safe
    /// cascading deletes.
    pub fn find_references(
        &self,
        table_name: &str,
        row: &Value,
    ) -> Result<BTreeMap<String, Vec<Value>>> {
        let mut result: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        let mut visited: HashSet<(String, String)> = HashSet::new();
        let mut worklist: Vec<(String, Value)> = vec![(table_name.to_string(), row.clone())];

        while let Some((ref_table, ref_row)) = worklist.pop() {
            for table in &self.tables {
                for constraint in table.constraints() {
                    let Constraint::ForeignKey { fields, table: target, alias_fields } = constraint
                    else {
                        continue;
                    };
                    if target != &ref_table {
                        continue;
                    }
                    // Criteria on the referencing table's key fields, with
                    // values taken from the referenced row's alias fields.
                    let mut criteria = Map::new();
                    let mut complete = true;
                    for (field, alias) in fields.iter().zip(alias_fields) {
                        match ref_row.get(alias) {
                            Some(value) => {
                                criteria.insert(field.clone(), value.clone());
                            }
                            None => complete = false,
                        }
                    }
                    if !complete {
                        continue;
                    }

                    for found in table.find(Some(&Value::Object(criteria))) {
                        let key = table.canonical_key(found, false)?;
                        if visited.insert((table.name().to_string(), key)) {
                            result
                                .entry(table.name().to_string())
                                .or_default()
                                .push(found.clone());
                            worklist.push((table.name().to_string(), found.clone()));
                        }
                    }
                }
            }
        }

        Ok(result)
    }

    /// Emit the definition of this store and all its tables as a canonical
    /// JSON document. Inverse of `init_from_definition`.
    pub fn get_definition(&self) -> Result<String> {
        let def = StoreDefinition {
            tables: self.tables.iter().map(Table::definition).collect(),
        };
        let value = serde_json::to_value(&def)
            .map_err(|e| Error::Table(format!("Can't serialize store definition: {}", e)))?;
        Ok(canon::to_canonical_string(&value))
    }

    /// Initialize this store from a definition document produced by
    /// `get_definition`. Replaces all current tables; the declaration
    /// order is recovered so foreign key targets exist before referrers.
    pub fn init_from_definition(&mut self, definition: &str) -> Result<()> {
        let def: StoreDefinition = serde_json::from_str(definition)
            .map_err(|e| Error::Table(format!("Can't parse store definition: {}", e)))?;

        let mut tables = Vec::with_capacity(def.tables.len());
        for table_def in def.tables {
            tables.push(Table::from_definition(table_def)?);
        }

        // Foreign key targets must appear earlier in the order (or be the
        // table itself); anything else would be a cycle.
        for (i, table) in tables.iter().enumerate() {
            for constraint in table.constraints() {
                let Constraint::ForeignKey { table: target, .. } = constraint else {
                    continue;
                };
                let defined = tables[..=i].iter().any(|t| t.name() == target);
                if !defined {
                    return Err(Error::Table(format!(
                        "Foreign key target '{}' of table '{}' is not defined earlier in the table order.",
                        target,
                        table.name()
                    )));
                }
            }
        }

        self.tables = tables;
        if self.position(TS_META_TABLENAME).is_none() {
            self.add_meta_table();
        }
        Ok(())
    }

    /// Save this store's definition and table data to `backend` with the
    /// default policy: refuse partially constructed stores and run a full
    /// integrity check first.
    pub fn save_to_backend(&mut self, backend: &mut dyn Backend) -> Result<()> {
        self.save_to_backend_checked(backend, false, true)
    }

    /// Save with explicit policy. `force` allows writing a store with no
    /// user tables; `run_integrity_check` toggles the pre-write check.
    ///
    /// Write order is fixed: definition, user tables in declaration order,
    /// then system tables with the metadata table as the very last bytes.
    /// A reader observing a complete metadata file can therefore assume
    /// all other tables are present and consistent.
    pub fn save_to_backend_checked(
        &mut self,
        backend: &mut dyn Backend,
        force: bool,
        run_integrity_check: bool,
    ) -> Result<()> {
        if self.tables.len() < 2 && !force {
            return Err(Error::Table(
                "Won't save out partially constructed table store.".to_string(),
            ));
        }

        if run_integrity_check {
            self.check_integrity()?;
        }

        backend.start_saving()?;
        backend.save_data(TS_DEF_FILENAME, self.get_definition()?.as_bytes())?;

        let user_indices: Vec<usize> = (0..self.tables.len())
            .filter(|&i| !self.tables[i].is_system())
            .collect();
        let system_indices: Vec<usize> = (0..self.tables.len())
            .filter(|&i| self.tables[i].is_system() && self.tables[i].name() != TS_META_TABLENAME)
            .collect();

        let mut digests = Vec::with_capacity(user_indices.len());
        for i in &user_indices {
            let table = &self.tables[*i];
            debug!("Save to backend {}: {}", backend.get_url(), table);
            let digest = table.save(&mut |name, data| backend.save_data(name, data))?;
            digests.push((table.name().to_string(), digest));
        }

        for (table_name, digest) in &digests {
            self.update_table_metadata(table_name, digest)?;
        }

        // The store checksum depends only on the user table digests, never
        // on the metadata table itself; refresh stays idempotent that way.
        let mut checksum = Checksum::new();
        for (_, digest) in &digests {
            checksum.update(digest.as_bytes());
        }
        let store_checksum = checksum.hexdigest();
        if let Some(obj) = self.meta_row_mut()?.as_object_mut() {
            obj.insert("checksum".to_string(), Value::String(store_checksum));
        }

        for i in system_indices {
            let table = &self.tables[i];
            debug!("Save to backend {}: {}", backend.get_url(), table);
            table.save(&mut |name, data| backend.save_data(name, data))?;
        }

        let meta_index = self
            .position(TS_META_TABLENAME)
            .ok_or_else(|| Error::Table("The metadata table is missing.".to_string()))?;
        let meta = &self.tables[meta_index];
        debug!("Save to backend {}: {}", backend.get_url(), meta);
        meta.save(&mut |name, data| backend.save_data(name, data))?;

        backend.done_saving()
    }

    fn update_table_metadata(&mut self, table_name: &str, digest: &str) -> Result<()> {
        let meta_row = self.meta_row_mut()?;
        let tables = meta_row
            .get_mut("tables")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| Error::Table("Metadata row is missing its 'tables' list.".to_string()))?;

        let entry = tables
            .iter_mut()
            .find(|e| e.get("table_name").and_then(Value::as_str) == Some(table_name));
        let entry = match entry {
            Some(entry) => entry,
            None => {
                tables.push(json!({
                    "table_name": table_name,
                    "md5": "",
                    "last_modified": "",
                }));
                tables.last_mut().expect("just pushed")
            }
        };

        if entry.get("md5").and_then(Value::as_str) != Some(digest) {
            if let Some(obj) = entry.as_object_mut() {
                obj.insert("md5".to_string(), Value::String(digest.to_string()));
                obj.insert(
                    "last_modified".to_string(),
                    Value::String(canon::utc_now_iso()),
                );
            }
        }
        Ok(())
    }

    /// Initialize this store using data from `backend`.
    ///
    /// With `skip_definition` the current in-memory definition is used
    /// instead of the one stored in the backend.
    pub fn load_from_backend(
        &mut self,
        backend: &mut dyn Backend,
        skip_definition: bool,
    ) -> Result<()> {
        backend.start_loading()?;
        if !skip_definition {
            let data = backend.load_data(TS_DEF_FILENAME)?;
            let definition = String::from_utf8(data)
                .map_err(|e| Error::Backend(format!("Definition is not valid UTF-8: {}", e)))?;
            self.init_from_definition(&definition)?;
        }
        self.origin_label = backend.get_url();

        let table_names: Vec<String> =
            self.tables.iter().map(|t| t.name().to_string()).collect();
        for table_name in table_names {
            debug!("Load from backend {}: Table('{}')", backend.get_url(), table_name);
            self.load_table_rows(&table_name, backend)?;
        }

        backend.done_loading()
    }

    fn load_table_rows(&mut self, table_name: &str, backend: &mut dyn Backend) -> Result<()> {
        enum Plan {
            Single(String),
            Whole(String),
            RowPerFile(Vec<String>),
            Grouped(Vec<String>),
        }

        let plan = {
            let table = self.get_table(table_name)?;
            if table.is_single_row() {
                Plan::Single(table.get_filename(None, false)?)
            } else if let Some(group_fields) = table.group_by_fields() {
                let index_data = backend.load_data(&table.get_filename(None, true)?)?;
                let index: Vec<Value> = parse_json(&index_data, table_name)?;

                if group_fields == table.primary_key_fields() {
                    let mut files = Vec::with_capacity(index.len());
                    for pk in &index {
                        files.push(table.get_filename(Some(pk), false)?);
                    }
                    Plan::RowPerFile(files)
                } else {
                    // Several primary keys map to one group file; read each
                    // file once.
                    let mut seen = BTreeSet::new();
                    let mut files = Vec::new();
                    for pk in &index {
                        if seen.insert(table.canonical_key(pk, true)?) {
                            files.push(table.get_filename(Some(pk), false)?);
                        }
                    }
                    Plan::Grouped(files)
                }
            } else {
                Plan::Whole(table.get_filename(None, false)?)
            }
        };

        match plan {
            Plan::Single(file) => {
                let doc: Value = parse_json(&backend.load_data(&file)?, &file)?;
                self.insert_validated(table_name, doc)?;
            }
            Plan::Whole(file) => {
                let rows: Vec<Value> = parse_json(&backend.load_data(&file)?, &file)?;
                for row in rows {
                    self.insert_validated(table_name, row)?;
                }
            }
            Plan::RowPerFile(files) => {
                for file in files {
                    let row: Value = parse_json(&backend.load_data(&file)?, &file)?;
                    self.insert_validated(table_name, row)?;
                }
            }
            Plan::Grouped(files) => {
                for file in files {
                    let rows: Vec<Value> = parse_json(&backend.load_data(&file)?, &file)?;
                    for row in rows {
                        self.insert_validated(table_name, row)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Run the full constraint and schema integrity check by round-tripping
    /// the store through a scratch in-memory backend. Any violation
    /// surfaces as the corresponding constraint or schema error.
    pub fn check_integrity(&mut self) -> Result<()> {
        if integrity::current().is_none() {
            return Ok(());
        }

        let mut backend = MemoryBackend::scratch();
        self.save_to_backend_checked(&mut backend, false, false)?;
        // Loading back in runs every check on every row.
        TableStore::from_backend(&mut backend)?;
        Ok(())
    }

    /// Recompute table digests and the store checksum, returning the
    /// metadata documents from before and after. If anything changed, the
    /// version is bumped and `last_modified` updated; refreshing an
    /// unchanged store is a no-op on the second call.
    pub fn refresh_metadata(&mut self) -> Result<(Value, Value)> {
        let old = self.meta_row()?.clone();

        let mut backend = MemoryBackend::scratch();
        self.save_to_backend(&mut backend)?;

        if *self.meta_row()? != old {
            let now = canon::utc_now_iso();
            let row = self.meta_row_mut()?;
            let version = row.get("version").and_then(Value::as_i64).unwrap_or(0);
            if let Some(obj) = row.as_object_mut() {
                obj.insert("version".to_string(), Value::from(version + 1));
                obj.insert("last_modified".to_string(), Value::String(now));
            }
        }

        Ok((old, self.meta_row()?.clone()))
    }
}

/// Load a store from `backend` reading only the metadata table.
///
/// Used by the reconciliation protocol to compare checksums without
/// transferring every table.
pub fn load_meta_from_backend(backend: &mut dyn Backend) -> Result<TableStore> {
    let mut ts = TableStore::new();
    let file = ts.meta().get_filename(None, false)?;
    let doc: Value = parse_json(&backend.load_data(&file)?, &file)?;
    ts.insert_validated(TS_META_TABLENAME, doc)?;
    Ok(ts)
}

fn parse_json<T: serde::de::DeserializeOwned>(data: &[u8], file_name: &str) -> Result<T> {
    serde_json::from_slice(data)
        .map_err(|e| Error::Backend(format!("Error parsing json file '{}': {}", file_name, e)))
}
