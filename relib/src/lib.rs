//! # ReLib
//!
//! A lightweight relational store for JSON documents with deterministic,
//! content-addressed serialization.
//!
//! Operators author a hierarchical relational dataset; every service
//! instance pulls it at startup and refreshes it at runtime. This crate is
//! the storage engine underneath: schema-validated tables with primary
//! keys, unique constraints and foreign keys, plus a byte-stable
//! serialization format whose checksums drive the pull/push reconciliation
//! protocol in the `drift-config` crate.
//!
//! ## Design Principles
//!
//! - **Deterministic**: serializing the same logical store twice produces
//!   byte-identical output. Rows live in ordered maps and all JSON is
//!   written with sorted keys and fixed indentation.
//! - **No real IO**: the crate ships only the [`Backend`] trait and an
//!   in-memory implementation; filesystem, object store and cache backends
//!   plug in from the outside.
//! - **Arbitrary schemas**: tables, constraints and schemas are data, not
//!   code. The domain table set is defined by the caller.
//!
//! ## Core Concepts
//!
//! ### Tables and rows
//!
//! A [`Table`] maps canonical primary key strings to JSON rows. The
//! canonical key is built from the primary key field values and doubles as
//! a file name component. Tables declare constraints
//! ([`Constraint::PrimaryKey`], [`Constraint::Unique`],
//! [`Constraint::ForeignKey`]), an optional JSON-schema subset for row
//! validation, default values (with `@@utcnow` / `@@identity` sentinels)
//! and one of three serialization strategies: whole table, row per file,
//! or row groups keyed by a primary key prefix.
//!
//! ### The store
//!
//! A [`TableStore`] owns the tables and everything that crosses table
//! boundaries: row insertion (foreign keys need sibling lookups),
//! reference walks, the definition document (`#tsdef.json`) and the
//! metadata table (`#tsmeta`) carrying per-table digests and the store
//! checksum. The metadata table is always the last thing written, so a
//! complete metadata file implies a complete store.
//!
//! ## Quick Start
//!
//! ```rust
//! use relib::{MemoryBackend, TableStore};
//! use serde_json::json;
//!
//! let mut ts = TableStore::new();
//! let tiers = ts.add_table("tiers").unwrap();
//! tiers.add_primary_key(&["tier_name"]).unwrap();
//! ts.add_row("tiers", json!({"tier_name": "LIVENORTH", "is_live": true})).unwrap();
//!
//! let mut backend = MemoryBackend::scratch();
//! ts.save_to_backend(&mut backend).unwrap();
//!
//! let check = TableStore::from_backend(&mut backend).unwrap();
//! assert_eq!(check.checksum().unwrap(), ts.checksum().unwrap());
//! ```

pub mod backend;
pub mod canon;
pub mod diff;
pub mod error;
pub mod integrity;
pub mod schema;
pub mod store;
pub mod table;

// Re-export main types at crate root
pub use backend::{Backend, MemoryBackend};
pub use diff::{copy_table_store, diff_meta, diff_tables, MetaDiff, RowChange, TableDiff};
pub use error::{Error, Result};
pub use integrity::IntegrityChecks;
pub use schema::check_schema;
pub use store::{
    load_meta_from_backend, StoreDefinition, TableStore, TS_DEF_FILENAME, TS_META_TABLENAME,
};
pub use table::{Constraint, Table, TableDefinition, DEFAULT_IDENTITY, DEFAULT_UTCNOW};
