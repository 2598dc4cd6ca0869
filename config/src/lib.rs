//! # Drift Config
//!
//! Distributed configuration store for a multi-tenant service platform.
//!
//! The relational core lives in the `relib` crate; this crate adds
//! everything that touches the outside world:
//!
//! - **Backends** for the filesystem, S3, redis and single-artifact
//!   archives, resolved from `scheme://` URLs through a registry.
//! - **Reconciliation** between the local working copy, the authoritative
//!   origin and the cache, mediated by the store checksums.
//! - **Transaction scopes** wrapping the pull/edit/push/write-back cycle.
//! - **Default store resolution** from `DRIFT_CONFIG_URL` or the local
//!   `~/.drift/config` directory.
//! - **Tenant lifecycle helpers** that walk the tenant/deployable
//!   relations and drive resource provisioning callbacks.
//!
//! ## Quick Start
//!
//! ```rust
//! use drift_config::{push_to_origin, PushReason};
//! use relib::TableStore;
//! use serde_json::json;
//!
//! // A store whose origin is an in-memory backend.
//! let mut ts = TableStore::new();
//! let domain = ts.add_single_row_table("domain").unwrap();
//! domain.add_default_values(json!({"domain_name": "", "origin": ""})).unwrap();
//! ts.add_row("domain", json!({
//!     "domain_name": "quickstart",
//!     "origin": "memory://quickstart-origin",
//! })).unwrap();
//!
//! let result = push_to_origin(&mut ts, false, None).unwrap();
//! assert_eq!(result.reason, PushReason::PushedToOrigin);
//!
//! // A second push is a no-op.
//! let result = push_to_origin(&mut ts, false, None).unwrap();
//! assert_eq!(result.reason, PushReason::PushSkippedCrcMatch);
//! ```

pub mod backends;
pub mod error;
pub mod reconcile;
pub mod resolve;
pub mod tenant;
pub mod transaction;

// Re-export main types at crate root
pub use backends::{
    create_backend, get_store_from_url, register_scheme, reset_schemes, FileBackend,
    RedisBackend, S3Backend, UrlParts, ZipBackend, ARCHIVE_FILENAME,
};
pub use error::{ConfigError, Result};
pub use reconcile::{
    get_cache_backend, get_origin_url, pull_from_origin, push_to_origin, update_cache,
    PullReason, PullResult, PushReason, PushResult,
};
pub use resolve::{
    clear_sticky_config, config_dir, get_default_config, get_default_config_and_source,
    get_domains, set_sticky_config, LocalDomain, CONFIG_URL_ENV,
};
pub use tenant::{
    define_tenant, get_config, get_config_from, prepare_tenant_name,
    provision_tenant_resources, refresh_tenants, ConfigContext, ConfigQuery,
    DeployableReport, NullProvisioner, ProvisionReport, ResourceProvisioner, TenantPrep,
};
pub use transaction::{reset_transaction_state, TsLocal, TsTransaction};
