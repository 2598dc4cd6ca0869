//! Shared test fixture: a pre-populated config domain.
//!
//! Builds the conventional table set (domain, organizations, tiers,
//! deployables, products, tenants) the way an operator's schema module
//! would, then fills it with one of everything.

// Each test binary uses a different slice of the fixture.
#![allow(dead_code)]

use relib::TableStore;
use serde_json::json;

pub const DOMAIN_NAME: &str = "testdomain";
pub const ORG_NAME: &str = "acme";
pub const TIER_NAME: &str = "TIER";
pub const DEPL_NAME: &str = "svc";
pub const PROD_NAME: &str = "acme-prod";
pub const TENANT_NAME: &str = "acme-prod-test";
pub const RESOURCE_NAME: &str = "drift.core.resources.postgres";

/// Define the core table set on an empty store.
pub fn core_table_store() -> TableStore {
    let mut ts = TableStore::new();

    let domain = ts.add_single_row_table("domain").unwrap();
    domain.add_schema(json!({
        "type": "object",
        "properties": {
            "domain_name": {"type": "string"},
            "display_name": {"type": "string"},
            "origin": {"type": "string"},
        },
        "required": ["domain_name", "origin"],
    }));
    domain
        .add_default_values(json!({"domain_name": "", "origin": ""}))
        .unwrap();

    let organizations = ts.add_table("organizations").unwrap();
    organizations.add_primary_key(&["organization_name"]).unwrap();
    organizations.add_unique_constraint(&["short_name"]).unwrap();
    organizations
        .add_default_values(json!({"state": "active"}))
        .unwrap();

    let tiers = ts.add_table("tiers").unwrap();
    tiers.add_primary_key(&["tier_name"]).unwrap();
    tiers.add_schema(json!({
        "type": "object",
        "properties": {
            "tier_name": {"pattern": "^([A-Z]){3,20}$"},
            "is_live": {"type": "boolean"},
            "state": {"enum": ["initializing", "active", "disabled", "deleted"]},
        },
        "required": ["is_live"],
    }));
    tiers
        .add_default_values(json!({"is_live": true, "state": "active"}))
        .unwrap();

    let deployable_names = ts.add_table("deployable-names").unwrap();
    deployable_names.add_primary_key(&["deployable_name"]).unwrap();
    deployable_names
        .add_default_values(json!({"resources": [], "resource_attributes": {}}))
        .unwrap();

    let deployables = ts.add_table("deployables").unwrap();
    deployables
        .add_primary_key(&["tier_name", "deployable_name"])
        .unwrap();
    deployables
        .add_default_values(json!({"is_active": true}))
        .unwrap();
    ts.add_foreign_key("deployables", &["tier_name"], "tiers", None)
        .unwrap();
    ts.add_foreign_key("deployables", &["deployable_name"], "deployable-names", None)
        .unwrap();

    let products = ts.add_table("products").unwrap();
    products.add_primary_key(&["product_name"]).unwrap();
    products
        .add_default_values(json!({"state": "active", "deployables": []}))
        .unwrap();
    ts.add_foreign_key("products", &["organization_name"], "organizations", None)
        .unwrap();

    let tenant_names = ts.add_table("tenant-names").unwrap();
    tenant_names.add_primary_key(&["tenant_name"]).unwrap();
    ts.add_foreign_key("tenant-names", &["product_name"], "products", None)
        .unwrap();
    ts.add_foreign_key("tenant-names", &["organization_name"], "organizations", None)
        .unwrap();
    ts.add_foreign_key("tenant-names", &["tier_name"], "tiers", None)
        .unwrap();

    let tenants = ts.add_table("tenants").unwrap();
    tenants
        .add_primary_key(&["tier_name", "deployable_name", "tenant_name"])
        .unwrap();
    tenants
        .set_row_as_file(Some("tenants"), Some(&["tier_name", "tenant_name"]))
        .unwrap();
    tenants.add_schema(json!({
        "type": "object",
        "properties": {
            "state": {"enum": [
                "initializing", "active", "disabled", "uninitializing", "deleted"
            ]},
        },
    }));
    tenants
        .add_default_values(json!({"state": "initializing"}))
        .unwrap();
    ts.add_foreign_key("tenants", &["tier_name"], "tiers", None)
        .unwrap();
    ts.add_foreign_key("tenants", &["deployable_name"], "deployable-names", None)
        .unwrap();
    ts.add_foreign_key("tenants", &["tenant_name"], "tenant-names", None)
        .unwrap();

    ts
}

/// A populated domain: one tier, one deployable, one organization with one
/// product, and a tenant defined for it.
pub fn create_test_domain(origin: &str) -> TableStore {
    let mut ts = core_table_store();

    ts.add_row(
        "domain",
        json!({
            "domain_name": DOMAIN_NAME,
            "display_name": "Unit Test Domain",
            "origin": origin,
        }),
    )
    .unwrap();

    ts.add_row(
        "tiers",
        json!({
            "tier_name": TIER_NAME,
            "resources": {
                RESOURCE_NAME: {"host": "localhost", "port": 5432},
            },
        }),
    )
    .unwrap();

    ts.add_row(
        "deployable-names",
        json!({
            "deployable_name": DEPL_NAME,
            "display_name": "Test Service",
            "resources": [RESOURCE_NAME],
            "resource_attributes": {
                RESOURCE_NAME: {"database": "svc_db"},
            },
        }),
    )
    .unwrap();
    ts.add_row(
        "deployables",
        json!({"tier_name": TIER_NAME, "deployable_name": DEPL_NAME}),
    )
    .unwrap();

    ts.add_row(
        "organizations",
        json!({
            "organization_name": ORG_NAME,
            "short_name": ORG_NAME,
            "display_name": "Some Test Organization",
        }),
    )
    .unwrap();
    ts.add_row(
        "products",
        json!({
            "product_name": PROD_NAME,
            "organization_name": ORG_NAME,
            "deployables": [DEPL_NAME],
        }),
    )
    .unwrap();

    drift_config::define_tenant(&mut ts, TENANT_NAME, PROD_NAME, TIER_NAME).unwrap();

    ts
}
