//! Tenant lifecycle helpers.
//!
//! These walk the conventional tenant/deployable relations (`domain`,
//! `organizations`, `tiers`, `deployable-names`, `deployables`,
//! `products`, `tenant-names`, `tenants`), drive tenant state transitions
//! and invoke resource provisioning callbacks. The table schemas
//! themselves are supplied by the caller; the helpers only rely on the
//! table names and the foreign keys between them.

use crate::error::{ConfigError, Result};
use crate::resolve::get_default_config_and_source;
use relib::{canon, TableStore};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::info;

/// Tenant resources transition through these states.
pub mod state {
    /// Resources are being provisioned.
    pub const INITIALIZING: &str = "initializing";
    /// Resources are online and accessible.
    pub const ACTIVE: &str = "active";
    /// Resources are offline and not accessible.
    pub const DISABLED: &str = "disabled";
    /// Resources are being unprovisioned.
    pub const UNINITIALIZING: &str = "uninitializing";
    /// Resources have been deleted.
    pub const DELETED: &str = "deleted";
}

/// Callback seam for resource provisioning plugins.
///
/// `define_tenant` seeds resource attributes into the tenant rows; a
/// provisioner turns those attributes into actual resources (databases,
/// caches, buckets) when `provision_tenant_resources` runs.
pub trait ResourceProvisioner {
    /// Verify that the named resource module is usable at all. Runs for
    /// every resource before any provisioning happens, so a broken module
    /// aborts the batch up front.
    fn precheck(&mut self, resource_name: &str) -> std::result::Result<(), String> {
        let _ = resource_name;
        Ok(())
    }

    /// Provision one resource for one tenant/deployable pair. `attributes`
    /// holds the seeded configuration and may be updated with
    /// provisioning results (connection info and the like). The returned
    /// value goes into the report verbatim.
    fn provision(
        &mut self,
        resource_name: &str,
        tenant_config: &Value,
        attributes: &mut Value,
    ) -> std::result::Result<Value, String>;
}

/// A provisioner that provisions nothing; used for previews and tests.
#[derive(Debug, Default)]
pub struct NullProvisioner;

impl ResourceProvisioner for NullProvisioner {
    fn provision(
        &mut self,
        _resource_name: &str,
        _tenant_config: &Value,
        attributes: &mut Value,
    ) -> std::result::Result<Value, String> {
        Ok(attributes.clone())
    }
}

/// Result of preparing a tenant name: the qualified name plus the product
/// and organization rows it resolves through.
#[derive(Debug, Clone)]
pub struct TenantPrep {
    pub tenant_name: String,
    pub product: Value,
    pub organization: Value,
    /// The `tenant-names` master row; set by `define_tenant`.
    pub tenant_master_row: Option<Value>,
    /// Per-deployable state after a define/refresh, in table order.
    pub report: Vec<Value>,
}

/// Prepare a tenant name by prefixing it with the organization short name.
///
/// The value of `tenant_name` may already carry the prefix; a mismatched
/// prefix is rejected.
pub fn prepare_tenant_name(
    ts: &TableStore,
    tenant_name: &str,
    product_name: &str,
) -> Result<TenantPrep> {
    let products = ts.get_table("products")?;
    let product = products
        .get(&json!({"product_name": product_name}))?
        .ok_or_else(|| {
            ConfigError::ConfigNotFound(format!("Product '{}' not found.", product_name))
        })?;

    let organization = ts
        .get_foreign_row("products", product, "organizations", None)?
        .ok_or_else(|| {
            ConfigError::ConfigNotFound(format!(
                "Organization of product '{}' not found.",
                product_name
            ))
        })?;

    let short_name = organization
        .get("short_name")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let tenant_name = match tenant_name.split_once('-') {
        Some((prefix, _)) if prefix == short_name => tenant_name.to_string(),
        Some((prefix, _)) => {
            return Err(ConfigError::ConfigNotFound(format!(
                "Tenant name '{}' must be prefixed with '{}', not '{}'.",
                tenant_name, short_name, prefix
            )))
        }
        None => format!("{}-{}", short_name, tenant_name),
    };

    Ok(TenantPrep {
        tenant_name,
        product: product.clone(),
        organization: organization.clone(),
        tenant_master_row: None,
        report: Vec::new(),
    })
}

/// Define a new tenant or refresh a current one.
///
/// Creates the `tenant-names` master row if needed, then reconciles the
/// per-deployable `tenants` rows against the product's deployable list:
/// new deployables get a row in state `initializing`, inactive ones are
/// `disabled`, removed ones go to `uninitializing` so their resources get
/// unprovisioned. Tier and deployable resource attribute defaults are
/// folded into each tenant row, leaving values already present intact.
pub fn define_tenant(
    ts: &mut TableStore,
    tenant_name: &str,
    product_name: &str,
    tier_name: &str,
) -> Result<TenantPrep> {
    let mut prep = prepare_tenant_name(ts, tenant_name, product_name)?;
    let tenant_name = prep.tenant_name.clone();

    // Add the master row if needed.
    let master_key = json!({"tenant_name": tenant_name});
    let existing = ts.get_table("tenant-names")?.get(&master_key)?.cloned();
    let master_row = match existing {
        Some(row) => row,
        None => ts.add_row(
            "tenant-names",
            json!({
                "tenant_name": tenant_name,
                "organization_name": prep.organization["organization_name"],
                "product_name": product_name,
                "tier_name": tier_name,
                "reserved_at": canon::utc_now_iso(),
                "reserved_by": current_user(),
            }),
        )?,
    };
    prep.tenant_master_row = Some(master_row);

    // Split the product's deployables by their per-tier active flag.
    let mut active_deployables = Vec::new();
    let mut inactive_deployables = Vec::new();
    let product_deployables: Vec<String> = prep
        .product
        .get("deployables")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    for deployable_name in &product_deployables {
        let key = json!({"tier_name": tier_name, "deployable_name": deployable_name});
        let deployable = ts.get_table("deployables")?.get(&key)?.ok_or_else(|| {
            ConfigError::ConfigNotFound(format!(
                "Deployable '{}' defined for product '{}' is not found in table 'deployables' for tier {}.",
                deployable_name, product_name, tier_name
            ))
        })?;
        if deployable.get("is_active") == Some(&Value::Bool(true)) {
            active_deployables.push(deployable_name.clone());
        } else {
            inactive_deployables.push(deployable_name.clone());
        }
    }

    let mut report: Vec<Value> = Vec::new();

    // Deactivate or retire deployables no longer carried by the product.
    let current: Vec<Value> = ts
        .get_table("tenants")?
        .find(Some(&json!({"tier_name": tier_name, "tenant_name": tenant_name})))
        .into_iter()
        .cloned()
        .collect();
    for tenant in current {
        let deployable_name = tenant
            .get("deployable_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tenant_state = tenant.get("state").and_then(Value::as_str).unwrap_or_default();

        let new_state = if inactive_deployables.contains(&deployable_name) {
            Some(state::DISABLED)
        } else if !active_deployables.contains(&deployable_name) && tenant_state != state::DELETED {
            // Signal de-provisioning of resources.
            Some(state::UNINITIALIZING)
        } else {
            None
        };

        if let Some(new_state) = new_state {
            if let Some(row) = ts.get_table_mut("tenants")?.get_mut(&tenant)? {
                row["state"] = json!(new_state);
            }
            report.push(json!({"deployable_name": deployable_name, "state": new_state}));
        }
    }

    // Activate or refresh the deployables that carry the product.
    for deployable_name in &active_deployables {
        let key = json!({
            "tier_name": tier_name,
            "deployable_name": deployable_name,
            "tenant_name": tenant_name,
        });
        let tenant_state = match ts.get_table("tenants")?.get(&key)? {
            Some(row) => row
                .get("state")
                .and_then(Value::as_str)
                .unwrap_or(state::INITIALIZING)
                .to_string(),
            None => {
                // Default state signals provisioning of resources.
                ts.add_row("tenants", key.clone())?;
                state::INITIALIZING.to_string()
            }
        };

        let resources =
            seed_resource_attributes(ts, tier_name, deployable_name, &key)?;
        report.push(json!({
            "deployable_name": deployable_name,
            "state": tenant_state,
            "resources": resources,
        }));
    }

    prep.report = report;
    Ok(prep)
}

/// Fold tier and deployable resource attribute defaults into the tenant
/// row, keeping anything already configured. Returns the resulting
/// attribute map per resource module.
fn seed_resource_attributes(
    ts: &mut TableStore,
    tier_name: &str,
    deployable_name: &str,
    tenant_key: &Value,
) -> Result<Map<String, Value>> {
    let registration = ts
        .get_table("deployable-names")?
        .get(&json!({"deployable_name": deployable_name}))?
        .cloned()
        .ok_or_else(|| {
            ConfigError::ConfigNotFound(format!(
                "Deployable '{}' is not registered in 'deployable-names'.",
                deployable_name
            ))
        })?;
    let tier = ts
        .get_table("tiers")?
        .get(&json!({"tier_name": tier_name}))?
        .cloned()
        .ok_or_else(|| ConfigError::ConfigNotFound(format!("Tier '{}' not found.", tier_name)))?;

    let resource_names: Vec<String> = registration
        .get("resources")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut seeded = Map::new();
    for resource_name in &resource_names {
        let attribute_key = resource_attribute_key(resource_name);

        let tenant_row = ts
            .get_table_mut("tenants")?
            .get_mut(tenant_key)?
            .ok_or_else(|| {
                ConfigError::TenantNotConfigured(format!(
                    "Tenant row {} vanished during refresh.",
                    tenant_key
                ))
            })?;
        let attributes = tenant_row
            .as_object_mut()
            .and_then(|obj| {
                if !obj.contains_key(attribute_key) {
                    obj.insert(attribute_key.to_string(), json!({}));
                }
                obj.get_mut(attribute_key)
            })
            .and_then(Value::as_object_mut)
            .ok_or_else(|| {
                ConfigError::TenantNotConfigured(format!(
                    "Resource attributes of tenant row {} are not an object.",
                    tenant_key
                ))
            })?;

        // Tier defaults first, then deployable defaults; existing values
        // always win.
        if let Some(defaults) = tier
            .get("resources")
            .and_then(|r| r.get(resource_name))
            .and_then(Value::as_object)
        {
            for (key, value) in defaults {
                attributes.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        if let Some(defaults) = registration
            .get("resource_attributes")
            .and_then(|r| r.get(resource_name))
            .and_then(Value::as_object)
        {
            for (key, value) in defaults {
                attributes.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        seeded.insert(resource_name.clone(), Value::Object(attributes.clone()));
    }

    Ok(seeded)
}

/// Legacy attribute key: the last dotted segment of the module name.
fn resource_attribute_key(resource_name: &str) -> &str {
    resource_name.rsplit('.').next().unwrap_or(resource_name)
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Refresh config info for tenants by re-running `define_tenant`.
///
/// With `tenant_name` only that tenant is refreshed; with `tier_name`
/// only tenants on that tier.
pub fn refresh_tenants(
    ts: &mut TableStore,
    tenant_name: Option<&str>,
    tier_name: Option<&str>,
) -> Result<Vec<TenantPrep>> {
    let mut combos: Vec<(String, String)> = Vec::new();
    for row in ts.get_table("tenants")?.find(None) {
        let tenant = row.get("tenant_name").and_then(Value::as_str).unwrap_or_default();
        let tier = row.get("tier_name").and_then(Value::as_str).unwrap_or_default();
        if tenant_name.is_some_and(|t| t != tenant) {
            continue;
        }
        if tier_name.is_some_and(|t| t != tier) {
            continue;
        }
        let combo = (tenant.to_string(), tier.to_string());
        if !combos.contains(&combo) {
            combos.push(combo);
        }
    }

    let mut results = Vec::with_capacity(combos.len());
    for (tenant, tier) in combos {
        let product_name = ts
            .get_table("tenant-names")?
            .get(&json!({"tenant_name": tenant}))?
            .and_then(|row| row.get("product_name"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ConfigError::TenantNotConfigured(format!(
                    "Tenant '{}' has no master row in 'tenant-names'.",
                    tenant
                ))
            })?
            .to_string();
        results.push(define_tenant(ts, &tenant, &product_name, &tier)?);
    }
    Ok(results)
}

/// Report of a provisioning run.
#[derive(Debug, Clone, Default)]
pub struct ProvisionReport {
    pub tenant: Value,
    pub deployables: BTreeMap<String, DeployableReport>,
}

/// Per-deployable provisioning outcome.
#[derive(Debug, Clone, Default)]
pub struct DeployableReport {
    pub resources: BTreeMap<String, Value>,
    pub error: Option<String>,
    pub old_state: String,
    pub new_state: String,
}

/// Call resource provisioning callbacks for tenant `tenant_name`.
///
/// If `deployable_name` is set, only that deployable's rows are
/// processed. With `preview` the callbacks are skipped and the report
/// shows the attributes that would be used. State advances
/// `initializing` to `active` and `uninitializing` to `deleted`; a tenant
/// with termination protection refuses to uninitialize.
pub fn provision_tenant_resources(
    ts: &mut TableStore,
    provisioner: &mut dyn ResourceProvisioner,
    tenant_name: &str,
    deployable_name: Option<&str>,
    preview: bool,
) -> Result<ProvisionReport> {
    let tenant_info = ts
        .get_table("tenant-names")?
        .get(&json!({"tenant_name": tenant_name}))?
        .cloned()
        .ok_or_else(|| ConfigError::TenantNotConfigured(format!("Tenant '{}' not found.", tenant_name)))?;
    let termination_protection = tenant_info
        .get("termination_protection")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut criteria = json!({
        "tenant_name": tenant_name,
        "tier_name": tenant_info["tier_name"],
    });
    if let Some(deployable_name) = deployable_name {
        criteria["deployable_name"] = json!(deployable_name);
    }
    let configurations: Vec<Value> = ts
        .get_table("tenants")?
        .find(Some(&criteria))
        .into_iter()
        .cloned()
        .collect();

    let mut report = ProvisionReport {
        tenant: tenant_info,
        deployables: BTreeMap::new(),
    };

    info!("Provisioning tenant '{}'", tenant_name);

    for tenant_config in configurations {
        let deployable = tenant_config
            .get("deployable_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let old_state = tenant_config
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut depl_report = DeployableReport {
            old_state: old_state.clone(),
            new_state: old_state.clone(),
            ..DeployableReport::default()
        };

        info!("  Deployable: '{}'", deployable);

        // Termination protection is tenant-wide; stop the individual
        // deployable from uninitializing.
        if old_state == state::UNINITIALIZING && termination_protection {
            depl_report.error =
                Some("Tenant has termination protection. Can't uninitialize.".to_string());
            report.deployables.insert(deployable, depl_report);
            continue;
        }

        let registration = ts
            .get_table("deployable-names")?
            .get(&json!({"deployable_name": deployable}))?
            .cloned()
            .unwrap_or_else(|| json!({}));
        let resource_names: Vec<String> = registration
            .get("resources")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        // First pass just verifies the resource modules resolve.
        let mut precheck_failed = false;
        for resource_name in &resource_names {
            if let Err(message) = provisioner.precheck(resource_name) {
                depl_report.resources.insert(
                    resource_name.clone(),
                    json!(format!("Failed to load resource '{}': {}", resource_name, message)),
                );
                precheck_failed = true;
            }
        }

        if !precheck_failed {
            for resource_name in &resource_names {
                let attribute_key = resource_attribute_key(resource_name);
                let mut attributes = tenant_config
                    .get(attribute_key)
                    .cloned()
                    .unwrap_or_else(|| json!({}));

                if preview {
                    depl_report
                        .resources
                        .insert(resource_name.clone(), attributes);
                    continue;
                }

                info!("  -> {}", resource_name);
                match provisioner.provision(resource_name, &tenant_config, &mut attributes) {
                    Ok(result) => {
                        depl_report.resources.insert(resource_name.clone(), result);
                        // Write updated attributes back into the tenant row.
                        if let Some(row) = ts.get_table_mut("tenants")?.get_mut(&tenant_config)? {
                            row[attribute_key] = attributes;
                        }
                    }
                    Err(message) => {
                        depl_report.resources.insert(
                            resource_name.clone(),
                            json!(format!(
                                "Failed to provision resource '{}': {}",
                                resource_name, message
                            )),
                        );
                    }
                }
            }
        }

        let new_state = match old_state.as_str() {
            state::INITIALIZING if !preview && !precheck_failed => state::ACTIVE,
            state::UNINITIALIZING if !preview && !precheck_failed => state::DELETED,
            other => other,
        }
        .to_string();

        if new_state != old_state {
            if let Some(row) = ts.get_table_mut("tenants")?.get_mut(&tenant_config)? {
                row["state"] = json!(new_state);
            }
        }
        depl_report.new_state = new_state;
        report.deployables.insert(deployable, depl_report);
    }

    Ok(report)
}

/// Which slice of the config a service instance asks for.
#[derive(Debug, Clone, Default)]
pub struct ConfigQuery {
    pub tenant_name: Option<String>,
    pub tier_name: Option<String>,
    pub deployable_name: Option<String>,
    pub allow_missing_tenant: bool,
}

/// The resolved config context for one service instance: the rows it
/// needs, walked out through the foreign keys.
#[derive(Debug, Clone)]
pub struct ConfigContext {
    pub table_store: TableStore,
    pub source: String,
    pub domain: Value,
    pub tenant: Option<Value>,
    pub tenant_name: Option<String>,
    pub tier: Option<Value>,
    pub deployable: Option<Value>,
    pub product: Option<Value>,
    pub organization: Option<Value>,
    /// Active tenant rows for the tier/deployable pair.
    pub tenants: Vec<Value>,
}

/// Resolve the config context for the given query against the default
/// store.
pub fn get_config(query: &ConfigQuery) -> Result<ConfigContext> {
    let (ts, source) = get_default_config_and_source()?;
    get_config_from(ts, source, query)
}

/// Resolve the config context for the given query against `ts`.
pub fn get_config_from(
    ts: TableStore,
    source: String,
    query: &ConfigQuery,
) -> Result<ConfigContext> {
    // Map a tenant alias to the actual tenant name if needed.
    let mut tenant_name = query.tenant_name.clone();
    if let Some(alias) = &query.tenant_name {
        let found = ts
            .get_table("tenant-names")?
            .find(Some(&json!({"alias": alias})));
        if let Some(row) = found.first() {
            tenant_name = row
                .get("tenant_name")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
    }

    let tenants_table = ts.get_table("tenants")?;
    let tenant = match &tenant_name {
        Some(name) => {
            let key = json!({
                "tier_name": query.tier_name,
                "deployable_name": query.deployable_name,
                "tenant_name": name,
            });
            let row = tenants_table.get(&key).ok().flatten().cloned();
            if row.is_none() && !query.allow_missing_tenant {
                return Err(ConfigError::TenantNotConfigured(format!(
                    "Tenant '{}' not found for tier '{}' and deployable '{}'.",
                    name,
                    query.tier_name.as_deref().unwrap_or(""),
                    query.deployable_name.as_deref().unwrap_or("")
                )));
            }
            row
        }
        None => None,
    };

    let (product, organization) = match &tenant {
        Some(tenant_row) => {
            let master = ts
                .get_foreign_row("tenants", tenant_row, "tenant-names", None)?
                .cloned();
            let product = match &master {
                Some(master_row) => ts
                    .get_foreign_row("tenant-names", master_row, "products", None)?
                    .cloned(),
                None => None,
            };
            let organization = match &product {
                Some(product_row) => ts
                    .get_foreign_row("products", product_row, "organizations", None)?
                    .cloned(),
                None => None,
            };
            (product, organization)
        }
        None => (None, None),
    };

    let tier = match &query.tier_name {
        Some(tier_name) => {
            let row = ts
                .get_table("tiers")?
                .get(&json!({"tier_name": tier_name}))?
                .cloned();
            if row.is_none() {
                return Err(ConfigError::ConfigNotFound(format!(
                    "Tier '{}' not found in config.",
                    tier_name
                )));
            }
            row
        }
        None => None,
    };

    let deployable = match (&query.tier_name, &query.deployable_name) {
        (Some(tier_name), Some(deployable_name)) => ts
            .get_table("deployables")?
            .get(&json!({"tier_name": tier_name, "deployable_name": deployable_name}))?
            .cloned(),
        _ => None,
    };

    let tenants = match (&query.tier_name, &query.deployable_name) {
        (Some(tier_name), Some(deployable_name)) => ts
            .get_table("tenants")?
            .find(Some(&json!({
                "tier_name": tier_name,
                "deployable_name": deployable_name,
                "state": state::ACTIVE,
            })))
            .into_iter()
            .cloned()
            .collect(),
        _ => Vec::new(),
    };

    let domain = ts
        .get_table("domain")?
        .get_single()
        .cloned()
        .unwrap_or_else(|| json!({}));

    Ok(ConfigContext {
        table_store: ts,
        source,
        domain,
        tenant,
        tenant_name,
        tier,
        deployable,
        product,
        organization,
        tenants,
    })
}
