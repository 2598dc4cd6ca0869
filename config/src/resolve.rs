//! Default store resolution.
//!
//! "The current store" is resolved from, in order: a sticky override set
//! by tests, the `DRIFT_CONFIG_URL` environment variable (a full URL or a
//! short domain name), or the single domain found in the local config
//! directory. Anything else is `ConfigNotFound`.

use crate::backends::{create_backend, file::list_config_folders, get_store_from_url};
use crate::error::{ConfigError, Result};
use once_cell::sync::Lazy;
use relib::TableStore;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Environment variable naming the config source: either a full backend
/// URL or a short domain name resolvable against the local directory.
pub const CONFIG_URL_ENV: &str = "DRIFT_CONFIG_URL";

static STICKY: Lazy<Mutex<Option<TableStore>>> = Lazy::new(|| Mutex::new(None));

fn sticky() -> std::sync::MutexGuard<'static, Option<TableStore>> {
    match STICKY.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Permanently assign `ts` as the one and only config. Useful for tests.
pub fn set_sticky_config(ts: TableStore) {
    *sticky() = Some(ts);
}

/// Drop the sticky config again. Test isolation hook.
pub fn clear_sticky_config() {
    *sticky() = None;
}

/// Path to the local config dir for `config_name`.
///
/// Each subfolder of the config root is a complete file-scheme store.
pub fn config_dir(config_name: &str) -> PathBuf {
    let root = if cfg!(windows) {
        let program_data =
            std::env::var("ProgramData").unwrap_or_else(|_| "C:/ProgramData".to_string());
        PathBuf::from(program_data).join("drift").join("config")
    } else {
        PathBuf::from(shellexpand::tilde("~/.drift/config").into_owned())
    };
    if config_name.is_empty() {
        root
    } else {
        root.join(config_name)
    }
}

/// A config domain found on local disk.
#[derive(Debug, Clone)]
pub struct LocalDomain {
    pub path: PathBuf,
    pub table_store: TableStore,
}

/// All config domains stored on local disk, keyed by domain name.
///
/// With `skip_errors`, folders that are not valid stores are skipped with
/// a warning instead of failing the whole scan.
pub fn get_domains(skip_errors: bool) -> Result<BTreeMap<String, LocalDomain>> {
    get_domains_in(&config_dir(""), skip_errors)
}

fn get_domains_in(folder: &Path, skip_errors: bool) -> Result<BTreeMap<String, LocalDomain>> {
    let mut domains = BTreeMap::new();

    for path in list_config_folders(folder) {
        let url = format!("file://{}", path.to_string_lossy().replace('\\', "/"));
        let ts = match get_store_from_url(&url) {
            Ok(ts) => ts,
            Err(e) if skip_errors => {
                warn!(
                    "Note: '{}' is not a config folder or is corrupt. ({})",
                    path.display(),
                    e
                );
                continue;
            }
            Err(e) => return Err(e),
        };

        let domain_name = ts
            .get_table("domain")?
            .single_field("domain_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        domains.insert(
            domain_name,
            LocalDomain {
                path,
                table_store: ts,
            },
        );
    }

    Ok(domains)
}

/// Resolve the default config as a table store.
pub fn get_default_config() -> Result<TableStore> {
    get_default_config_and_source().map(|(ts, _)| ts)
}

/// Resolve the default config, returning the store and the URL it was
/// loaded from.
pub fn get_default_config_and_source() -> Result<(TableStore, String)> {
    if let Some(ts) = sticky().as_ref() {
        return Ok((ts.clone(), "memory://sticky".to_string()));
    }

    if let Ok(url) = std::env::var(CONFIG_URL_ENV) {
        // Enable domain shorthand.
        if !url.contains("://") {
            let domains = get_domains(true)?;
            let names: Vec<&str> = domains.keys().map(String::as_str).collect();
            let domain = domains.get(&url).ok_or_else(|| {
                ConfigError::ConfigNotFound(format!(
                    "No domain named '{}' found on local disk. Available domains: {}.",
                    url,
                    names.join(", ")
                ))
            })?;
            let source = format!(
                "file://{}",
                domain.path.to_string_lossy().replace('\\', "/")
            );
            return Ok((domain.table_store.clone(), source));
        }

        let mut backend = create_backend(&url)?;
        return Ok((backend.load_table_store()?, url));
    }

    let domains = get_domains(true)?;
    match domains.len() {
        0 => Err(ConfigError::ConfigNotFound(format!(
            "No config found in {}. Initialize a local config or point the '{}' \
             environment variable at one.",
            config_dir("").display(),
            CONFIG_URL_ENV
        ))),
        1 => {
            let domain = domains.into_values().next().expect("len checked");
            let source = format!(
                "file://{}",
                domain.path.to_string_lossy().replace('\\', "/")
            );
            Ok((domain.table_store, source))
        }
        _ => {
            let names: Vec<String> = domains.keys().cloned().collect();
            Err(ConfigError::ConfigNotFound(format!(
                "Multiple configurations found in {}. Specify which one to use in the \
                 '{}' environment variable. Configurations available: {}.",
                config_dir("").display(),
                CONFIG_URL_ENV,
                names.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn domain_store(name: &str) -> TableStore {
        let mut ts = TableStore::new();
        let domain = ts.add_single_row_table("domain").unwrap();
        domain
            .add_default_values(json!({"domain_name": "", "origin": ""}))
            .unwrap();
        ts.add_row("domain", json!({"domain_name": name, "origin": "memory://unused"}))
            .unwrap();
        ts
    }

    #[test]
    fn sticky_config_wins() {
        set_sticky_config(domain_store("sticky-domain"));
        let (ts, source) = get_default_config_and_source().unwrap();
        clear_sticky_config();

        assert_eq!(source, "memory://sticky");
        assert_eq!(
            ts.get_table("domain").unwrap().single_field("domain_name"),
            Some(&json!("sticky-domain"))
        );
    }

    #[test]
    fn scans_local_domains() {
        let root = tempfile::tempdir().unwrap();

        // Two valid domains and one corrupt folder.
        for name in ["alpha", "beta"] {
            let mut ts = domain_store(name);
            let folder = root.path().join(name);
            let mut backend =
                crate::backends::FileBackend::new(folder.to_str().unwrap()).unwrap();
            ts.save_to_backend(&mut backend).unwrap();
        }
        std::fs::create_dir(root.path().join("not-a-config")).unwrap();

        let domains = get_domains_in(root.path(), true).unwrap();
        assert_eq!(domains.len(), 2);
        assert!(domains.contains_key("alpha"));
        assert!(domains.contains_key("beta"));

        let err = get_domains_in(root.path(), false).unwrap_err();
        assert!(matches!(err, ConfigError::Relib(_)));
    }

    #[test]
    fn config_dir_layout() {
        let path = config_dir("dgnorth");
        assert!(path.to_string_lossy().ends_with("dgnorth"));
        assert!(path.to_string_lossy().contains("drift"));
    }
}
