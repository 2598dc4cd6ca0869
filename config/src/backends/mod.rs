//! Concrete backends and the URL registry.
//!
//! A backend is addressed by a URL whose scheme selects the
//! implementation: `file`, `s3`, `memory` and `redis` are built in, and a
//! `+zip` scheme suffix (e.g. `file+zip://...`) wraps the addressed
//! backend in the single-artifact archive codec. Additional schemes can be
//! registered at runtime.

pub mod archive;
pub mod file;
pub mod redis;
pub mod s3;

pub use archive::{ZipBackend, ARCHIVE_FILENAME};
pub use file::FileBackend;
pub use redis::RedisBackend;
pub use s3::S3Backend;

use crate::error::{ConfigError, Result};
use once_cell::sync::Lazy;
use relib::{Backend, MemoryBackend, TableStore};
use std::collections::HashMap;
use std::sync::RwLock;

/// A parsed backend URL: `scheme://[host][/path][?key=value&...]`.
///
/// These are storage addresses rather than web URLs (hosts like `~` are
/// legal for the file scheme), so the grammar is parsed directly.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UrlParts {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub query: HashMap<String, String>,
}

impl UrlParts {
    /// Parse `url` into its parts.
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |message: &str| ConfigError::InvalidUrl {
            url: url.to_string(),
            message: message.to_string(),
        };

        let (scheme, rest) = url.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty() {
            return Err(invalid("missing scheme"));
        }

        let (body, query_text) = match rest.split_once('?') {
            Some((body, query)) => (body, Some(query)),
            None => (rest, None),
        };

        let (authority, path) = match body.find('/') {
            Some(i) => (&body[..i], &body[i..]),
            None => (body, ""),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_text)) => {
                let port = port_text
                    .parse::<u16>()
                    .map_err(|_| invalid("invalid port"))?;
                (host.to_string(), Some(port))
            }
            None => (authority.to_string(), None),
        };

        let mut query = HashMap::new();
        if let Some(query_text) = query_text {
            for pair in query_text.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((key, value)) => query.insert(key.to_string(), value.to_string()),
                    None => query.insert(pair.to_string(), String::new()),
                };
            }
        }

        Ok(Self {
            scheme: scheme.to_string(),
            host,
            port,
            path: path.to_string(),
            query,
        })
    }
}

/// Constructor for a backend, taking the parsed URL.
pub type BackendConstructor = fn(&UrlParts) -> Result<Box<dyn Backend>>;

static REGISTRY: Lazy<RwLock<HashMap<String, BackendConstructor>>> =
    Lazy::new(|| RwLock::new(builtin_schemes()));

fn builtin_schemes() -> HashMap<String, BackendConstructor> {
    let mut schemes: HashMap<String, BackendConstructor> = HashMap::new();
    schemes.insert("file".to_string(), FileBackend::create_from_url_parts);
    schemes.insert("s3".to_string(), S3Backend::create_from_url_parts);
    schemes.insert("redis".to_string(), RedisBackend::create_from_url_parts);
    schemes.insert("memory".to_string(), |parts| {
        Ok(Box::new(MemoryBackend::new(&format!(
            "{}{}",
            parts.host, parts.path
        ))))
    });
    schemes
}

/// Register a backend constructor for a URL scheme.
pub fn register_scheme(scheme: &str, constructor: BackendConstructor) {
    let mut registry = match REGISTRY.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    registry.insert(scheme.to_string(), constructor);
}

/// Restore the built-in scheme set. Test isolation hook.
pub fn reset_schemes() {
    let mut registry = match REGISTRY.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *registry = builtin_schemes();
}

/// Resolve `url` to a concrete backend instance.
pub fn create_backend(url: &str) -> Result<Box<dyn Backend>> {
    let mut parts = UrlParts::parse(url)?;

    // `scheme+zip` selects the single-artifact form of any scheme.
    let zipped = match parts.scheme.strip_suffix("+zip") {
        Some(inner) => {
            parts.scheme = inner.to_string();
            true
        }
        None => false,
    };

    let constructor = {
        let registry = match REGISTRY.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.get(&parts.scheme).copied()
    };
    let constructor = constructor.ok_or_else(|| ConfigError::UnknownScheme(url.to_string()))?;

    let backend = constructor(&parts)?;
    if zipped {
        Ok(Box::new(ZipBackend::wrap(backend)))
    } else {
        Ok(backend)
    }
}

/// Load a complete table store from `url`.
pub fn get_store_from_url(url: &str) -> Result<TableStore> {
    let mut backend = create_backend(url)?;
    Ok(backend.load_table_store()?)
}
