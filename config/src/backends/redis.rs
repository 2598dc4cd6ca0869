//! Redis cache backend.
//!
//! Maps relative paths to keys `relib:drift-config:<prefix>:<path>`. This
//! is the fast shared cache in front of the origin: tiers publish the
//! config here so service instances can pull without touching the object
//! store. A missing key reads as `BackendFileNotFound` (it may simply have
//! expired).

use crate::backends::UrlParts;
use crate::error::Result;
use redis::Commands;
use relib::{Backend, Error};
use std::time::Duration;
use tracing::{debug, warn};

const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend storing the table set in a key-value cache.
pub struct RedisBackend {
    connection: redis::Connection,
    host: String,
    port: u16,
    db: i64,
    prefix: String,
    expire_sec: Option<u64>,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .field("prefix", &self.prefix)
            .field("expire_sec", &self.expire_sec)
            .finish()
    }
}

impl RedisBackend {
    /// Connect to `host:port/db`, keying entries under `prefix` with an
    /// optional per-key time to live.
    pub fn new(
        host: Option<&str>,
        port: Option<u16>,
        db: Option<i64>,
        prefix: Option<&str>,
        expire_sec: Option<u64>,
    ) -> Result<Self> {
        let host = host.unwrap_or("localhost").to_string();
        let port = port.unwrap_or(6379);
        let db = db.unwrap_or(0);

        let client = redis::Client::open(format!("redis://{}:{}/{}", host, port, db))
            .map_err(|e| Error::Backend(format!("Bad redis address: {}", e)))?;
        let connection = client
            .get_connection_with_timeout(SOCKET_TIMEOUT)
            .map_err(|e| Error::Backend(format!("Can't connect to redis: {}", e)))?;
        connection
            .set_read_timeout(Some(SOCKET_TIMEOUT))
            .and_then(|_| connection.set_write_timeout(Some(SOCKET_TIMEOUT)))
            .map_err(|e| Error::Backend(format!("Can't configure redis socket: {}", e)))?;

        let backend = Self {
            connection,
            host,
            port,
            db,
            prefix: prefix.unwrap_or_default().to_string(),
            expire_sec,
        };
        debug!("{} initialized.", backend.get_url());
        Ok(backend)
    }

    /// Cache backend for a domain, keyed by the domain name and without
    /// expiry. This is how tier configuration points services at the cache.
    pub fn for_domain(host: &str, port: u16, domain_name: &str) -> Result<Self> {
        Self::new(Some(host), Some(port), None, Some(domain_name), None)
    }

    pub(crate) fn create_from_url_parts(parts: &UrlParts) -> Result<Box<dyn Backend>> {
        let db = parts
            .path
            .strip_prefix('/')
            .filter(|p| !p.is_empty())
            .map(|p| {
                p.parse::<i64>().map_err(|_| crate::error::ConfigError::InvalidUrl {
                    url: format!("redis://{}{}", parts.host, parts.path),
                    message: "database index must be an integer".to_string(),
                })
            })
            .transpose()?;
        let expire_sec = parts
            .query
            .get("expire_sec")
            .map(|v| {
                v.parse::<u64>().map_err(|_| crate::error::ConfigError::InvalidUrl {
                    url: format!("redis://{}{}", parts.host, parts.path),
                    message: "expire_sec must be an integer".to_string(),
                })
            })
            .transpose()?;

        let host = (!parts.host.is_empty()).then_some(parts.host.as_str());
        let prefix = parts.query.get("prefix").map(String::as_str);
        Ok(Box::new(Self::new(host, parts.port, db, prefix, expire_sec)?))
    }

    fn key_name(&self, file_name: &str) -> String {
        format!("relib:drift-config:{}:{}", self.prefix, file_name)
    }
}

impl Backend for RedisBackend {
    fn save_data(&mut self, file_name: &str, data: &[u8]) -> relib::Result<()> {
        let key_name = self.key_name(file_name);
        debug!(
            "Adding {} bytes to redis:{} with expiry:{:?}",
            data.len(),
            key_name,
            self.expire_sec
        );

        let () = self
            .connection
            .set(&key_name, data)
            .map_err(|e| Error::Backend(format!("Can't write '{}': {}", key_name, e)))?;
        if let Some(expire_sec) = self.expire_sec {
            let () = self
                .connection
                .expire(&key_name, expire_sec as i64)
                .map_err(|e| Error::Backend(format!("Can't expire '{}': {}", key_name, e)))?;
        }
        Ok(())
    }

    fn load_data(&mut self, file_name: &str) -> relib::Result<Vec<u8>> {
        let key_name = self.key_name(file_name);
        debug!("Reading from redis:{}", key_name);

        let data: Option<Vec<u8>> = self
            .connection
            .get(&key_name)
            .map_err(|e| Error::Backend(format!("Can't read '{}': {}", key_name, e)))?;
        data.ok_or_else(|| {
            warn!("Redis cache doesn't have '{}'. (Is it expired?)", key_name);
            Error::BackendFileNotFound(file_name.to_string())
        })
    }

    fn get_url(&self) -> String {
        format!(
            "redis://{}:{}/{}?prefix={}",
            self.host, self.port, self.db, self.prefix
        )
    }
}
