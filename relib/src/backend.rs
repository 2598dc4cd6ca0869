//! Backend - the byte-blob substrate a store serializes onto.
//!
//! A backend maps relative paths to byte payloads. The core only ships the
//! trait and the in-memory implementation used for scratch round-trips;
//! filesystem, object store, cache and archive backends live in the
//! `drift-config` crate.

use crate::error::{Error, Result};
use crate::store::TableStore;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Serialization substrate for a table store.
///
/// The batch brackets let aggregate backends assemble a single artifact;
/// for plain backends they default to no-ops. All methods block the current
/// thread; the core defines no internal suspension points.
pub trait Backend: std::fmt::Debug {
    /// Called once before a batch of `save_data` calls.
    fn start_saving(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once after the last `save_data` call of a batch.
    fn done_saving(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once before a batch of `load_data` calls.
    fn start_loading(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once after the last `load_data` call of a batch.
    fn done_loading(&mut self) -> Result<()> {
        Ok(())
    }

    /// Store `data` under `file_name`.
    fn save_data(&mut self, file_name: &str, data: &[u8]) -> Result<()>;

    /// Fetch the data stored under `file_name`, failing with
    /// `Error::BackendFileNotFound` if the key is absent.
    fn load_data(&mut self, file_name: &str) -> Result<Vec<u8>>;

    /// Round-trippable URL of this backend instance.
    fn get_url(&self) -> String;
}

impl<'a> dyn Backend + 'a {
    /// Run the full serialization protocol: integrity check, definition,
    /// user tables, metadata last.
    pub fn save_table_store(&mut self, table_store: &mut TableStore) -> Result<()> {
        table_store.save_to_backend(self)
    }

    /// Load a complete table store from this backend.
    pub fn load_table_store(&mut self) -> Result<TableStore> {
        TableStore::from_backend(self)
    }
}

/// Folder name → file map, shared process-wide so separate backend
/// instances addressing the same URL see the same data.
static ARCHIVE: Lazy<Mutex<HashMap<String, HashMap<String, Vec<u8>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

fn archive() -> MutexGuard<'static, HashMap<String, HashMap<String, Vec<u8>>>> {
    match ARCHIVE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-memory backend. Lifetime is bound to the process; intended for tests
/// and for the scratch round-trips behind `check_integrity` and
/// `refresh_metadata`.
#[derive(Debug)]
pub struct MemoryBackend {
    folder: String,
    owned: bool,
}

impl MemoryBackend {
    /// Open the process-wide folder named `folder`, creating it if needed.
    pub fn new(folder: &str) -> Self {
        archive().entry(folder.to_string()).or_default();
        Self {
            folder: folder.to_string(),
            owned: false,
        }
    }

    /// A uniquely named folder that is removed again when the backend is
    /// dropped. Scratch round-trips would otherwise leak one folder per
    /// metadata refresh.
    pub fn scratch() -> Self {
        let folder = format!("scratch-{}", SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed));
        archive().insert(folder.clone(), HashMap::new());
        Self {
            folder,
            owned: true,
        }
    }

    /// Drop every folder. Test isolation hook.
    pub fn reset() {
        archive().clear();
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        if self.owned {
            archive().remove(&self.folder);
        }
    }
}

impl Backend for MemoryBackend {
    fn save_data(&mut self, file_name: &str, data: &[u8]) -> Result<()> {
        debug!("Adding {} bytes to memory folder '{}': {}", data.len(), self.folder, file_name);
        archive()
            .entry(self.folder.clone())
            .or_default()
            .insert(file_name.to_string(), data.to_vec());
        Ok(())
    }

    fn load_data(&mut self, file_name: &str) -> Result<Vec<u8>> {
        archive()
            .get(&self.folder)
            .and_then(|folder| folder.get(file_name))
            .cloned()
            .ok_or_else(|| Error::BackendFileNotFound(file_name.to_string()))
    }

    fn get_url(&self) -> String {
        format!("memory://{}", self.folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_any_bytes() {
        let mut backend = MemoryBackend::scratch();
        let payload = vec![0u8, 1, 2, 255, 254];
        backend.save_data("some/nested/path.bin", &payload).unwrap();
        assert_eq!(backend.load_data("some/nested/path.bin").unwrap(), payload);
    }

    #[test]
    fn missing_file() {
        let mut backend = MemoryBackend::scratch();
        let err = backend.load_data("nope.json").unwrap_err();
        assert!(matches!(err, Error::BackendFileNotFound(_)));
    }

    #[test]
    fn shared_by_folder_name() {
        let mut first = MemoryBackend::new("shared-folder-test");
        first.save_data("a.json", b"{}").unwrap();

        let mut second = MemoryBackend::new("shared-folder-test");
        assert_eq!(second.load_data("a.json").unwrap(), b"{}");
        assert_eq!(second.get_url(), "memory://shared-folder-test");

        archive().remove("shared-folder-test");
    }

    #[test]
    fn scratch_folder_cleaned_up() {
        let folder = {
            let mut backend = MemoryBackend::scratch();
            backend.save_data("a.json", b"{}").unwrap();
            backend.folder.clone()
        };
        assert!(!archive().contains_key(&folder));
    }
}
