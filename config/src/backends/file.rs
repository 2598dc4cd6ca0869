//! Filesystem backend.
//!
//! Maps relative paths to files under a root directory. Subdirectories are
//! created on demand, and `~` expands to the user's home directory so that
//! `file://~/.drift/config/<domain>` works everywhere.

use crate::backends::UrlParts;
use crate::error::Result;
use relib::{Backend, Error};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Backend rooted at a local directory.
#[derive(Debug)]
pub struct FileBackend {
    folder: PathBuf,
}

impl FileBackend {
    /// Open (and create if needed) the root directory `folder_name`.
    pub fn new(folder_name: &str) -> Result<Self> {
        // Expand the user home and trim whatever was in front of the '~'.
        let folder_name = match folder_name.find('~') {
            Some(i) => shellexpand::tilde(&folder_name[i..]).into_owned(),
            None => folder_name.to_string(),
        };

        let folder = PathBuf::from(folder_name);
        fs::create_dir_all(&folder).map_err(|e| {
            Error::Backend(format!("Can't create folder '{}': {}", folder.display(), e))
        })?;

        Ok(Self { folder })
    }

    pub(crate) fn create_from_url_parts(parts: &UrlParts) -> Result<Box<dyn Backend>> {
        // Host and path combine into one folder name.
        let folder = format!("{}{}", parts.host, parts.path);
        Ok(Box::new(Self::new(&folder)?))
    }

    fn file_path(&self, file_name: &str) -> PathBuf {
        let mut path = self.folder.clone();
        path.extend(file_name.split('/'));
        path
    }
}

impl Backend for FileBackend {
    fn save_data(&mut self, file_name: &str, data: &[u8]) -> relib::Result<()> {
        let path = self.file_path(file_name);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Backend(format!("Can't create folder '{}': {}", parent.display(), e))
            })?;
        }

        debug!("Writing {} bytes to {}", data.len(), path.display());
        fs::write(&path, data)
            .map_err(|e| Error::Backend(format!("Can't write '{}': {}", path.display(), e)))
    }

    fn load_data(&mut self, file_name: &str) -> relib::Result<Vec<u8>> {
        let path = self.file_path(file_name);
        debug!("Reading from {}", path.display());

        if !path.exists() {
            return Err(Error::BackendFileNotFound(file_name.to_string()));
        }

        fs::read(&path)
            .map_err(|e| Error::Backend(format!("Can't read '{}': {}", path.display(), e)))
    }

    fn get_url(&self) -> String {
        let mut path = self.folder.to_string_lossy().into_owned();
        let home = shellexpand::tilde("~").into_owned();
        if !home.is_empty() && path.starts_with(&home) {
            path = format!("~{}", &path[home.len()..]);
        }
        format!("file://{}", path.replace('\\', "/"))
    }
}

/// List the subdirectories of `folder`, each a candidate file-scheme store.
pub fn list_config_folders(folder: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(folder) else {
        return Vec::new();
    };
    let mut folders: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    folders.sort();
    folders
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_subfolders() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FileBackend::new(dir.path().to_str().unwrap()).unwrap();

        backend.save_data("tenants/tenants.acme.json", b"[]").unwrap();
        assert_eq!(
            backend.load_data("tenants/tenants.acme.json").unwrap(),
            b"[]"
        );
        assert!(dir.path().join("tenants").is_dir());
    }

    #[test]
    fn missing_file_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FileBackend::new(dir.path().to_str().unwrap()).unwrap();

        let err = backend.load_data("nope.json").unwrap_err();
        assert!(matches!(err, Error::BackendFileNotFound(_)));
    }

    #[test]
    fn url_abbreviates_home() {
        let home = shellexpand::tilde("~").into_owned();
        let backend = FileBackend {
            folder: PathBuf::from(format!("{}/.drift/config/test", home)),
        };
        assert_eq!(backend.get_url(), "file://~/.drift/config/test");
    }

    #[test]
    fn tilde_expansion() {
        let backend = FileBackend {
            folder: PathBuf::from("/tmp/x"),
        };
        // Sanity: the URL survives a parse round-trip.
        let parts = UrlParts::parse(&backend.get_url()).unwrap();
        assert_eq!(parts.scheme, "file");
        assert_eq!(format!("{}{}", parts.host, parts.path), "/tmp/x");
    }
}
