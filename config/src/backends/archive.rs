//! Single-artifact archive codec.
//!
//! Wraps any backend and turns the multi-file tree into one gzip'd tar
//! blob, written to the inner backend as `_archive.tar.gz`. Used to
//! publish a complete snapshot as a single artifact; the archived and the
//! multi-file form round-trip identically.
//!
//! Entry metadata is zeroed out so that two saves of an unchanged store
//! produce byte-identical archives.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use relib::{Backend, Error};
use std::collections::HashMap;
use std::io::Read;
use tracing::debug;

/// Name of the archive entry in the wrapped backend.
pub const ARCHIVE_FILENAME: &str = "_archive.tar.gz";

/// Aggregates a whole save batch into one compressed archive.
pub struct ZipBackend {
    inner: Box<dyn Backend>,
    writer: Option<tar::Builder<GzEncoder<Vec<u8>>>>,
    entries: HashMap<String, Vec<u8>>,
    loaded: bool,
}

impl std::fmt::Debug for ZipBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipBackend")
            .field("inner", &self.inner)
            .field("loaded", &self.loaded)
            .finish()
    }
}

impl ZipBackend {
    /// Wrap `inner`; all relative paths are stored inside the archive.
    pub fn wrap(inner: Box<dyn Backend>) -> Self {
        Self {
            inner,
            writer: None,
            entries: HashMap::new(),
            loaded: false,
        }
    }
}

impl Backend for ZipBackend {
    fn start_saving(&mut self) -> relib::Result<()> {
        self.inner.start_saving()?;
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        self.writer = Some(tar::Builder::new(encoder));
        Ok(())
    }

    fn done_saving(&mut self) -> relib::Result<()> {
        let builder = self.writer.take().ok_or_else(|| {
            Error::Backend("Archive batch finished without being started.".to_string())
        })?;
        let encoder = builder
            .into_inner()
            .map_err(|e| Error::Backend(format!("Can't finish archive: {}", e)))?;
        let bytes = encoder
            .finish()
            .map_err(|e| Error::Backend(format!("Can't finish archive: {}", e)))?;

        debug!("Writing {} byte archive to {}", bytes.len(), self.inner.get_url());
        self.inner.save_data(ARCHIVE_FILENAME, &bytes)?;
        self.inner.done_saving()
    }

    fn start_loading(&mut self) -> relib::Result<()> {
        self.inner.start_loading()?;
        let bytes = self.inner.load_data(ARCHIVE_FILENAME)?;

        let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        let mut entries = HashMap::new();
        let iter = archive
            .entries()
            .map_err(|e| Error::Backend(format!("Can't read archive: {}", e)))?;
        for entry in iter {
            let mut entry = entry.map_err(|e| Error::Backend(format!("Bad archive entry: {}", e)))?;
            let path = entry
                .path()
                .map_err(|e| Error::Backend(format!("Bad archive entry path: {}", e)))?
                .to_string_lossy()
                .into_owned();
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut data)
                .map_err(|e| Error::Backend(format!("Can't inflate '{}': {}", path, e)))?;
            entries.insert(path, data);
        }

        self.entries = entries;
        self.loaded = true;
        Ok(())
    }

    fn done_loading(&mut self) -> relib::Result<()> {
        self.inner.done_loading()
    }

    fn save_data(&mut self, file_name: &str, data: &[u8]) -> relib::Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            Error::Backend("Archive write outside a save batch.".to_string())
        })?;

        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        writer
            .append_data(&mut header, file_name, data)
            .map_err(|e| Error::Backend(format!("Can't append '{}' to archive: {}", file_name, e)))
    }

    fn load_data(&mut self, file_name: &str) -> relib::Result<Vec<u8>> {
        if !self.loaded {
            self.start_loading()?;
        }
        self.entries
            .get(file_name)
            .cloned()
            .ok_or_else(|| Error::BackendFileNotFound(file_name.to_string()))
    }

    fn get_url(&self) -> String {
        let inner_url = self.inner.get_url();
        match inner_url.split_once("://") {
            Some((scheme, rest)) => format!("{}+zip://{}", scheme, rest),
            None => inner_url,
        }
    }
}
