#![forbid(unsafe_code)]

use std::fs;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use crate::types::{Result, TesseraError};

/// Source of externally built bulk files.
pub trait ExternalStorage: Send + Sync {
    /// Reads the whole file at `path`.
    fn fetch(&self, path: &str) -> Result<Bytes>;
}

/// [`ExternalStorage`] over a local directory.
#[derive(Clone, Debug)]
pub struct LocalExternalStorage {
    root: PathBuf,
}

impl LocalExternalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(TesseraError::InvalidOwned(format!(
                "external path {path:?} escapes the storage root"
            )));
        }
        Ok(self.root.join(rel))
    }
}

impl ExternalStorage for LocalExternalStorage {
    fn fetch(&self, path: &str) -> Result<Bytes> {
        let full = self.resolve(path)?;
        let data = fs::read(&full)?;
        debug!(path = %full.display(), bytes = data.len(), "external.fetch");
        Ok(Bytes::from(data))
    }
}
