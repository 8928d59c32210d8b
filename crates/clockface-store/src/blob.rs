//! Filesystem image storage rooted at the upload directory.

use clockface_core::{BlobRef, BlobStore, StoreError};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

const PARTIAL_SUFFIX: &str = ".partial";

/// Stores each blob at `root/<name>`. References are the relative name.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a stored blob.
    pub fn path_of(&self, blob: &BlobRef) -> Result<PathBuf, StoreError> {
        self.resolve(blob.as_str())
    }

    /// Only plain relative paths are accepted; no `..`, roots or prefixes.
    fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(name);
        let plain = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(StoreError::Backend(format!("invalid blob name {name:?}")));
        }
        Ok(self.root.join(relative))
    }
}

impl BlobStore for FsBlobStore {
    fn store(&self, bytes: &[u8], name: &str) -> Result<BlobRef, StoreError> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write beside the target and rename so readers never see a torn file.
        let mut partial = path.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        let written = fs::File::create(&partial).and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|()| fs::rename(&partial, &path)) {
            let _ = fs::remove_file(&partial);
            return Err(e.into());
        }

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "blob stored");
        Ok(BlobRef::new(name))
    }

    fn remove(&self, blob: &BlobRef) -> Result<(), StoreError> {
        let path = self.resolve(blob.as_str())?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
