//! Blob storage for photo attributes.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::BlobError;

/// Named binary objects. Names are relative paths using `/` as separator.
pub trait BlobStore: Send + Sync {
    /// Contents of `name`, or `None` if no such blob exists.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, BlobError>;

    /// Store `bytes` under `name` and return the name actually used.
    fn save(&self, name: &str, bytes: &[u8]) -> Result<String, BlobError> {
        let path = self.path_for(name)?;
        let (Some(parent), Some(file_name)) = (path.parent(), path.file_name()) else {
            return Err(BlobError::InvalidName(name.to_string()));
        };
        std::fs::create_dir_all(parent)?;
        let tmp = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        debug!(name, size = bytes.len(), "saved blob");
        Ok(name.to_string())
    }

    fn delete(&self, name: &str) -> Result<(), BlobError>;
}

/// Blob store backed by a directory on disk.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open the store, creating `root` if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, BlobError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "opened blob store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, BlobError> {
        let valid = !name.contains(['\\', '\0'])
            && name
                .split('/')
                .all(|part| !part.is_empty() && part != "." && part != "..");
        if !valid {
            return Err(BlobError::InvalidName(name.to_string()));
        }
        Ok(name.split('/').fold(self.root.clone(), |path, part| path.join(part)))
    }
}

impl BlobStore for FsBlobStore {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let path = self.path_for(name)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, name: &str, bytes: &[u8]) -> Result<String, BlobError> {
        let path = self.path_for(name)?;
        let tmp = self.root.join(format!(".{name}.tmp"));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        debug!(name, size = bytes.len(), "saved blob");
        Ok(name.to_string())
    }

    fn delete(&self, name: &str) -> Result<(), BlobError> {
        let path = self.path_for(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
