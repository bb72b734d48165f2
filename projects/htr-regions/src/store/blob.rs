use crate::error::StoreError;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A file handed to storage from outside (multipart upload, archive entry).
pub trait IncomingFile {
    fn name(&self) -> &str;
    fn persist_to(&self, path: &Path) -> io::Result<()>;
}

/// Incoming file whose content is already in memory.
#[derive(Debug, Clone)]
pub struct MemoryFile {
    name: String,
    bytes: Vec<u8>,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

impl IncomingFile for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn persist_to(&self, path: &Path) -> io::Result<()> {
        fs::write(path, &self.bytes)
    }
}

/// Flat key-value storage of opaque blobs.
pub trait BlobStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn exists(&self, key: &str) -> bool;
    /// Returns false when there was nothing to delete.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;
    /// All keys, sorted.
    fn keys(&self) -> Result<Vec<String>, StoreError>;
    fn put_file(&self, key: &str, file: &dyn IncomingFile) -> Result<(), StoreError>;
}

/// Rejects keys that are empty or could step outside the store directory.
pub fn validate_key(key: &str) -> Result<&str, StoreError> {
    let bad = key.is_empty()
        || key == "."
        || key == ".."
        || key.starts_with('.')
        || key.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidName(key.to_string()));
    }
    Ok(key)
}

/// One directory, one file per key.
///
/// Writes land in a hidden temp file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path_of(&self, key: &str) -> Result<PathBuf, StoreError> {
        Ok(self.root.join(validate_key(key)?))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4().simple()))
    }

    /// Runs `write` against a fresh temp file and renames it over `key`.
    /// The temp file is removed whenever any step fails.
    fn write_via_temp(
        &self,
        key: &str,
        write: impl FnOnce(&Path) -> io::Result<()>,
    ) -> Result<(), StoreError> {
        let target = self.path_of(key)?;
        let tmp = self.temp_path(key);
        if let Err(e) = write(&tmp).and_then(|()| fs::rename(&tmp, &target)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    fn load(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_of(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.write_via_temp(key, |tmp| {
            let mut file = fs::File::create(tmp)?;
            file.write_all(bytes)?;
            file.sync_all()
        })
    }

    fn exists(&self, key: &str) -> bool {
        self.path_of(key).map(|p| p.is_file()).unwrap_or(false)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_of(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| StoreError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn put_file(&self, key: &str, file: &dyn IncomingFile) -> Result<(), StoreError> {
        self.write_via_temp(key, |tmp| file.persist_to(tmp))
    }
}
