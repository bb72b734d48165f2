use crate::error::StoreError;
use crate::store::blob::{BlobStore, IncomingFile};
use std::path::Path;
use std::sync::Arc;

pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "bmp", "webp"];

pub fn is_allowed_image(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|s| s.to_str())
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Working images plus an untouched copy of each upload.
///
/// Crops overwrite the working copy; the original is what every new crop
/// starts from.
pub struct ImageLibrary {
    working: Arc<dyn BlobStore>,
    originals: Arc<dyn BlobStore>,
}

impl ImageLibrary {
    pub fn new(working: Arc<dyn BlobStore>, originals: Arc<dyn BlobStore>) -> Self {
        Self { working, originals }
    }

    /// Sorted names of all working images with an allowed extension.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .working
            .keys()?
            .into_iter()
            .filter(|name| is_allowed_image(name))
            .collect())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.working.exists(name)
    }

    /// Stores an upload as both the working image and its original.
    pub fn add(&self, file: &dyn IncomingFile) -> Result<String, StoreError> {
        let name = file.name().to_string();
        if !is_allowed_image(&name) {
            return Err(StoreError::InvalidName(name));
        }
        self.working.put_file(&name, file)?;
        self.originals.put_file(&name, file)?;
        tracing::info!("Stored image {}", name);
        Ok(name)
    }

    pub fn load_working(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.working.load(name)
    }

    pub fn save_working(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.working.save(name, bytes)
    }

    /// Copies the working image to the originals if no original was kept.
    ///
    /// Returns whether an original exists afterwards.
    pub fn ensure_original(&self, name: &str) -> Result<bool, StoreError> {
        if self.originals.exists(name) {
            return Ok(true);
        }
        if !self.working.exists(name) {
            return Ok(false);
        }
        let bytes = self.working.load(name)?;
        self.originals.save(name, &bytes)?;
        tracing::info!("Backfilled original for {}", name);
        Ok(true)
    }

    pub fn load_original(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        if !self.ensure_original(name)? {
            return Err(StoreError::NotFound(name.to_string()));
        }
        self.originals.load(name)
    }

    /// Removes the working image and its original. True if the working image existed.
    pub fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let existed = self.working.delete(name)?;
        self.originals.delete(name)?;
        Ok(existed)
    }
}
