// Annotation state store: one JSON record per image
//
// Every read-modify-write runs while holding that image's lock, so the
// editor, cropper and background passes can save different fields of the
// same record without losing each other's updates.

use crate::error::StoreError;
use crate::pipeline::types::{Record, RecordPatch};
use crate::store::blob::{validate_key, BlobStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

pub struct AnnotationStore {
    blobs: Arc<dyn BlobStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn record_key(image_name: &str) -> Result<String, StoreError> {
    validate_key(image_name)?;
    Ok(format!("{image_name}.json"))
}

impl AnnotationStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, image_name: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(image_name.to_string())
            .or_default()
            .clone()
    }

    /// Runs `f` while holding the image's advisory lock.
    pub fn with_image_lock<T>(&self, image_name: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.lock_for(image_name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// The stored record, or None if the image has never been saved.
    ///
    /// A record that no longer parses is treated as absent.
    pub fn load_existing(&self, image_name: &str) -> Result<Option<Record>, StoreError> {
        let key = record_key(image_name)?;
        let bytes = match self.blobs.load(&key) {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        match serde_json::from_slice::<Record>(&bytes) {
            Ok(mut record) => {
                if record.image_name.is_empty() {
                    record.image_name = image_name.to_string();
                }
                Ok(Some(record))
            }
            Err(e) => {
                tracing::warn!(
                    "Annotation record for {} is malformed, using defaults: {}",
                    image_name,
                    e
                );
                Ok(None)
            }
        }
    }

    /// The stored record or an empty default. Never fails for unknown images.
    pub fn load(&self, image_name: &str) -> Result<Record, StoreError> {
        Ok(self
            .load_existing(image_name)?
            .unwrap_or_else(|| Record::empty(image_name)))
    }

    fn write(&self, record: &Record) -> Result<(), StoreError> {
        let key = record_key(&record.image_name)?;
        let json = serde_json::to_vec_pretty(record)?;
        self.blobs.save(&key, &json)
    }

    /// Replaces the whole record.
    pub fn save(&self, record: &Record) -> Result<(), StoreError> {
        if record.image_name.is_empty() {
            return Err(StoreError::missing_field("image_name"));
        }
        self.with_image_lock(&record.image_name, || self.write(record))
    }

    /// Merge-on-save: only the fields present in `patch` are overwritten.
    pub fn save_patch(&self, patch: RecordPatch) -> Result<Record, StoreError> {
        let image_name = match patch.image_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(StoreError::missing_field("image_name")),
        };
        self.update(&image_name, |record| {
            patch.apply_to(record);
            Ok::<_, StoreError>(())
        })
        .map(|(record, ())| record)
    }

    /// Loads, mutates and writes back the record under the image's lock.
    ///
    /// Nothing is written when `f` fails.
    pub fn update<T, E>(
        &self,
        image_name: &str,
        f: impl FnOnce(&mut Record) -> Result<T, E>,
    ) -> Result<(Record, T), E>
    where
        E: From<StoreError>,
    {
        if image_name.is_empty() {
            return Err(StoreError::missing_field("image_name").into());
        }
        self.with_image_lock(image_name, || {
            let mut record = self.load(image_name)?;
            let out = f(&mut record)?;
            record.image_name = image_name.to_string();
            self.write(&record)?;
            Ok((record, out))
        })
    }

    pub fn delete(&self, image_name: &str) -> Result<bool, StoreError> {
        let key = record_key(image_name)?;
        let deleted = self.with_image_lock(image_name, || self.blobs.delete(&key));
        self.release_lock(image_name);
        deleted
    }

    /// Drops the image's lock entry unless another caller still holds it.
    fn release_lock(&self, image_name: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(image_name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(image_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{CropParams, Region, Status};
    use crate::store::blob::FsBlobStore;
    use serde_json::json;
    use std::thread;

    fn store() -> (tempfile::TempDir, AnnotationStore) {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::open(dir.path().join("annotations")).unwrap();
        (dir, AnnotationStore::new(Arc::new(blobs)))
    }

    fn patch(value: serde_json::Value) -> RecordPatch {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_load_unknown_image_returns_default() {
        let (_dir, store) = store();
        let record = store.load("nonexistent.png").unwrap();
        assert!(record.regions.is_empty());
        assert!(record.texts.is_empty());
        assert_eq!(record.crop_params, None);
        assert_eq!(record.image_name, "nonexistent.png");
        assert!(store.load_existing("nonexistent.png").unwrap().is_none());
    }

    #[test]
    fn test_save_requires_image_name() {
        let (_dir, store) = store();
        assert!(matches!(
            store.save(&Record::default()),
            Err(StoreError::MissingField { .. })
        ));
        assert!(matches!(
            store.save_patch(patch(json!({"regions": []}))),
            Err(StoreError::MissingField { .. })
        ));
    }

    #[test]
    fn test_saved_record_always_has_texts() {
        let (dir, store) = store();
        store
            .save_patch(patch(json!({"image_name": "a.png", "regions": []})))
            .unwrap();
        let raw = std::fs::read(dir.path().join("annotations/a.png.json")).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["texts"], json!({}));
    }

    #[test]
    fn test_merge_on_save_preserves_other_fields() {
        let (_dir, store) = store();
        let crop = CropParams {
            x: 5,
            y: 5,
            w: 50,
            h: 40,
            angle: 2.0,
        };
        let mut record = Record::empty("a.png");
        record.regions = vec![Region::rect(0, 0, 10, 10)];
        record.crop_params = Some(crop);
        record.status = Status::Cropped;
        store.save(&record).unwrap();

        store
            .save_patch(patch(json!({"image_name": "a.png", "texts": {"0": "hello"}})))
            .unwrap();
        let merged = store.load("a.png").unwrap();
        assert_eq!(merged.regions, record.regions);
        assert_eq!(merged.crop_params, Some(crop));
        assert_eq!(merged.status, Status::Cropped);
        assert_eq!(merged.text_for(0), Some("hello"));

        store
            .save_patch(patch(json!({"image_name": "a.png", "crop_params": null})))
            .unwrap();
        let cleared = store.load("a.png").unwrap();
        assert_eq!(cleared.crop_params, None);
        assert_eq!(cleared.text_for(0), Some("hello"));
    }

    #[test]
    fn test_malformed_record_falls_back_to_default() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("annotations/bad.png.json"), b"{not json").unwrap();
        let record = store.load("bad.png").unwrap();
        assert_eq!(record, Record::empty("bad.png"));
    }

    #[test]
    fn test_failed_update_writes_nothing() {
        let (_dir, store) = store();
        let result = store.update("a.png", |record| {
            record.regions.push(Region::rect(0, 0, 1, 1));
            Err::<(), _>(StoreError::NotFound("a.png".into()))
        });
        assert!(result.is_err());
        assert!(store.load_existing("a.png").unwrap().is_none());
    }

    #[test]
    fn test_concurrent_partial_saves_do_not_lose_fields() {
        let (_dir, store) = store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    store
                        .update("a.png", |record| {
                            record.texts.insert(i.to_string(), format!("line {i}"));
                            Ok::<_, StoreError>(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.load("a.png").unwrap().texts.len(), 16);
    }

    #[test]
    fn test_delete_record() {
        let (_dir, store) = store();
        store.save(&Record::empty("a.png")).unwrap();
        assert!(store.delete("a.png").unwrap());
        assert!(!store.delete("a.png").unwrap());
    }

    #[test]
    fn test_delete_forgets_image_lock() {
        let (_dir, store) = store();
        store.save(&Record::empty("a.png")).unwrap();
        store.save(&Record::empty("b.png")).unwrap();
        assert_eq!(store.locks.lock().unwrap().len(), 2);

        store.delete("a.png").unwrap();
        let locks = store.locks.lock().unwrap();
        assert!(!locks.contains_key("a.png"));
        assert!(locks.contains_key("b.png"));
    }

    #[test]
    fn test_delete_keeps_lock_held_elsewhere() {
        let (_dir, store) = store();
        let held = store.lock_for("a.png");
        store.release_lock("a.png");
        assert!(Arc::ptr_eq(&held, &store.lock_for("a.png")));
    }
}
