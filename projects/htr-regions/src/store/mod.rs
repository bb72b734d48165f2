// Persistence: images, annotation records and projects under one data root

pub mod annotations;
pub mod blob;
pub mod images;
pub mod projects;

use crate::error::StoreError;
use annotations::AnnotationStore;
use blob::FsBlobStore;
use images::ImageLibrary;
use projects::ProjectStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct Storage {
    pub root: PathBuf,
    pub images: ImageLibrary,
    pub annotations: AnnotationStore,
    pub projects: ProjectStore,
}

impl Storage {
    /// Opens (and creates) `images/`, `originals/`, `annotations/` and
    /// `projects/` below `root`.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let working = FsBlobStore::open(root.join("images"))?;
        let originals = FsBlobStore::open(root.join("originals"))?;
        let annotations = FsBlobStore::open(root.join("annotations"))?;
        let projects = FsBlobStore::open(root.join("projects"))?;

        Ok(Self {
            root: root.to_path_buf(),
            images: ImageLibrary::new(Arc::new(working), Arc::new(originals)),
            annotations: AnnotationStore::new(Arc::new(annotations)),
            projects: ProjectStore::new(Arc::new(projects)),
        })
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn originals_dir(&self) -> PathBuf {
        self.root.join("originals")
    }

    /// Deletes images together with their originals and annotation records.
    ///
    /// Returns how many working images were actually removed.
    pub fn delete_images(&self, names: &[String]) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for name in names {
            if self.images.delete(name)? {
                deleted += 1;
            }
            self.annotations.delete(name)?;
            self.projects.forget_image(name)?;
        }
        tracing::info!("Deleted {} of {} requested images", deleted, names.len());
        Ok(deleted)
    }
}
