use crate::error::StoreError;
use crate::store::blob::{validate_key, BlobStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// A named, ordered collection of library images.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub images: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ProjectUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

fn project_key(name: &str) -> Result<String, StoreError> {
    validate_key(name)?;
    Ok(format!("{name}.json"))
}

fn clean_name(name: &str) -> Result<String, StoreError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::missing_field("name"));
    }
    validate_key(name)?;
    Ok(name.to_string())
}

pub struct ProjectStore {
    blobs: Arc<dyn BlobStore>,
    write_lock: Mutex<()>,
}

impl ProjectStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            write_lock: Mutex::new(()),
        }
    }

    fn write(&self, project: &Project) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(project)?;
        self.blobs.save(&project_key(&project.name)?, &json)
    }

    fn modify(
        &self,
        name: &str,
        f: impl FnOnce(&mut Project) -> Result<(), StoreError>,
    ) -> Result<Project, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut project = self.get(name)?;
        f(&mut project)?;
        project.updated_at = Utc::now();
        self.write(&project)?;
        Ok(project)
    }

    pub fn create(&self, name: &str, description: &str) -> Result<Project, StoreError> {
        let name = clean_name(name)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.blobs.exists(&project_key(&name)?) {
            return Err(StoreError::AlreadyExists(name));
        }

        let now = Utc::now();
        let project = Project {
            name,
            description: description.to_string(),
            images: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.write(&project)?;
        tracing::info!("Created project {}", project.name);
        Ok(project)
    }

    pub fn get(&self, name: &str) -> Result<Project, StoreError> {
        let bytes = self.blobs.load(&project_key(name)?)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// All projects sorted by name. Unreadable project files are skipped.
    pub fn list(&self) -> Result<Vec<Project>, StoreError> {
        let mut projects = Vec::new();
        for key in self.blobs.keys()? {
            let Some(name) = key.strip_suffix(".json") else {
                continue;
            };
            match self.get(name) {
                Ok(project) => projects.push(project),
                Err(e) => tracing::warn!("Skipping unreadable project {}: {}", name, e),
            }
        }
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    /// Renames and/or re-describes a project.
    pub fn update(&self, name: &str, update: ProjectUpdate) -> Result<Project, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut project = self.get(name)?;

        if let Some(new_name) = update.name.as_deref() {
            let new_name = clean_name(new_name)?;
            if new_name != project.name {
                if self.blobs.exists(&project_key(&new_name)?) {
                    return Err(StoreError::AlreadyExists(new_name));
                }
                tracing::info!("Renaming project {} to {}", project.name, new_name);
                project.name = new_name;
            }
        }
        if let Some(description) = update.description {
            project.description = description;
        }

        project.updated_at = Utc::now();
        self.write(&project)?;
        if project.name != name {
            self.blobs.delete(&project_key(name)?)?;
        }
        Ok(project)
    }

    /// Deletes the project document. Its images stay in the library.
    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.blobs.delete(&project_key(name)?)? {
            return Err(StoreError::NotFound(name.to_string()));
        }
        tracing::info!("Deleted project {}", name);
        Ok(())
    }

    /// Appends images not already in the project, keeping their order.
    pub fn add_images(&self, name: &str, images: &[String]) -> Result<Project, StoreError> {
        self.modify(name, |project| {
            for image in images {
                if !project.images.contains(image) {
                    project.images.push(image.clone());
                }
            }
            Ok(())
        })
    }

    pub fn remove_image(&self, name: &str, image: &str) -> Result<Project, StoreError> {
        self.modify(name, |project| {
            project.images.retain(|i| i != image);
            Ok(())
        })
    }

    /// Drops a deleted library image from every project that lists it.
    pub fn forget_image(&self, image: &str) -> Result<(), StoreError> {
        for project in self.list()? {
            if project.images.iter().any(|i| i == image) {
                self.remove_image(&project.name, image)?;
            }
        }
        Ok(())
    }
}
