//! Error types shared across the pipeline, storage and format layers.

use thiserror::Error;

/// Errors raised by the blob, annotation and project stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A required request or record field was absent or empty.
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Names that would escape the storage root or are otherwise unusable as keys.
    #[error("Invalid name: {0:?}")]
    InvalidName(String),
}

impl StoreError {
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }
}

/// Errors raised while encoding or decoding interchange formats and images.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("XML attribute error: {0}")]
    XmlAttr(#[from] quick_xml::events::attributes::AttrError),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },
}

impl FormatError {
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }
}

/// Errors raised by the task registry.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(String),

    /// Completed and failed tasks never change again.
    #[error("Task {0} already reached a terminal state")]
    Finalized(String),

    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },
}

/// Errors raised when handing work to the background pool.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker queue is full")]
    Saturated,

    #[error("Worker pool is shut down")]
    ShutDown,
}

/// Errors raised by crop, detection and recognition work.
///
/// Every variant is classified as either transient (logged, the batch moves
/// on) or fatal (the owning task is marked failed), see [`PipelineError::is_fatal`].
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Image '{image}' could not be decoded or encoded: {source}")]
    Image {
        image: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Line detection failed for '{image}': {message}")]
    Detection { image: String, message: String },

    #[error("Text recognition failed for '{image}': {message}")]
    Recognition { image: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl PipelineError {
    pub fn image(image: impl Into<String>, source: image::ImageError) -> Self {
        Self::Image {
            image: image.into(),
            source,
        }
    }

    pub fn detection(image: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Detection {
            image: image.into(),
            message: message.into(),
        }
    }

    pub fn recognition(image: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Recognition {
            image: image.into(),
            message: message.into(),
        }
    }

    /// Storage that cannot be reached aborts a batch; everything else is
    /// scoped to the single image that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Store(StoreError::Io(_)) | Self::Task(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(PipelineError::Store(StoreError::Io(io)).is_fatal());
        assert!(PipelineError::Task(TaskError::NotFound("t".into())).is_fatal());

        assert!(!PipelineError::Store(StoreError::NotFound("a.png".into())).is_fatal());
        assert!(!PipelineError::detection("a.png", "model crashed").is_fatal());
        assert!(!PipelineError::Validation("box".into()).is_fatal());
    }

    #[test]
    fn test_missing_field_message() {
        let err = StoreError::missing_field("image_name");
        assert_eq!(err.to_string(), "Missing required field: image_name");
    }
}
