// Annotation processing: geometry, crop, detection post-processing, tasks

pub mod crop;
pub mod detection;
pub mod geometry;
pub mod merge;
pub mod orchestrator;
pub mod recognition;
pub mod simplify;
pub mod tasks;
pub mod types;
pub mod worker_pool;
