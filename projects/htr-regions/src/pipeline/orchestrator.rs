// Batch orchestrator: runs detection / recognition over image sets
//
// Work is handed to the bounded WorkerPool and tracked in the TaskTracker.
// Callers get a task id back immediately and poll for progress.

use crate::error::PipelineError;
use crate::pipeline::crop::{decode_oriented, perform_crop};
use crate::pipeline::detection::LineDetector;
use crate::pipeline::geometry::bounding_box;
use crate::pipeline::merge::{merge_overlapping, polygon_area};
use crate::pipeline::recognition::{recognize_or_empty, TextRecognizer};
use crate::pipeline::simplify::simplify;
use crate::pipeline::tasks::{TaskKind, TaskStatus, TaskTracker};
use crate::pipeline::types::{CropBox, DetectionSettings, Region, Status};
use crate::pipeline::worker_pool::WorkerPool;
use crate::store::Storage;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// What a background run does to each of its images.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub kind: TaskKind,
    pub images: Vec<String>,
    pub settings: DetectionSettings,
    /// Leave images that already carry results of this kind alone.
    pub skip_existing: bool,
}

/// Flags an image as being processed for as long as it lives.
struct BusyGuard<'a> {
    tracker: &'a TaskTracker,
    image: &'a str,
    owned: bool,
}

impl<'a> BusyGuard<'a> {
    fn new(tracker: &'a TaskTracker, image: &'a str) -> Self {
        let owned = tracker.try_mark_busy(image);
        Self {
            tracker,
            image,
            owned,
        }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.tracker.clear_busy(self.image);
        }
    }
}

/// Simplifies, merges and drops degenerate regions, in that order.
pub fn postprocess_regions(regions: Vec<Region>, settings: &DetectionSettings) -> Vec<Region> {
    let regions: Vec<Region> = if settings.simplification > 0.0 {
        regions
            .into_iter()
            .map(|r| Region::new(simplify(&r.points, settings.simplification)))
            .collect()
    } else {
        regions
    };

    let regions = if settings.merge_overlapping {
        merge_overlapping(regions, settings.overlap_threshold)
    } else {
        regions
    };

    regions
        .into_iter()
        .filter(|r| r.points.len() >= 3 && polygon_area(&r.points) > 0.0)
        .collect()
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    pub storage: Arc<Storage>,
    pub tracker: Arc<TaskTracker>,
    pub detector: Arc<dyn LineDetector>,
    pub recognizer: Arc<dyn TextRecognizer>,
    pool: Arc<WorkerPool>,
}

impl BatchOrchestrator {
    pub fn new(
        storage: Arc<Storage>,
        tracker: Arc<TaskTracker>,
        detector: Arc<dyn LineDetector>,
        recognizer: Arc<dyn TextRecognizer>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            storage,
            tracker,
            detector,
            recognizer,
            pool,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Detects lines on one image and stores them as its regions.
    pub fn detect_image(
        &self,
        image_name: &str,
        settings: &DetectionSettings,
    ) -> Result<usize, PipelineError> {
        let bytes = self.storage.images.load_working(image_name)?;
        let raw = self
            .detector
            .detect(image_name, &bytes, settings.threshold)?;
        let raw_count = raw.len();
        let regions = postprocess_regions(raw, settings);
        let count = regions.len();

        self.storage.annotations.update(image_name, |record| {
            record.regions = regions;
            record.status = Status::Segmented;
            record.processing_params = serde_json::to_value(settings).ok();
            Ok::<_, PipelineError>(())
        })?;

        tracing::info!(
            "Stored {} regions for {} ({} raw detections)",
            count,
            image_name,
            raw_count
        );
        Ok(count)
    }

    /// Recognizes every region of one image, reporting per-region progress.
    pub fn recognize_image(&self, image_name: &str) -> Result<usize, PipelineError> {
        let record = self.storage.annotations.load(image_name)?;
        let total = record.regions.len();
        self.tracker.set_image_progress(image_name, 0, total);
        if total == 0 {
            self.tracker.finish_image_progress(image_name);
            return Ok(0);
        }

        let bytes = self.storage.images.load_working(image_name)?;
        let image = decode_oriented(image_name, &bytes)?;

        let mut texts = BTreeMap::new();
        for (i, region) in record.regions.iter().enumerate() {
            let text = match bounding_box(&region.points) {
                Some(bbox) => {
                    recognize_or_empty(self.recognizer.as_ref(), image_name, &image, &bbox)
                }
                None => String::new(),
            };
            texts.insert(i.to_string(), text);
            self.tracker.set_image_progress(image_name, i + 1, total);
        }

        self.storage.annotations.update(image_name, |record| {
            record.texts.extend(texts);
            Ok::<_, PipelineError>(())
        })?;
        self.tracker.finish_image_progress(image_name);

        tracing::info!("Recognized {} regions of {}", total, image_name);
        Ok(total)
    }

    /// Handles one image of a batch. Returns false if the image was skipped.
    fn process_image(&self, job: &BatchJob, image_name: &str) -> Result<bool, PipelineError> {
        let _busy = BusyGuard::new(&self.tracker, image_name);

        if job.skip_existing {
            let record = self.storage.annotations.load(image_name)?;
            let done = match job.kind {
                TaskKind::Detection => !record.regions.is_empty(),
                TaskKind::Recognition => !record.texts.is_empty(),
            };
            if done {
                return Ok(false);
            }
        }

        match job.kind {
            TaskKind::Detection => self.detect_image(image_name, &job.settings)?,
            TaskKind::Recognition => self.recognize_image(image_name)?,
        };
        Ok(true)
    }

    fn drive(&self, task_id: &str, job: &BatchJob) -> Result<(), PipelineError> {
        self.tracker.start(task_id)?;

        for (i, image_name) in job.images.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| self.process_image(job, image_name)));
            match outcome {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    tracing::debug!("Skipping {}, it already has results", image_name)
                }
                Ok(Err(e)) if e.is_fatal() => return Err(e),
                Ok(Err(e)) => tracing::warn!("Task {}: skipped {}: {}", task_id, image_name, e),
                Err(_) => tracing::warn!("Task {}: processing {} panicked", task_id, image_name),
            }
            self.tracker.update_progress(task_id, i + 1, None)?;
        }

        self.tracker
            .update_progress(task_id, job.images.len(), Some(TaskStatus::Completed))?;
        Ok(())
    }

    /// Runs a created task to completion on the current thread.
    pub fn run_task(&self, task_id: &str, job: &BatchJob) {
        tracing::info!(
            "Task {} started: {:?} over {} images",
            task_id,
            job.kind,
            job.images.len()
        );
        match self.drive(task_id, job) {
            Ok(()) => tracing::info!("Task {} completed", task_id),
            Err(e) => {
                tracing::error!("Task {} failed: {}", task_id, e);
                if let Err(mark) = self.tracker.fail(task_id, e.to_string()) {
                    tracing::error!("Could not mark task {} failed: {}", task_id, mark);
                }
            }
        }
    }

    /// Creates a task for `job` and queues it. Returns the task id.
    pub fn submit(&self, job: BatchJob, project: Option<String>) -> Result<String, PipelineError> {
        let task_id = self
            .tracker
            .create(job.kind, job.images.clone(), project);

        let this = self.clone();
        let id = task_id.clone();
        if let Err(e) = self.pool.submit(move || this.run_task(&id, &job)) {
            tracing::warn!(
                "Rejected task {}: {} ({} running, {} queued)",
                task_id,
                e,
                self.pool.active_jobs(),
                self.pool.queued_jobs()
            );
            if let Err(mark) = self.tracker.fail(&task_id, e.to_string()) {
                tracing::error!("Could not mark task {} failed: {}", task_id, mark);
            }
            return Err(e.into());
        }
        Ok(task_id)
    }

    /// Queues a pass over every image of a project, skipping finished images.
    pub fn submit_project(
        &self,
        project_name: &str,
        kind: TaskKind,
        settings: DetectionSettings,
    ) -> Result<String, PipelineError> {
        let project = self.storage.projects.get(project_name)?;
        if project.images.is_empty() {
            return Err(PipelineError::Validation(format!(
                "project {project_name} has no images"
            )));
        }
        self.submit(
            BatchJob {
                kind,
                images: project.images,
                settings,
                skip_existing: true,
            },
            Some(project.name),
        )
    }

    /// Queues a crop. Failures are only logged.
    pub fn submit_crop(&self, image_name: &str, crop_box: CropBox) -> Result<(), PipelineError> {
        if image_name.is_empty() {
            return Err(PipelineError::Validation("image_name is required".into()));
        }
        let this = self.clone();
        let image = image_name.to_string();
        self.pool.submit(move || {
            let _busy = BusyGuard::new(&this.tracker, &image);
            if let Err(e) = perform_crop(&this.storage, &image, &crop_box) {
                tracing::warn!("Crop of {} failed: {}", image, e);
            }
        })?;
        Ok(())
    }
}
