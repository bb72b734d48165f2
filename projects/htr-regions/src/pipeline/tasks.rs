// Task registry: tracks background detection/recognition batches
//
// Owned by the application state and shared as Arc<TaskTracker>. Callers only
// ever see cloned snapshots; all mutation happens through the methods below.

use crate::error::TaskError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Detection,
    Recognition,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn can_move_to(self, next: TaskStatus) -> bool {
        !self.is_terminal() && !(self == Self::Running && next == Self::Pending)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub status: TaskStatus,
    pub completed: usize,
    pub total: usize,
    pub percentage: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

fn percentage(completed: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    (completed.saturating_mul(100) / total) as u32
}

/// Progress of a single image's recognition, region by region.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ImageProgress {
    pub completed: usize,
    pub total: usize,
    pub percentage: u32,
    pub done: bool,
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<String, Task>,
    order: Vec<String>,
}

/// In-memory registry of tasks plus per-image activity indicators.
///
/// Tasks are kept for the life of the process.
#[derive(Default)]
pub struct TaskTracker {
    registry: RwLock<Registry>,
    image_progress: RwLock<HashMap<String, ImageProgress>>,
    busy: RwLock<HashSet<String>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, kind: TaskKind, images: Vec<String>, project: Option<String>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let task = Task {
            id: id.clone(),
            kind,
            total: images.len(),
            images,
            project,
            status: TaskStatus::Pending,
            completed: 0,
            percentage: 0,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        tracing::info!(
            "Created {:?} task {} over {} images",
            kind,
            id,
            task.total
        );
        let mut registry = write(&self.registry);
        registry.order.push(id.clone());
        registry.tasks.insert(id.clone(), task);
        id
    }

    /// Records `completed` images and optionally moves the task to `status`.
    ///
    /// The completed count never goes backwards and never exceeds the total.
    pub fn update_progress(
        &self,
        id: &str,
        completed: usize,
        status: Option<TaskStatus>,
    ) -> Result<Task, TaskError> {
        self.apply(id, completed, status, None)
    }

    fn apply(
        &self,
        id: &str,
        completed: usize,
        status: Option<TaskStatus>,
        error: Option<String>,
    ) -> Result<Task, TaskError> {
        let mut registry = write(&self.registry);
        let task = registry
            .tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        if task.status.is_terminal() {
            return Err(TaskError::Finalized(id.to_string()));
        }
        if let Some(next) = status {
            if !task.status.can_move_to(next) {
                return Err(TaskError::InvalidTransition {
                    id: id.to_string(),
                    from: task.status.as_str().to_string(),
                    to: next.as_str().to_string(),
                });
            }
        }

        let now = Utc::now();
        task.completed = task.completed.max(completed).min(task.total);
        task.percentage = percentage(task.completed, task.total);
        task.updated_at = now;
        if let Some(next) = status {
            task.status = next;
            if next.is_terminal() {
                task.finished_at = Some(now);
            }
        }
        if error.is_some() {
            task.error = error;
        }
        Ok(task.clone())
    }

    pub fn start(&self, id: &str) -> Result<Task, TaskError> {
        self.update_progress(id, 0, Some(TaskStatus::Running))
    }

    /// Marks the task failed, keeping the last recorded completed count.
    pub fn fail(&self, id: &str, message: impl Into<String>) -> Result<Task, TaskError> {
        self.apply(id, 0, Some(TaskStatus::Failed), Some(message.into()))
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        read(&self.registry).tasks.get(id).cloned()
    }

    /// All tasks, oldest first.
    pub fn list(&self) -> Vec<Task> {
        let registry = read(&self.registry);
        registry
            .order
            .iter()
            .filter_map(|id| registry.tasks.get(id).cloned())
            .collect()
    }

    pub fn set_image_progress(&self, image: &str, completed: usize, total: usize) {
        write(&self.image_progress).insert(
            image.to_string(),
            ImageProgress {
                completed,
                total,
                percentage: percentage(completed, total),
                done: false,
            },
        );
    }

    pub fn finish_image_progress(&self, image: &str) {
        if let Some(progress) = write(&self.image_progress).get_mut(image) {
            progress.done = true;
        }
    }

    pub fn image_progress(&self, image: &str) -> Option<ImageProgress> {
        read(&self.image_progress).get(image).cloned()
    }

    /// Claims the image for a background operation. False if it is already claimed.
    pub fn try_mark_busy(&self, image: &str) -> bool {
        write(&self.busy).insert(image.to_string())
    }

    pub fn clear_busy(&self, image: &str) {
        write(&self.busy).remove(image);
    }

    pub fn is_busy(&self, image: &str) -> bool {
        read(&self.busy).contains(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn images(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("img_{i}.png")).collect()
    }

    #[test]
    fn test_create_seeds_pending_task() {
        let tracker = TaskTracker::new();
        let id = tracker.create(TaskKind::Detection, images(3), Some("proj".into()));
        let task = tracker.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.completed, 0);
        assert_eq!(task.total, 3);
        assert_eq!(task.percentage, 0);
        assert_eq!(task.project.as_deref(), Some("proj"));
    }

    #[test]
    fn test_ids_are_unique() {
        let tracker = TaskTracker::new();
        let a = tracker.create(TaskKind::Detection, images(1), None);
        let b = tracker.create(TaskKind::Detection, images(1), None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_progress_percentage_scenario() {
        let tracker = TaskTracker::new();
        let id = tracker.create(TaskKind::Recognition, images(4), None);

        tracker.update_progress(&id, 2, None).unwrap();
        assert_eq!(tracker.get(&id).unwrap().percentage, 50);

        tracker
            .update_progress(&id, 4, Some(TaskStatus::Completed))
            .unwrap();
        let task = tracker.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.percentage, 100);
        assert!(task.finished_at.is_some());
    }

    #[test]
    fn test_percentage_floors_and_guards_zero_total() {
        let tracker = TaskTracker::new();
        let id = tracker.create(TaskKind::Detection, images(3), None);
        assert_eq!(tracker.update_progress(&id, 1, None).unwrap().percentage, 33);

        let empty = tracker.create(TaskKind::Detection, vec![], None);
        assert_eq!(tracker.update_progress(&empty, 0, None).unwrap().percentage, 0);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let tracker = TaskTracker::new();
        let id = tracker.create(TaskKind::Detection, images(2), None);
        tracker.start(&id).unwrap();
        tracker.update_progress(&id, 1, None).unwrap();
        let failed = tracker.fail(&id, "image list unavailable").unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.completed, 1);
        assert_eq!(failed.error.as_deref(), Some("image list unavailable"));

        assert_eq!(
            tracker.update_progress(&id, 2, Some(TaskStatus::Completed)),
            Err(TaskError::Finalized(id.clone()))
        );
        assert_eq!(tracker.get(&id).unwrap().completed, 1);
    }

    #[test]
    fn test_running_cannot_go_back_to_pending() {
        let tracker = TaskTracker::new();
        let id = tracker.create(TaskKind::Detection, images(2), None);
        tracker.start(&id).unwrap();
        assert!(matches!(
            tracker.update_progress(&id, 0, Some(TaskStatus::Pending)),
            Err(TaskError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_progress_never_decreases() {
        let tracker = TaskTracker::new();
        let id = tracker.create(TaskKind::Detection, images(5), None);
        tracker.update_progress(&id, 3, None).unwrap();
        assert_eq!(tracker.update_progress(&id, 1, None).unwrap().completed, 3);
        assert_eq!(tracker.update_progress(&id, 9, None).unwrap().completed, 5);
    }

    #[test]
    fn test_unknown_task() {
        let tracker = TaskTracker::new();
        assert!(tracker.get("nonexistent-task-id").is_none());
        assert_eq!(
            tracker.update_progress("nope", 1, None),
            Err(TaskError::NotFound("nope".into()))
        );
    }

    #[test]
    fn test_list_keeps_creation_order() {
        let tracker = TaskTracker::new();
        let ids: Vec<String> = (0..5)
            .map(|_| tracker.create(TaskKind::Detection, images(1), None))
            .collect();
        let listed: Vec<String> = tracker.list().into_iter().map(|t| t.id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn test_concurrent_updates() {
        let tracker = Arc::new(TaskTracker::new());
        let ids: Vec<String> = (0..8)
            .map(|_| tracker.create(TaskKind::Detection, images(100), None))
            .collect();

        let handles: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    tracker.start(&id).unwrap();
                    for i in 1..=100 {
                        tracker.update_progress(&id, i, None).unwrap();
                    }
                    tracker
                        .update_progress(&id, 100, Some(TaskStatus::Completed))
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for id in ids {
            let task = tracker.get(&id).unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
            assert_eq!(task.percentage, 100);
        }
    }

    #[test]
    fn test_image_progress_and_busy_flags() {
        let tracker = TaskTracker::new();
        assert!(tracker.image_progress("a.png").is_none());

        tracker.set_image_progress("a.png", 1, 4);
        let p = tracker.image_progress("a.png").unwrap();
        assert_eq!((p.completed, p.total, p.percentage, p.done), (1, 4, 25, false));
        tracker.finish_image_progress("a.png");
        assert!(tracker.image_progress("a.png").unwrap().done);

        assert!(tracker.try_mark_busy("a.png"));
        assert!(!tracker.try_mark_busy("a.png"));
        assert!(tracker.is_busy("a.png"));
        tracker.clear_busy("a.png");
        assert!(!tracker.is_busy("a.png"));
    }
}
