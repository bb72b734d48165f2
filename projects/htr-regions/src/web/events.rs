// Server-sent task progress

use crate::pipeline::tasks::{Task, TaskTracker};
use crate::web::api::ApiError;
use crate::web::server::AppState;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Snapshots of a task each time it changes, ending with its terminal state.
pub fn progress_stream(
    tracker: Arc<TaskTracker>,
    id: String,
    interval: Duration,
) -> impl Stream<Item = Task> {
    async_stream::stream! {
        let mut last: Option<Task> = None;
        while let Some(task) = tracker.get(&id) {
            let terminal = task.status.is_terminal();
            if last.as_ref() != Some(&task) {
                yield task.clone();
            }
            if terminal {
                break;
            }
            last = Some(task);
            tokio::time::sleep(interval).await;
        }
    }
}

pub async fn task_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if state.tracker.get(&id).is_none() {
        return Err(ApiError::NotFound(format!("Unknown task {id}")));
    }

    let snapshots = progress_stream(state.tracker.clone(), id, POLL_INTERVAL);
    let events = snapshots.filter_map(|task| async move {
        match Event::default().event("progress").json_data(&task) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                tracing::warn!("Dropping task snapshot {}: {}", task.id, e);
                None
            }
        }
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
