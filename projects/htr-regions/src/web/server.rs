use crate::cli::Args;
use crate::pipeline::detection::{LineDetector, ProjectionLineDetector};
use crate::pipeline::orchestrator::BatchOrchestrator;
use crate::pipeline::recognition::{BlankRecognizer, CommandRecognizer, TextRecognizer};
use crate::pipeline::tasks::TaskTracker;
use crate::pipeline::worker_pool::WorkerPool;
use crate::store::Storage;
use crate::web::{api, events};
use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Uploads and archive imports can be large scans.
const MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

pub struct AppState {
    pub storage: Arc<Storage>,
    pub tracker: Arc<TaskTracker>,
    pub orchestrator: BatchOrchestrator,
}

impl AppState {
    pub fn new(
        storage: Arc<Storage>,
        detector: Arc<dyn LineDetector>,
        recognizer: Arc<dyn TextRecognizer>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        let tracker = Arc::new(TaskTracker::new());
        let orchestrator = BatchOrchestrator::new(
            storage.clone(),
            tracker.clone(),
            detector,
            recognizer,
            pool,
        );
        Self {
            storage,
            tracker,
            orchestrator,
        }
    }

    /// Opens the data root and starts the worker pool described by `args`.
    pub fn from_args(args: &Args) -> Result<Self> {
        let storage = Arc::new(Storage::open(&args.data_root)?);
        let pool = Arc::new(WorkerPool::new(args.workers, args.queue_depth)?);

        let command = match args.recognizer_cmd.as_deref() {
            Some(line) => CommandRecognizer::from_command_line(line)
                .map_err(|e| anyhow::anyhow!("Invalid recognizer command {:?}: {}", line, e))?,
            None => None,
        };
        let recognizer: Arc<dyn TextRecognizer> = match command {
            Some(cmd) => {
                info!("Using external recognizer {:?}", cmd);
                Arc::new(cmd)
            }
            None => {
                warn!("No recognizer command configured, recognized text will be empty");
                Arc::new(BlankRecognizer)
            }
        };

        Ok(Self::new(
            storage,
            Arc::new(ProjectionLineDetector::default()),
            recognizer,
            pool,
        ))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let images = ServeDir::new(state.storage.images_dir());
    let originals = ServeDir::new(state.storage.originals_dir());

    Router::new()
        .route("/api/images_list", get(api::images_list))
        .route("/api/upload", post(api::upload_images))
        .route("/api/delete", post(api::delete_images))
        .route("/api/save", post(api::save_annotation))
        .route("/api/load/:image", get(api::load_annotation))
        .route("/api/crop", post(api::crop_image))
        .route("/api/images/:image/state", get(api::image_state))
        .route("/api/detect_lines", post(api::detect_lines))
        .route("/api/recognize_text", post(api::recognize_text))
        .route("/api/recognize_progress/:image", get(api::recognize_progress))
        .route("/api/tasks", get(api::list_tasks))
        .route("/api/tasks/:id", get(api::get_task))
        .route("/api/tasks/:id/events", get(events::task_events))
        .route(
            "/api/projects",
            get(api::list_projects).post(api::create_project),
        )
        .route(
            "/api/projects/:name",
            get(api::get_project)
                .put(api::update_project)
                .delete(api::delete_project),
        )
        .route(
            "/api/projects/:name/images",
            get(api::project_images).delete(api::remove_project_image),
        )
        .route(
            "/api/projects/:name/upload_images",
            post(api::upload_project_images),
        )
        .route("/api/projects/:name/batch_detect", post(api::batch_detect))
        .route(
            "/api/projects/:name/batch_recognize",
            post(api::batch_recognize),
        )
        .route("/api/projects/:name/export_zip", get(api::export_zip))
        .route("/api/import_zip", post(api::import_zip))
        .nest_service("/data/images", images)
        .nest_service("/data/originals", originals)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

pub async fn run_server(host: IpAddr, port: u16, state: Arc<AppState>) -> Result<()> {
    let mut current_port = port;
    let listener = loop {
        let addr = SocketAddr::new(host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port
                    .checked_add(1)
                    .ok_or_else(|| anyhow::anyhow!("No available ports found"))?;
            }
        }
    };

    let orchestrator = state.orchestrator.clone();
    let app = router(state);

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "HTR regions server started on http://{:?}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Draining background work");
    tokio::task::spawn_blocking(move || orchestrator.pool().shutdown()).await?;

    Ok(())
}
