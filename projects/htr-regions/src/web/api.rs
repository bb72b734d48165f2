use crate::error::{FormatError, PipelineError, StoreError, TaskError};
use crate::formats::archive::{export_project, import_archive};
use crate::pipeline::orchestrator::BatchJob;
use crate::pipeline::tasks::{ImageProgress, Task, TaskKind};
use crate::pipeline::types::{CropBox, DetectionSettings, ListingStatus, Record, RecordPatch, Status};
use crate::store::blob::MemoryFile;
use crate::store::projects::{Project, ProjectUpdate};
use crate::store::Storage;
use crate::web::server::AppState;
use axum::{
    async_trait,
    extract::{
        multipart::MultipartError, rejection::JsonRejection, FromRequest, Multipart, Path, Request,
        State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Handler error, rendered as `{"status": "error", "msg": ...}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest(m) | Self::NotFound(m) | Self::Unavailable(m) | Self::Internal(m) => m,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.message());
        }
        (status, Json(json!({"status": "error", "msg": self.message()}))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => Self::NotFound(e.to_string()),
            StoreError::MissingField { .. }
            | StoreError::InvalidName(_)
            | StoreError::AlreadyExists(_) => Self::BadRequest(e.to_string()),
            StoreError::Io(_) | StoreError::Json(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Validation(m) => Self::BadRequest(m),
            PipelineError::Store(e) => e.into(),
            PipelineError::Pool(_) => Self::Unavailable(e.to_string()),
            PipelineError::Task(TaskError::NotFound(_)) => Self::NotFound(e.to_string()),
            _ => Self::Internal(e.to_string()),
        }
    }
}

impl From<FormatError> for ApiError {
    fn from(e: FormatError) -> Self {
        match e {
            FormatError::Store(e) => e.into(),
            FormatError::InvalidFormat { .. }
            | FormatError::Xml(_)
            | FormatError::XmlAttr(_)
            | FormatError::Zip(_) => Self::BadRequest(e.to_string()),
            FormatError::Io(_) | FormatError::Image(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::BadRequest(format!("Invalid request body: {}", e.body_text()))
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        Self::BadRequest(format!("Invalid upload: {e}"))
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Background job failed: {e}"))
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// JSON request body; malformed or mistyped bodies become [`ApiError::BadRequest`].
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

fn require_image(storage: &Storage, image_name: &str) -> ApiResult<()> {
    if image_name.is_empty() {
        return Err(ApiError::BadRequest("Missing image_name".into()));
    }
    if !storage.images.exists(image_name) {
        return Err(ApiError::NotFound(format!("Unknown image {image_name}")));
    }
    Ok(())
}

/// File name without any client-side directories.
fn base_name(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or(name).to_string()
}

async fn read_files(multipart: &mut Multipart) -> ApiResult<Vec<MemoryFile>> {
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let Some(file_name) = field.file_name().map(base_name) else {
            continue;
        };
        let bytes = field.bytes().await?;
        files.push(MemoryFile::new(file_name, bytes.to_vec()));
    }
    Ok(files)
}

/// Stores uploads, skipping files the library refuses.
fn store_files(storage: &Storage, files: &[MemoryFile]) -> ApiResult<Vec<String>> {
    let mut stored = Vec::new();
    for file in files {
        match storage.images.add(file) {
            Ok(name) => stored.push(name),
            Err(StoreError::InvalidName(name)) => {
                tracing::warn!("Rejected upload {:?}", name);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(stored)
}

// --- Images and annotations ---

pub async fn images_list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.storage.images.list()?))
}

pub async fn upload_images(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let files = read_files(&mut multipart).await?;
    let stored = store_files(&state.storage, &files)?;
    Ok(Json(json!({"status": "success", "count": stored.len()})))
}

#[derive(Deserialize)]
pub struct DeleteRequest {
    #[serde(default)]
    pub filenames: Vec<String>,
}

pub async fn delete_images(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<DeleteRequest>,
) -> ApiResult<Json<Value>> {
    let deleted = state.storage.delete_images(&req.filenames)?;
    Ok(Json(json!({"status": "success", "deleted": deleted})))
}

pub async fn save_annotation(
    State(state): State<Arc<AppState>>,
    ApiJson(patch): ApiJson<RecordPatch>,
) -> ApiResult<Json<Value>> {
    if patch.image_name.as_deref().map_or(true, str::is_empty) {
        return Err(ApiError::BadRequest("Missing filename (image_name)".into()));
    }
    state.storage.annotations.save_patch(patch)?;
    Ok(Json(json!({"status": "success"})))
}

pub async fn load_annotation(
    State(state): State<Arc<AppState>>,
    Path(image): Path<String>,
) -> ApiResult<Json<Record>> {
    Ok(Json(state.storage.annotations.load(&image)?))
}

#[derive(Deserialize)]
pub struct CropRequest {
    #[serde(default)]
    pub image_name: String,
    #[serde(rename = "box", default)]
    pub crop_box: Option<CropBox>,
}

pub async fn crop_image(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<CropRequest>,
) -> ApiResult<Json<Value>> {
    if req.image_name.is_empty() {
        return Err(ApiError::BadRequest("Missing image_name".into()));
    }
    let crop_box = req
        .crop_box
        .ok_or_else(|| ApiError::BadRequest("Missing box".into()))?;
    require_image(&state.storage, &req.image_name)?;
    state.orchestrator.submit_crop(&req.image_name, crop_box)?;
    Ok(Json(json!({"status": "success"})))
}

#[derive(Serialize, Debug)]
pub struct ImageState {
    pub image_name: String,
    pub busy: bool,
    pub status: ListingStatus,
    pub record_status: Status,
}

pub async fn image_state(
    State(state): State<Arc<AppState>>,
    Path(image): Path<String>,
) -> ApiResult<Json<ImageState>> {
    let record = state.storage.annotations.load_existing(&image)?;
    Ok(Json(ImageState {
        busy: state.tracker.is_busy(&image),
        status: Record::listing_status(record.as_ref()),
        record_status: record.map(|r| r.status).unwrap_or_default(),
        image_name: image,
    }))
}

// --- Single-image background work ---

#[derive(Deserialize)]
pub struct ImageRequest {
    #[serde(default)]
    pub image_name: String,
}

#[derive(Deserialize)]
pub struct DetectRequest {
    #[serde(default)]
    pub image_name: String,
    #[serde(default)]
    pub settings: Option<DetectionSettings>,
}

fn submit_single(
    state: &AppState,
    kind: TaskKind,
    image_name: String,
    settings: DetectionSettings,
) -> ApiResult<Json<Value>> {
    require_image(&state.storage, &image_name)?;
    let job = BatchJob {
        kind,
        images: vec![image_name],
        settings,
        skip_existing: false,
    };
    let task_id = state.orchestrator.submit(job, None)?;
    Ok(Json(json!({"status": "success", "task_id": task_id})))
}

pub async fn detect_lines(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<DetectRequest>,
) -> ApiResult<Json<Value>> {
    submit_single(
        &state,
        TaskKind::Detection,
        req.image_name,
        req.settings.unwrap_or_default(),
    )
}

pub async fn recognize_text(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<ImageRequest>,
) -> ApiResult<Json<Value>> {
    submit_single(
        &state,
        TaskKind::Recognition,
        req.image_name,
        DetectionSettings::default(),
    )
}

pub async fn recognize_progress(
    State(state): State<Arc<AppState>>,
    Path(image): Path<String>,
) -> Json<ImageProgress> {
    Json(
        state
            .tracker
            .image_progress(&image)
            .unwrap_or(ImageProgress {
                completed: 0,
                total: 0,
                percentage: 0,
                done: false,
            }),
    )
}

// --- Tasks ---

pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<Task>> {
    Json(state.tracker.list())
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    state
        .tracker
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown task {id}")))
}

// --- Projects ---

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

pub async fn list_projects(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Project>>> {
    Ok(Json(state.storage.projects.list()?))
}

pub async fn create_project(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let project = state.storage.projects.create(&req.name, &req.description)?;
    Ok((StatusCode::CREATED, Json(project)))
}

pub async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Project>> {
    Ok(Json(state.storage.projects.get(&name)?))
}

pub async fn update_project(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    ApiJson(update): ApiJson<ProjectUpdate>,
) -> ApiResult<Json<Project>> {
    Ok(Json(state.storage.projects.update(&name, update)?))
}

pub async fn delete_project(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    state.storage.projects.delete(&name)?;
    Ok(Json(json!({"status": "success"})))
}

#[derive(Serialize, Debug, PartialEq)]
pub struct ProjectImage {
    pub name: String,
    pub status: ListingStatus,
    pub busy: bool,
}

pub async fn project_images(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<ProjectImage>>> {
    let project = state.storage.projects.get(&name)?;
    let mut images = Vec::with_capacity(project.images.len());
    for image in project.images {
        let record = state.storage.annotations.load_existing(&image)?;
        images.push(ProjectImage {
            status: Record::listing_status(record.as_ref()),
            busy: state.tracker.is_busy(&image),
            name: image,
        });
    }
    Ok(Json(images))
}

pub async fn remove_project_image(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    ApiJson(req): ApiJson<ImageRequest>,
) -> ApiResult<Json<Project>> {
    if req.image_name.is_empty() {
        return Err(ApiError::BadRequest("Missing image_name".into()));
    }
    Ok(Json(
        state.storage.projects.remove_image(&name, &req.image_name)?,
    ))
}

pub async fn upload_project_images(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    state.storage.projects.get(&name)?;
    let files = read_files(&mut multipart).await?;
    let stored = store_files(&state.storage, &files)?;
    state.storage.projects.add_images(&name, &stored)?;
    Ok(Json(
        json!({"status": "success", "count": stored.len(), "images": stored}),
    ))
}

#[derive(Deserialize, Default)]
pub struct BatchDetectRequest {
    #[serde(default)]
    pub settings: DetectionSettings,
}

pub async fn batch_detect(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<BatchDetectRequest>>,
) -> ApiResult<Json<Value>> {
    let settings = body.map(|Json(req)| req.settings).unwrap_or_default();
    let task_id = state
        .orchestrator
        .submit_project(&name, TaskKind::Detection, settings)?;
    Ok(Json(json!({"status": "success", "task_id": task_id})))
}

pub async fn batch_recognize(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let task_id = state.orchestrator.submit_project(
        &name,
        TaskKind::Recognition,
        DetectionSettings::default(),
    )?;
    Ok(Json(json!({"status": "success", "task_id": task_id})))
}

// --- Archives ---

pub async fn export_zip(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let storage = state.storage.clone();
    let project = name.clone();
    let bytes = tokio::task::spawn_blocking(move || export_project(&storage, &project)).await??;

    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.zip\"", base_name(&name)),
        ),
    ];
    Ok((headers, bytes).into_response())
}

pub async fn import_zip(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let mut archive: Option<(String, Vec<u8>)> = None;
    let mut simplify = 0.0;
    let mut project_name: Option<String> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field
                    .file_name()
                    .map(base_name)
                    .unwrap_or_else(|| "import.zip".to_string());
                archive = Some((file_name, field.bytes().await?.to_vec()));
            }
            "simplify" => {
                let text = field.text().await?;
                simplify = text.trim().parse().unwrap_or(0.0);
            }
            "project_name" => {
                let text = field.text().await?;
                project_name = Some(text.trim().to_string()).filter(|s| !s.is_empty());
            }
            _ => {}
        }
    }

    let (archive_name, bytes) =
        archive.ok_or_else(|| ApiError::BadRequest("No file uploaded".into()))?;
    let storage = state.storage.clone();
    let summary = tokio::task::spawn_blocking(move || {
        import_archive(
            &storage,
            &bytes,
            &archive_name,
            simplify,
            project_name.as_deref(),
        )
    })
    .await??;

    Ok(Json(json!({
        "status": "success",
        "count": summary.imported.len(),
        "project": summary.project,
        "images": summary.imported,
    })))
}
