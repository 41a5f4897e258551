//! HTTP routes and the progress WebSocket.
//!
//! Handlers stay thin: parse the request, call one service, map the result.
//! Every error leaves as `{"error": message}` with a status derived from the
//! service error kind.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{
        Path as AxumPath, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use futures_util::{SinkExt, StreamExt};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::chat::{ChatReply, ChatService};
use crate::download::DownloadTask;
use crate::error::ServiceError;
use crate::notes::{NoteDraft, NoteService};
use crate::orchestrator::{BatchError, BatchOrchestrator, BatchRequest, TaskId};
use crate::progress::{ACK_MESSAGE, ProgressChannel, PushEvent, Subscription};
use crate::provider::{
    LlmProvider, MediaFetcher, MediaFormat, MetadataProvider, PlaylistMetadata, Resolution,
    TranscriptProvider,
};
use crate::resolver::{MetadataResolver, Transcript};
use crate::store::{
    ChatRecord, DownloadEntry, NoteActivity, NoteActivityDetail, NoteRecord, Store, VideoRecord,
};

const HISTORY_LIMIT: u32 = 50;
const DEFAULT_LANGUAGE: &str = "en";

/// External collaborators the application is wired against.
#[derive(Clone)]
pub struct Providers {
    pub metadata: Arc<dyn MetadataProvider>,
    pub transcripts: Arc<dyn TranscriptProvider>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub llm: Arc<dyn LlmProvider>,
}

#[derive(Clone)]
pub struct AppState {
    resolver: MetadataResolver,
    downloads: DownloadTask,
    orchestrator: BatchOrchestrator,
    progress: ProgressChannel,
    notes: NoteService,
    chat: ChatService,
    downloads_dir: Arc<PathBuf>,
}

impl AppState {
    pub fn new(
        store: Store,
        providers: Providers,
        progress: ProgressChannel,
        downloads_dir: PathBuf,
    ) -> Self {
        let resolver = MetadataResolver::new(store.clone(), providers.metadata, providers.transcripts);
        let downloads = DownloadTask::new(providers.fetcher, store);
        let orchestrator = BatchOrchestrator::new(
            resolver.clone(),
            downloads.clone(),
            Arc::new(progress.clone()),
        );
        Self {
            notes: NoteService::new(resolver.clone(), providers.llm.clone()),
            chat: ChatService::new(resolver.clone(), providers.llm),
            resolver,
            downloads,
            orchestrator,
            progress,
            downloads_dir: Arc::new(downloads_dir),
        }
    }

    pub fn progress(&self) -> &ProgressChannel {
        &self.progress
    }

    fn store(&self) -> &Store {
        self.resolver.store()
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    task_id: Option<TaskId>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            task_id: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(message) => Self::bad_request(message),
            ServiceError::NotFound(message) => Self::not_found(message),
            ServiceError::Provider(err) => Self::new(StatusCode::BAD_GATEWAY, err.to_string()),
            ServiceError::Store(err) => {
                error!(error = %format!("{err:#}"), "storage failure");
                Self::internal("storage failure")
            }
        }
    }
}

impl From<BatchError> for ApiError {
    fn from(err: BatchError) -> Self {
        match err {
            BatchError::Invalid(message) => Self::bad_request(message),
            BatchError::Rejected {
                task_id, message, ..
            } => Self {
                status: StatusCode::NOT_FOUND,
                message,
                task_id: Some(task_id),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.task_id {
            Some(task_id) => json!({"error": self.message, "task_id": task_id}),
            None => json!({"error": self.message}),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/youtube/metadata", get(video_metadata))
        .route("/api/youtube/playlist", get(playlist_metadata))
        .route("/api/youtube/transcript", get(transcript))
        .route("/api/youtube/download", post(download_video))
        .route("/api/youtube/download/batch", post(download_batch))
        .route("/api/youtube/ws", get(progress_socket))
        .route("/api/notes", post(save_note).get(list_notes))
        .route("/api/notes/{id}", put(update_note).delete(delete_note))
        .route("/api/chat", post(chat).get(chat_history))
        .route("/api/history", get(note_history))
        .route("/api/history/{id}", get(note_history_detail))
        .route("/api/downloads", get(list_downloads))
        .route("/api/downloads/{id}", get(get_download))
        .route("/api/downloads/{id}/file", get(download_file))
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn fallback() -> ApiError {
    ApiError::not_found("endpoint not found")
}

async fn root() -> Json<Value> {
    Json(json!({"message": "YouGen API", "status": "online"}))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

#[derive(Debug, Deserialize)]
struct UrlQuery {
    url: String,
}

#[derive(Debug, Deserialize)]
struct VideoUrlQuery {
    video_url: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptQuery {
    video_id: String,
    #[serde(default)]
    language: Option<String>,
}

async fn video_metadata(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> ApiResult<Json<VideoRecord>> {
    Ok(Json(state.resolver.resolve_video(&query.url).await?))
}

async fn playlist_metadata(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> ApiResult<Json<PlaylistMetadata>> {
    Ok(Json(state.resolver.resolve_playlist(&query.url).await?))
}

async fn transcript(
    State(state): State<AppState>,
    Query(query): Query<TranscriptQuery>,
) -> ApiResult<Json<Transcript>> {
    let language = query.language.as_deref().unwrap_or(DEFAULT_LANGUAGE);
    Ok(Json(
        state
            .resolver
            .resolve_transcript(&query.video_id, language)
            .await?,
    ))
}

/// Clients send resolutions either as `720`, `"720"` or `"720p"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResolutionInput {
    Height(u32),
    Text(String),
}

fn parse_media_options(
    format: &str,
    resolution: Option<&ResolutionInput>,
) -> ApiResult<(MediaFormat, Option<Resolution>)> {
    let format: MediaFormat = format.parse().map_err(ApiError::bad_request)?;
    if format.is_audio() {
        return Ok((format, None));
    }
    let resolution = match resolution {
        None => None,
        Some(ResolutionInput::Height(height)) => {
            Some(height.to_string().parse().map_err(ApiError::bad_request)?)
        }
        Some(ResolutionInput::Text(text)) if text.trim().is_empty() => None,
        Some(ResolutionInput::Text(text)) => Some(text.parse().map_err(ApiError::bad_request)?),
    };
    Ok((format, resolution))
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    video_url: String,
    format: String,
    #[serde(default)]
    resolution: Option<ResolutionInput>,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    download_id: i64,
    video_id: String,
    file_url: String,
    title: String,
    size: u64,
    format: MediaFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolution: Option<String>,
}

async fn download_video(
    State(state): State<AppState>,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadResponse>> {
    let (format, resolution) = parse_media_options(&request.format, request.resolution.as_ref())?;
    let video = state.resolver.resolve_video(&request.video_url).await?;
    let result = state
        .downloads
        .run(&video.video_id, format, resolution)
        .await
        .map_err(ServiceError::from)?;
    Ok(Json(DownloadResponse {
        download_id: result.record_id,
        file_url: format!("/api/downloads/{}/file", result.record_id),
        video_id: result.video_id,
        title: result.title,
        size: result.size,
        format,
        resolution: resolution.map(|res| format!("{res}p")),
    }))
}

#[derive(Debug, Deserialize)]
struct BatchDownloadRequest {
    playlist_url: String,
    format: String,
    #[serde(default)]
    resolution: Option<ResolutionInput>,
}

#[derive(Debug, Serialize)]
struct BatchDownloadResponse {
    task_id: TaskId,
    total_videos: usize,
}

async fn download_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchDownloadRequest>,
) -> ApiResult<Json<BatchDownloadResponse>> {
    let (format, resolution) = parse_media_options(&request.format, request.resolution.as_ref())?;
    let accepted = state
        .orchestrator
        .start(BatchRequest {
            playlist_url: request.playlist_url,
            format,
            resolution,
        })
        .await?;
    Ok(Json(BatchDownloadResponse {
        task_id: accepted.task_id,
        total_videos: accepted.total_videos,
    }))
}

async fn progress_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let channel = state.progress.clone();
    ws.on_upgrade(move |socket| serve_progress(socket, channel))
}

/// Pumps queued events to the client and acknowledges client text frames.
/// The subscriber is removed however the loop ends.
async fn serve_progress(socket: WebSocket, channel: ProgressChannel) {
    let Subscription { id, mut events } = channel.connect();
    info!(connection_id = %id, "progress socket connected");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(connection_id = %id, error = %err, "unserializable event skipped");
                        continue;
                    }
                };
                if let Err(err) = sender.send(Message::Text(text.into())).await {
                    debug!(connection_id = %id, error = %err, "send failed");
                    break;
                }
            }
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(_))) => {
                    channel.send_to(id, PushEvent::Ack { message: ACK_MESSAGE.to_string() });
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(connection_id = %id, error = %err, "receive failed");
                    break;
                }
            }
        }
    }

    channel.disconnect(id);
    info!(connection_id = %id, "progress socket closed");
}

#[derive(Debug, Deserialize)]
struct SaveNoteRequest {
    video_url: String,
    content: Value,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct UpdateNoteRequest {
    content: Value,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

async fn save_note(
    State(state): State<AppState>,
    Json(request): Json<SaveNoteRequest>,
) -> ApiResult<Json<NoteRecord>> {
    let draft = NoteDraft::new(
        request.content,
        request.timestamp,
        request.tags.unwrap_or_default(),
    );
    Ok(Json(state.notes.save(&request.video_url, draft).await?))
}

async fn list_notes(
    State(state): State<AppState>,
    Query(query): Query<VideoUrlQuery>,
) -> ApiResult<Json<Vec<NoteRecord>>> {
    Ok(Json(state.notes.list(&query.video_url).await?))
}

async fn update_note(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    Json(request): Json<UpdateNoteRequest>,
) -> ApiResult<Json<NoteRecord>> {
    let draft = NoteDraft::new(
        request.content,
        request.timestamp,
        request.tags.unwrap_or_default(),
    );
    Ok(Json(state.notes.update(id, draft).await?))
}

async fn delete_note(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<StatusCode> {
    state.notes.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    video_url: String,
    message: String,
    #[serde(default)]
    language: Option<String>,
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Json<ChatReply>> {
    let language = request.language.as_deref().unwrap_or(DEFAULT_LANGUAGE);
    Ok(Json(
        state
            .chat
            .ask(&request.video_url, &request.message, language)
            .await?,
    ))
}

async fn chat_history(
    State(state): State<AppState>,
    Query(query): Query<VideoUrlQuery>,
) -> ApiResult<Json<Vec<ChatRecord>>> {
    Ok(Json(state.chat.history(&query.video_url).await?))
}

async fn note_history(State(state): State<AppState>) -> ApiResult<Json<Vec<NoteActivity>>> {
    let activity = state
        .store()
        .list_note_activity(HISTORY_LIMIT)
        .await
        .map_err(ServiceError::from)?;
    Ok(Json(activity))
}

async fn note_history_detail(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<NoteActivityDetail>> {
    state
        .store()
        .get_note_activity(id)
        .await
        .map_err(ServiceError::from)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("note {id} not found")))
}

async fn list_downloads(State(state): State<AppState>) -> ApiResult<Json<Vec<DownloadEntry>>> {
    let entries = state
        .store()
        .list_downloads(HISTORY_LIMIT)
        .await
        .map_err(ServiceError::from)?;
    Ok(Json(entries))
}

async fn find_download(state: &AppState, id: i64) -> ApiResult<DownloadEntry> {
    state
        .store()
        .get_download(id)
        .await
        .map_err(ServiceError::from)?
        .ok_or_else(|| ApiError::not_found(format!("download {id} not found")))
}

async fn get_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<DownloadEntry>> {
    Ok(Json(find_download(&state, id).await?))
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Response> {
    let entry = find_download(&state, id).await?;
    let path = confine_to(&state.downloads_dir, Path::new(&entry.file_path)).await?;
    stream_file(&path).await
}

/// Canonical form of `path`, provided it lives under `root`.
async fn confine_to(root: &Path, path: &Path) -> ApiResult<PathBuf> {
    let missing = || ApiError::not_found("file not found");
    let root = tokio::fs::canonicalize(root).await.map_err(|_| missing())?;
    let path = tokio::fs::canonicalize(path).await.map_err(|_| missing())?;
    if !path.starts_with(&root) {
        warn!(path = %path.display(), "download record points outside the downloads directory");
        return Err(missing());
    }
    Ok(path)
}

async fn stream_file(path: &Path) -> ApiResult<Response> {
    let file = File::open(path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, size.into());
    if let Some(mime) = MimeGuess::from_path(path).first()
        && let Ok(value) = mime.to_string().parse()
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Some(name) = path.file_name().and_then(|name| name.to_str())
        && let Ok(value) = format!("attachment; filename=\"{name}\"").parse()
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}
