//! HTTP API server.
//!
//! Maps the transport-agnostic core surface 1:1 onto JSON endpoints:
//!
//! | Method | Path | Core operation |
//! |--------|------|----------------|
//! | `POST` | `/api/folders` | Ingest a folder URL |
//! | `POST` | `/api/folders/{id}/sync` | Sync a folder against the drive |
//! | `GET`  | `/api/folders/{id}` | Folder snapshot + images (captions cleaned) |
//! | `GET`  | `/api/folders/{id}/search` | Lexical/semantic search |
//! | `POST` | `/api/retry` | Re-queue an image or a folder's retryable rows |
//! | `GET`  | `/api/health` | Store/queue connectivity + queue stats |
//! | `GET`  | `/api/thumbnail/{file_id}` | Thumbnail bytes via the URL cache |
//!
//! # Error Contract
//!
//! Every error response carries:
//!
//! ```json
//! { "error": { "code": "invalid_url", "message": "…" } }
//! ```
//!
//! Codes come straight from the error taxonomy; the mapping to HTTP status
//! lives in one place below.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::app::AppContext;
use crate::drive::clamp_thumbnail_size;
use crate::error::Error;
use crate::ingest::{self, IngestRequest};
use crate::models::{FolderSnapshot, FOLDER_QUEUE, IMAGE_QUEUE};
use crate::queue::QueueCounts;
use crate::recovery::{self, RetryTarget};
use crate::search::{self, clean_caption};
use crate::sync;

pub async fn run_server(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/folders", post(handle_ingest))
        .route("/api/folders/:id", get(handle_get_folder))
        .route("/api/folders/:id/sync", post(handle_sync))
        .route("/api/folders/:id/search", get(handle_search))
        .route("/api/retry", post(handle_retry))
        .route("/api/health", get(handle_health))
        .route("/api/thumbnail/:file_id", get(handle_thumbnail))
        .layer(cors)
        .with_state(ctx);

    info!(bind = %bind_addr, "API server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidInput(_)
            | Error::InvalidUrl(_)
            | Error::EmptyFolder
            | Error::FolderCapExceeded { .. } => StatusCode::BAD_REQUEST,
            Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::QueueUnavailable(_)
            | Error::StoreUnavailable(_)
            | Error::VectorBackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::RateLimitExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::TransientUpstream(_) => StatusCode::BAD_GATEWAY,
            Error::ProcessingFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.0.code(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

// ============ Ingest / Sync ============

#[derive(Deserialize)]
struct IngestBody {
    folder_url: String,
    #[serde(default)]
    credential: Option<String>,
    #[serde(default)]
    user_id: Option<Uuid>,
}

async fn handle_ingest(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<IngestBody>,
) -> Result<Json<FolderSnapshot>, ApiError> {
    let snapshot = ingest::submit(
        &ctx,
        IngestRequest {
            folder_url: body.folder_url,
            user_id: body.user_id,
            credential: body.credential,
        },
    )
    .await?;
    Ok(Json(snapshot))
}

#[derive(Deserialize)]
struct SyncBody {
    #[serde(default)]
    credential: Option<String>,
}

async fn handle_sync(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
    body: Option<Json<SyncBody>>,
) -> Result<Json<crate::models::SyncReport>, ApiError> {
    let credential = body.as_ref().and_then(|b| b.credential.clone());
    let report = sync::sync_folder(&ctx, id, credential.as_deref()).await?;
    Ok(Json(report))
}

// ============ Folder listing ============

#[derive(Serialize)]
struct ImageView {
    id: Uuid,
    name: String,
    mime_type: String,
    status: crate::models::Status,
    thumbnail_url: Option<String>,
    view_url: Option<String>,
    caption: Option<String>,
    tags: Vec<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct FolderDetail {
    #[serde(flatten)]
    folder: FolderSnapshot,
    images: Vec<ImageView>,
}

async fn handle_get_folder(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> Result<Json<FolderDetail>, ApiError> {
    let folder = ctx
        .store
        .get_folder(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("folder {id}")))?;

    let images = ctx
        .store
        .list_images(id)
        .await?
        .into_iter()
        .map(|image| ImageView {
            id: image.id,
            name: image.name,
            mime_type: image.mime_type,
            status: image.status,
            thumbnail_url: image.thumbnail_url,
            view_url: image.view_url,
            caption: image.caption.as_deref().map(clean_caption),
            tags: image
                .tags
                .as_deref()
                .map(|t| t.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            error: image.error,
        })
        .collect();

    Ok(Json(FolderDetail {
        folder: (&folder).into(),
        images,
    }))
}

// ============ Search ============

#[derive(Deserialize)]
struct SearchParams {
    q: String,
    #[serde(default = "default_top_k")]
    top_k: i64,
}

fn default_top_k() -> i64 {
    12
}

async fn handle_search(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
    Query(params): Query<SearchParams>,
) -> Result<Json<search::SearchResponse>, ApiError> {
    // Out-of-range top_k clamps to [1, MAX_TOP_K] inside run_search, the
    // same as the CLI surface.
    let response = search::run_search(&ctx, id, &params.q, params.top_k).await?;
    Ok(Json(response))
}

// ============ Retry ============

#[derive(Deserialize)]
struct RetryBody {
    #[serde(default)]
    image_id: Option<Uuid>,
    #[serde(default)]
    folder_id: Option<Uuid>,
}

#[derive(Serialize)]
struct RetryResponse {
    queued_count: u64,
}

async fn handle_retry(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<RetryBody>,
) -> Result<Json<RetryResponse>, ApiError> {
    let target = match (body.image_id, body.folder_id) {
        (Some(image_id), None) => RetryTarget::Image(image_id),
        (None, Some(folder_id)) => RetryTarget::Folder(folder_id),
        _ => {
            return Err(Error::InvalidInput(
                "exactly one of image_id or folder_id is required".into(),
            )
            .into())
        }
    };
    let queued_count = recovery::retry(&ctx, target).await?;
    Ok(Json(RetryResponse { queued_count }))
}

// ============ Health ============

#[derive(Serialize)]
struct HealthResponse {
    database: &'static str,
    queue: &'static str,
    queue_stats: QueueStats,
}

#[derive(Serialize)]
struct QueueStats {
    folders: QueueCounts,
    images: QueueCounts,
}

async fn handle_health(State(ctx): State<Arc<AppContext>>) -> Json<HealthResponse> {
    let database = if ctx.store.ping().await.is_ok() {
        "ok"
    } else {
        "unavailable"
    };
    let queue = if ctx.queue.ping().await.is_ok() {
        "ok"
    } else {
        "unavailable"
    };
    let folders = ctx.queue.counts(FOLDER_QUEUE).await.unwrap_or_default();
    let images = ctx.queue.counts(IMAGE_QUEUE).await.unwrap_or_default();

    Json(HealthResponse {
        database,
        queue,
        queue_stats: QueueStats { folders, images },
    })
}

// ============ Thumbnail proxy ============

#[derive(Deserialize)]
struct ThumbnailParams {
    #[serde(default = "default_thumb_size")]
    size: u32,
}

fn default_thumb_size() -> u32 {
    220
}

async fn handle_thumbnail(
    State(ctx): State<Arc<AppContext>>,
    Path(file_id): Path<String>,
    Query(params): Query<ThumbnailParams>,
) -> Result<Response, ApiError> {
    let size = clamp_thumbnail_size(params.size);

    let url = ctx
        .thumbs
        .url(ctx.drive.as_ref(), &file_id, size, None)
        .await?;

    let fetched = match fetch_thumbnail(&ctx, &url).await {
        Ok(ok) => ok,
        Err(_) => {
            // The cached URL expired server-side: refresh once and retry.
            ctx.thumbs.invalidate(&file_id, size);
            let url = ctx
                .thumbs
                .url(ctx.drive.as_ref(), &file_id, size, None)
                .await?;
            fetch_thumbnail(&ctx, &url).await?
        }
    };
    let (bytes, content_type) = fetched;

    let ttl_secs = ctx.config.thumbnails.ttl_secs;
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::CACHE_CONTROL,
                format!("public, max-age={ttl_secs}"),
            ),
        ],
        Body::from(bytes),
    )
        .into_response())
}

async fn fetch_thumbnail(ctx: &AppContext, url: &str) -> Result<(Vec<u8>, String), Error> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(ctx.config.thumbnails.fetch_timeout_secs))
        .build()
        .map_err(|e| Error::TransientUpstream(e.to_string()))?;

    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        return Err(Error::NotFound(format!(
            "thumbnail fetch returned {}",
            resp.status()
        )));
    }
    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("image/jpeg")
        .to_string();
    let bytes = resp.bytes().await?.to_vec();
    Ok((bytes, content_type))
}
