//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/upload-video` | Multipart upload, field `file` |
//! | `POST` | `/uploads` | Raw body upload; `?filename=` or `X-Filename` |
//! | `GET`  | `/jobs` | Recent jobs (`?limit=`) |
//! | `GET`  | `/jobs/{id}` | Job snapshot |
//! | `POST` | `/jobs/{id}/cancel` | Request cancellation |
//! | `GET`  | `/graph` | Bounded snapshot (`?limit=`, default 100) |
//! | `GET`  | `/graph/nodes/{key}` | Node by natural key |
//! | `GET`  | `/graph/nodes/{key}/neighbors` | Relationships touching a node |
//! | `GET`  | `/graph/labels/{label}` | Nodes with a label (`?limit=`, `?property=&value=`) |
//! | `POST` | `/graph/deltas` | Upsert a caller-supplied delta |
//! | `GET`  | `/graph/test-connection` | Store ping with counts |
//!
//! Uploads answer `202 Accepted` with `{job_id, status, deduplicated}` as
//! soon as the bytes are staged.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "size_exceeded", "message": "upload exceeds the 1024-byte limit" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `size_exceeded` | 413 |
//! | `unsupported_type` | 415 |
//! | `corrupt_input`, `constraint_violation` | 422 |
//! | `transaction_conflict` | 409 |
//! | `store_unavailable` | 503 |
//! | `extraction_timeout` | 504 |
//! | `bad_request` | 400 |
//! | `not_found` | 404 |
//! | everything else | 500 |

use axum::{
    body::Body,
    extract::{
        rejection::JsonRejection, DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use vidgraph_core::delta::{GraphDelta, WriteReport};
use vidgraph_core::error::{ErrorKind, IngestError};
use vidgraph_core::models::{UploadJob, UploadMeta};
use vidgraph_core::store::{GraphEdge, GraphNode, GraphSnapshot};

use crate::config::{Config, ServerConfig};
use crate::coordinator::Submission;
use crate::ingest_cmd::guess_content_type;
use crate::services::Services;

const DEFAULT_GRAPH_LIMIT: usize = 100;
const DEFAULT_JOBS_LIMIT: usize = 50;
const MAX_LIMIT: usize = 10_000;

#[derive(Clone)]
struct AppState {
    services: Services,
}

/// Starts the HTTP server on `[server].bind`.
///
/// Jobs a previous process left unfinished are resumed before the listener
/// opens. Runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Services::open(config).await?;

    let resumed = services.coordinator.resume_unfinished().await?;
    if resumed.resumed > 0 || resumed.failed > 0 {
        println!(
            "Resumed {} unfinished job(s), failed {} unrecoverable job(s).",
            resumed.resumed, resumed.failed
        );
    }

    let bind_addr = config.server.bind.clone();
    let app = build_router(services.clone());

    println!("vidgraph listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "server started");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    services.close().await;
    Ok(())
}

/// The full route table over `services`.
pub fn build_router(services: Services) -> Router {
    let cors = cors_layer(&services.config.server);
    let state = AppState { services };

    Router::new()
        .route("/health", get(handle_health))
        .route("/upload-video", post(handle_upload_multipart))
        .route("/uploads", post(handle_upload_raw))
        .route("/jobs", get(handle_list_jobs))
        .route("/jobs/{id}", get(handle_get_job))
        .route("/jobs/{id}/cancel", post(handle_cancel_job))
        .route("/graph", get(handle_graph))
        .route("/graph/nodes/{key}", get(handle_get_node))
        .route("/graph/nodes/{key}/neighbors", get(handle_neighbors))
        .route("/graph/labels/{label}", get(handle_label))
        .route("/graph/deltas", post(handle_apply_delta))
        .route("/graph/test-connection", get(handle_test_connection))
        // The receiver enforces upload.max_bytes while streaming.
        .layer(DefaultBodyLimit::disable())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if server.cors_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = server
        .cors_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::SizeExceeded => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::UnsupportedType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ErrorKind::CorruptInput | ErrorKind::ConstraintViolation => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorKind::TransactionConflict => StatusCode::CONFLICT,
        ErrorKind::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ExtractionTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::IoFailure | ErrorKind::Cancelled | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        let kind = err.kind();
        AppError {
            status: status_for(kind),
            code: kind.as_str().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{:#}", err), "request failed");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: ErrorKind::Internal.as_str().to_string(),
            message: format!("{:#}", err),
        }
    }
}

#[derive(Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

impl LimitParams {
    fn resolve(&self, default: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, MAX_LIMIT)
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Uploads ============

fn accepted(submission: Submission) -> Response {
    (StatusCode::ACCEPTED, Json(submission)).into_response()
}

/// `POST /upload-video`: the first `file` field is streamed to the receiver.
async fn handle_upload_multipart(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| "upload".to_string());
        let content_type = field
            .content_type()
            .map(str::to_string)
            .filter(|ct| ct != "application/octet-stream")
            .or_else(|| {
                guess_content_type(std::path::Path::new(&filename)).map(str::to_string)
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let meta = UploadMeta {
            filename,
            content_type,
            declared_size: None,
        };
        let submission = state.services.coordinator.submit(field, meta).await?;
        return Ok(accepted(submission));
    }
    Err(bad_request("multipart body has no 'file' field"))
}

#[derive(Deserialize)]
struct RawUploadParams {
    filename: Option<String>,
}

/// `POST /uploads`: the request body is the file.
async fn handle_upload_raw(
    State(state): State<AppState>,
    Query(params): Query<RawUploadParams>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| IngestError::UnsupportedType("missing Content-Type".to_string()))?
        .to_string();
    let declared_size = match headers.get(header::CONTENT_LENGTH) {
        Some(v) => Some(
            v.to_str()
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| bad_request("invalid Content-Length"))?,
        ),
        None => None,
    };
    let filename = params
        .filename
        .or_else(|| {
            headers
                .get("x-filename")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "upload".to_string());

    let meta = UploadMeta {
        filename,
        content_type,
        declared_size,
    };
    let submission = state
        .services
        .coordinator
        .submit(body.into_data_stream(), meta)
        .await?;
    Ok(accepted(submission))
}

// ============ Jobs ============

async fn handle_list_jobs(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<UploadJob>>, AppError> {
    let jobs = state
        .services
        .coordinator
        .list(params.resolve(DEFAULT_JOBS_LIMIT))
        .await?;
    Ok(Json(jobs))
}

async fn handle_get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UploadJob>, AppError> {
    match state.services.coordinator.status(&id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(not_found(format!("job not found: {}", id))),
    }
}

async fn handle_cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    match state.services.coordinator.cancel(&id).await? {
        Some(job) => Ok((StatusCode::ACCEPTED, Json(job)).into_response()),
        None => Err(not_found(format!("job not found: {}", id))),
    }
}

// ============ Graph ============

async fn handle_graph(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<GraphSnapshot>, AppError> {
    let snapshot = state
        .services
        .graph
        .snapshot(params.resolve(DEFAULT_GRAPH_LIMIT))
        .await?;
    Ok(Json(snapshot))
}

async fn handle_get_node(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<GraphNode>, AppError> {
    match state.services.graph.get_node(&key).await? {
        Some(node) => Ok(Json(node)),
        None => Err(not_found(format!("node not found: {}", key))),
    }
}

#[derive(Serialize)]
struct NeighborsResponse {
    natural_key: String,
    relationships: Vec<GraphEdge>,
}

async fn handle_neighbors(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<NeighborsResponse>, AppError> {
    if state.services.graph.get_node(&key).await?.is_none() {
        return Err(not_found(format!("node not found: {}", key)));
    }
    let relationships = state.services.graph.neighbors(&key).await?;
    Ok(Json(NeighborsResponse {
        natural_key: key,
        relationships,
    }))
}

#[derive(Serialize)]
struct LabelResponse {
    label: String,
    nodes: Vec<GraphNode>,
}

#[derive(Deserialize)]
struct LabelParams {
    limit: Option<usize>,
    property: Option<String>,
    value: Option<String>,
}

async fn handle_label(
    State(state): State<AppState>,
    Path(label): Path<String>,
    Query(params): Query<LabelParams>,
) -> Result<Json<LabelResponse>, AppError> {
    let limit = LimitParams { limit: params.limit }.resolve(DEFAULT_GRAPH_LIMIT);
    let graph = &state.services.graph;
    let nodes = match (params.property, params.value) {
        (Some(property), Some(value)) => {
            graph.nodes_by_property(&label, &property, &value, limit).await?
        }
        (None, None) => graph.nodes_by_label(&label, limit).await?,
        _ => return Err(bad_request("property and value must be given together")),
    };
    Ok(Json(LabelResponse { label, nodes }))
}

async fn handle_apply_delta(
    State(state): State<AppState>,
    payload: Result<Json<GraphDelta>, JsonRejection>,
) -> Result<Json<WriteReport>, AppError> {
    let Json(delta) = payload.map_err(|e| bad_request(e.body_text()))?;
    let report = state.services.coordinator.writer().apply(&delta).await?;
    Ok(Json(report))
}

#[derive(Serialize)]
struct ConnectionResponse {
    status: String,
    nodes: u64,
    relationships: u64,
}

async fn handle_test_connection(
    State(state): State<AppState>,
) -> Result<Json<ConnectionResponse>, AppError> {
    let stats = state.services.graph.stats().await?;
    Ok(Json(ConnectionResponse {
        status: "ok".to_string(),
        nodes: stats.nodes,
        relationships: stats.relationships,
    }))
}
