//! HTTP entry points
//!
//! | method | path | action |
//! |---|---|---|
//! | GET | `/health` | state store connectivity |
//! | POST | `/api/v1/notifications` | queue batch of object-created notifications |
//! | POST | `/api/v1/completions` | warehouse statement status change |
//! | GET | `/api/v1/loads/:database/:table` | tracking snapshot (`?expand=files` adds manifest entries) |
//! | POST | `/api/v1/loads/:database/:table/complete` | retire the running load and promote the next |
//! | DELETE | `/api/v1/loads/:database/:table/pending` | discard every queued request |
//! | POST | `/api/v1/bulk-loads` | uncoordinated load of explicit paths |

pub mod response;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use loadq_common::LoadKey;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::dispatch::{
    BulkLoadReport, BulkLoadRequest, CompletionEvent, CompletionReport, Dispatcher,
    NotificationReport,
};
use crate::error::AppError;
use crate::manifest::ManifestEntry;
use crate::middleware;
use crate::notifications::NotificationBatch;
use crate::tracker::TrackingRecord;

pub use response::{ApiResponse, ApiResult};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

/// Build the application router with all routes and middleware
pub fn router(state: AppState) -> Router {
    let loads = Router::new()
        .route("/loads/:database/:table", get(load_status))
        .route("/loads/:database/:table/complete", post(force_complete))
        .route("/loads/:database/:table/pending", delete(clear_pending))
        .route("/notifications", post(notifications))
        .route("/completions", post(completions))
        .route("/bulk-loads", post(bulk_loads));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", loads)
        .with_state(state)
        .layer(middleware::compression_layer())
        .layer(middleware::tracing_layer())
}

async fn health_check(State(state): State<AppState>) -> Response {
    match state.dispatcher.coordinator().store().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "state_store": "connected"
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("State store health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "state_store": "unreachable"
                })),
            )
                .into_response()
        },
    }
}

async fn notifications(
    State(state): State<AppState>,
    Json(batch): Json<NotificationBatch>,
) -> ApiResult<Vec<NotificationReport>> {
    let reports = state.dispatcher.handle_notifications(&batch).await?;
    Ok(ApiResponse::success(reports))
}

async fn completions(
    State(state): State<AppState>,
    Json(event): Json<CompletionEvent>,
) -> ApiResult<CompletionReport> {
    let report = state.dispatcher.handle_completion(&event).await?;
    Ok(ApiResponse::success(report))
}

async fn bulk_loads(
    State(state): State<AppState>,
    Json(request): Json<BulkLoadRequest>,
) -> ApiResult<Vec<BulkLoadReport>> {
    if request.paths.is_empty() {
        return Err(AppError::BadRequest("paths must not be empty".to_string()));
    }
    let reports = state.dispatcher.bulk_load(&request).await?;
    Ok(ApiResponse::success(reports))
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    /// `files` includes each record's manifest entries
    #[serde(default)]
    pub expand: Option<String>,
}

impl StatusQuery {
    fn expand_files(&self) -> bool {
        self.expand
            .as_deref()
            .is_some_and(|e| e.split(',').any(|part| part.trim() == "files"))
    }
}

#[derive(Debug, Serialize)]
pub struct TrackedLoad {
    #[serde(flatten)]
    pub record: TrackingRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<ManifestEntry>>,
}

#[derive(Debug, Serialize)]
pub struct LoadStatus {
    pub load_key: LoadKey,
    pub running: Option<TrackedLoad>,
    pub pending: Vec<TrackedLoad>,
}

async fn tracked(state: &AppState, record: TrackingRecord, expand: bool) -> TrackedLoad {
    let files = if expand {
        match state.dispatcher.manifests().read(&record.payload).await {
            Ok(manifest) => Some(manifest.entries),
            Err(e) => {
                tracing::warn!(payload = %record.payload, error = %e, "Manifest unavailable");
                None
            },
        }
    } else {
        None
    };
    TrackedLoad { record, files }
}

async fn load_status(
    State(state): State<AppState>,
    Path((database, table)): Path<(String, String)>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<LoadStatus> {
    let key = LoadKey::new(database, table)?;
    let snapshot = state.dispatcher.coordinator().snapshot(&key).await?;
    let expand = query.expand_files();

    let running = match snapshot.running {
        Some(record) => Some(tracked(&state, record, expand).await),
        None => None,
    };
    let mut pending = Vec::with_capacity(snapshot.pending.len());
    for record in snapshot.pending {
        pending.push(tracked(&state, record, expand).await);
    }

    let meta = json!({ "pending_count": pending.len() });
    Ok(ApiResponse::success_with_meta(
        LoadStatus {
            load_key: key,
            running,
            pending,
        },
        meta,
    ))
}

async fn force_complete(
    State(state): State<AppState>,
    Path((database, table)): Path<(String, String)>,
) -> ApiResult<CompletionReport> {
    let key = LoadKey::new(database, table)?;
    let report = state.dispatcher.force_complete(&key).await?;
    Ok(ApiResponse::success(report))
}

async fn clear_pending(
    State(state): State<AppState>,
    Path((database, table)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    let key = LoadKey::new(database, table)?;
    let deleted = state.dispatcher.coordinator().clear_pending(&key).await?;
    Ok(ApiResponse::success(json!({
        "load_key": key,
        "deleted": deleted
    })))
}
