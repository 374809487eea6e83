use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use pantry_core::audit::{MemoryAuditSink, StoredAuditEntry};
use pantry_core::models::{
    ConflictDetectionResult, ConflictItem, DetectionFailure, ResolutionRequest, StagedBatch,
    VersionedEntityRef,
};
use pantry_core::store::MemoryStore;
use pantry_core::{
    BatchCommitCoordinator, BatchState, BulkOperation, BulkOutcome, ResolveReport, SaveOutcome,
    SaveRequest,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    coordinator: BatchCommitCoordinator,
    store: MemoryStore,
    audit: MemoryAuditSink,
}

impl AppState {
    pub fn from_config(config: Arc<AppConfig>) -> Result<Self, AppError> {
        let store = match &config.seed_path {
            Some(path) => {
                let payload = std::fs::read_to_string(path).map_err(|error| {
                    AppError::Config(format!("cannot read {}: {error}", path.display()))
                })?;
                let store = MemoryStore::from_json(&payload).map_err(|error| {
                    AppError::Config(format!("invalid seed file {}: {error}", path.display()))
                })?;
                tracing::info!(path = %path.display(), "Loaded seed snapshots");
                store
            }
            None => MemoryStore::new(),
        };
        let audit = MemoryAuditSink::with_retention(config.audit_retention);
        Ok(Self::with_collaborators(config, store, audit))
    }

    fn with_collaborators(
        config: Arc<AppConfig>,
        store: MemoryStore,
        audit: MemoryAuditSink,
    ) -> Self {
        let coordinator = BatchCommitCoordinator::new(
            Arc::new(store.clone()),
            Arc::new(audit.clone()),
            config.engine_config(),
        );
        Self {
            config,
            coordinator,
            store,
            audit,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let batch_routes = Router::new()
        .route("/batch/detect", post(detect))
        .route("/batch/save", post(save))
        .route("/batch/resolve", post(resolve))
        .route("/batch/bulk", post(bulk))
        .route("/audit/{operation_id}", get(audit_trail));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", batch_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

/// Cancelled when the handler future is dropped, e.g. on client disconnect.
fn request_cancellation() -> (CancellationToken, tokio_util::sync::DropGuard) {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    (cancel, guard)
}

fn require_user(user_id: &str) -> Result<(), AppError> {
    if user_id.trim().is_empty() {
        return Err(AppError::bad_request("userId is required"));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    entities: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        entities: state.store.snapshots().await.len(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectRequest {
    #[serde(default)]
    operation_id: Option<String>,
    user_id: String,
    batch: StagedBatch,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DetectResponse {
    operation_id: String,
    state: BatchState,
    #[serde(flatten)]
    result: ConflictDetectionResult,
}

async fn detect(
    State(state): State<AppState>,
    Json(request): Json<DetectRequest>,
) -> Result<Json<DetectResponse>, AppError> {
    require_user(&request.user_id)?;
    let (cancel, _cancel_on_drop) = request_cancellation();
    let (operation, result) = state
        .coordinator
        .detect(
            request.operation_id.as_deref(),
            &request.user_id,
            request.batch,
            &cancel,
        )
        .await?;
    tracing::info!(
        endpoint = "batch_detect",
        operation_id = operation.operation_id(),
        conflicts = result.conflicts.len(),
        "Detection served"
    );
    Ok(Json(DetectResponse {
        operation_id: operation.operation_id().to_string(),
        state: operation.state(),
        result,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StaleVersionBody {
    error: &'static str,
    operation_id: String,
    conflicts: Vec<ConflictItem>,
    non_conflicted: Vec<VersionedEntityRef>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UnverifiedBody {
    error: &'static str,
    operation_id: String,
    failed: Vec<DetectionFailure>,
}

async fn save(
    State(state): State<AppState>,
    Json(request): Json<SaveRequest>,
) -> Result<Response, AppError> {
    require_user(&request.user_id)?;
    if request.batch.is_empty() {
        return Err(AppError::bad_request("batch must contain at least one entity"));
    }
    let (cancel, _cancel_on_drop) = request_cancellation();
    let outcome = state.coordinator.save(request, &cancel).await?;
    tracing::info!(
        endpoint = "batch_save",
        operation_id = outcome.operation_id(),
        "Save served"
    );

    let response = match outcome {
        SaveOutcome::Committed(report) => (StatusCode::OK, Json(report)).into_response(),
        SaveOutcome::Conflicts {
            operation_id,
            conflicts,
            non_conflicted,
        } => (
            StatusCode::CONFLICT,
            Json(StaleVersionBody {
                error: "STALE_VERSION",
                operation_id,
                conflicts,
                non_conflicted,
            }),
        )
            .into_response(),
        SaveOutcome::Unverified {
            operation_id,
            failed,
        } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(UnverifiedBody {
                error: "VERSION_LOOKUP_TIMEOUT",
                operation_id,
                failed,
            }),
        )
            .into_response(),
    };
    Ok(response)
}

async fn resolve(
    State(state): State<AppState>,
    Json(request): Json<ResolutionRequest>,
) -> Result<Json<ResolveReport>, AppError> {
    require_user(&request.user_id)?;
    if request.operation_id.trim().is_empty() {
        return Err(AppError::bad_request("operationId is required"));
    }
    let (cancel, _cancel_on_drop) = request_cancellation();
    let report = state.coordinator.resolve_and_commit(&request, &cancel).await?;
    tracing::info!(
        endpoint = "batch_resolve",
        operation_id = %request.operation_id,
        resolved = report.resolution.resolved.len(),
        unresolved = report.resolution.unresolved.len(),
        "Resolution served"
    );
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkRequest {
    #[serde(default)]
    operation_id: Option<String>,
    user_id: String,
    operations: Vec<BulkOperation>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BulkResponse {
    operation_id: String,
    #[serde(flatten)]
    outcome: BulkOutcome,
}

async fn bulk(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> Result<Json<BulkResponse>, AppError> {
    require_user(&request.user_id)?;
    let mut operation = state
        .coordinator
        .start_transaction(request.operation_id.as_deref(), &request.user_id);
    let outcome = state
        .coordinator
        .execute_bulk_operations(&mut operation, request.operations)
        .await?;
    Ok(Json(BulkResponse {
        operation_id: operation.operation_id().to_string(),
        outcome,
    }))
}

async fn audit_trail(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
) -> Result<Json<Vec<StoredAuditEntry>>, AppError> {
    let entries = state.audit.entries_for(&operation_id).await;
    if entries.is_empty() {
        return Err(AppError::not_found(format!(
            "no audit records for operation {operation_id}"
        )));
    }
    Ok(Json(entries))
}
