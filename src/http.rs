//! HTTP API.
//!
//! - `GET /health`
//! - `GET /dispute-metaevidence?chainId=<id|name>&disputeId=<n>`
//! - `POST /notice-metaevidence` runs a backfill synchronously
//!
//! Every error response has the shape `{"error": "<message>"}`.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backfill::{BackfillError, BackfillJob, NoticeRequest};
use crate::cache::{CacheError, ResolutionCache};
use crate::resolver::{Resolution, ResolveError, Resolver};
use crate::scan::ScanError;
use crate::validate::{validate_network, validate_number, ValidationError};

/// HTTP server state.
#[derive(Clone)]
pub struct HttpState {
    pub version: String,
    pub startup_time: i64,
    pub resolver: Resolver,
    pub backfill: Arc<BackfillJob>,
    pub cache: ResolutionCache,
}

impl HttpState {
    pub fn new(resolver: Resolver, backfill: Arc<BackfillJob>, cache: ResolutionCache) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            startup_time: chrono::Utc::now().timestamp(),
            resolver,
            backfill,
            cache,
        }
    }
}

/// Health check response.
#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: i64,
    pub networks: Vec<String>,
    pub database: String,
}

/// Error body returned by every failing handler.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.to_string())
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        let status = match &err {
            ResolveError::UnsupportedNetwork(_) | ResolveError::InvalidInput(_) => {
                StatusCode::BAD_REQUEST
            }
            ResolveError::NotFound { .. } => StatusCode::NOT_FOUND,
            ResolveError::Index(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}

impl From<BackfillError> for ApiError {
    fn from(err: BackfillError) -> Self {
        let status = match &err {
            BackfillError::UnsupportedNetwork(_) => StatusCode::BAD_REQUEST,
            BackfillError::AlreadyResolved { .. }
            | BackfillError::AlreadyClaimed(_)
            | BackfillError::Cache(CacheError::Conflict { .. }) => StatusCode::CONFLICT,
            BackfillError::NotFoundInHistory { .. } => StatusCode::NOT_FOUND,
            BackfillError::Scan(ScanError::InvalidRange { .. } | ScanError::InvalidWindowSize) => {
                StatusCode::BAD_REQUEST
            }
            BackfillError::Scan(_) => StatusCode::BAD_GATEWAY,
            BackfillError::Cache(CacheError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

/// Health check endpoint.
async fn health_handler(State(state): State<Arc<HttpState>>) -> Json<HealthResponse> {
    let now = chrono::Utc::now().timestamp();
    let uptime = now - state.startup_time;
    let database = match state.cache.ping().await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!(target: "evidence_resolver::http", error = %e, "Cache ping failed");
            "unavailable"
        }
    };

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime_seconds: uptime,
        networks: state
            .resolver
            .networks()
            .iter()
            .map(|c| c.network.to_string())
            .collect(),
        database: database.to_string(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeQuery {
    pub chain_id: Option<String>,
    pub dispute_id: Option<String>,
}

/// GET /dispute-metaevidence
async fn dispute_metaevidence_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<DisputeQuery>,
) -> Result<Json<Resolution>, ApiError> {
    let network = validate_network(query.chain_id.as_deref(), state.resolver.networks())?.network;
    let dispute_id = validate_number(query.dispute_id.as_deref(), "disputeId")?;

    let resolution = state
        .resolver
        .resolve_on(network, dispute_id)
        .await
        .map_err(|e| {
            if matches!(e, ResolveError::Index(_)) {
                tracing::error!(target: "evidence_resolver::http", error = %e, "Index lookup failed");
            }
            ApiError::from(e)
        })?;

    Ok(Json(resolution))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeResponse {
    pub meta_evidence_uri: String,
}

/// POST /notice-metaevidence
async fn notice_metaevidence_handler(
    State(state): State<Arc<HttpState>>,
    body: Result<Json<NoticeRequest>, JsonRejection>,
) -> Result<Json<NoticeResponse>, ApiError> {
    let Json(notice) = body.map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.body_text()))?;
    let request = notice.validate(state.backfill.networks())?;

    // The job runs on its own task so a dropped connection cannot cancel it
    // midway and leave its claim held.
    let job = state.backfill.clone();
    let report = tokio::spawn(async move { job.run(request).await })
        .await
        .map_err(|e| {
            tracing::error!(target: "evidence_resolver::http", error = %e, "Backfill task failed");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "backfill task failed")
        })??;

    Ok(Json(NoticeResponse {
        meta_evidence_uri: report.uri,
    }))
}

/// Creates the HTTP router with every resolver endpoint.
pub fn create_http_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/dispute-metaevidence", get(dispute_metaevidence_handler))
        .route("/notice-metaevidence", post(notice_metaevidence_handler))
        .with_state(Arc::new(state))
}
