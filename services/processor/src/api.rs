//! HTTP API: presigned upload URLs and status polling.

use crate::config::ApiConfig;
use crate::metadata_store::{MetadataStore, RecordQuery};
use crate::model::{ImageRecord, ImageStatus};
use crate::object_store::ObjectStore;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

const MAX_LIST_LIMIT: i64 = 500;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn MetadataStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub upload_bucket: String,
    /// Key prefix for new uploads, e.g. `uploads/`
    pub upload_prefix: String,
    pub upload_url_expiry: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlResponse {
    pub upload_url: String,
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ImageListQuery {
    pub status: Option<String>,
    /// Upload time lower bound (RFC 3339)
    pub start: Option<DateTime<Utc>>,
    /// Upload time upper bound (RFC 3339)
    pub end: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImageListResponse {
    pub images: Vec<ImageRecord>,
    pub count: usize,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/upload-url", get(get_upload_url))
        .route("/api/v1/images", get(list_images))
        .route("/api/v1/images/*image_key", get(get_image))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "prism-processor"
    }))
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.records.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Presigned PUT URL for a fresh upload key
#[instrument(skip(state))]
async fn get_upload_url(State(state): State<AppState>) -> Result<Json<UploadUrlResponse>, ApiError> {
    let key = format!("{}{}.jpg", state.upload_prefix, Uuid::new_v4());

    let upload_url = state
        .objects
        .presign_put(&state.upload_bucket, &key, "image/jpeg", state.upload_url_expiry)
        .await
        .map_err(|e| {
            error!(error = %e, key = %key, "Failed to generate upload URL");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to generate upload URL",
                "PRESIGN_ERROR",
            )
        })?;

    let expires_at = Utc::now()
        + chrono::Duration::from_std(state.upload_url_expiry).unwrap_or_else(|_| chrono::Duration::zero());

    Ok(Json(UploadUrlResponse {
        upload_url,
        key,
        expires_at,
    }))
}

/// Full record for one image
#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path(image_key): Path<String>,
) -> Result<Json<ImageRecord>, ApiError> {
    let image_key = image_key.trim_start_matches('/');

    let record = state.records.get(image_key).await.map_err(|e| {
        error!(error = %e, image_key = %image_key, "Failed to get image record");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to get image record",
            "QUERY_ERROR",
        )
    })?;

    record.map(Json).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("Image not found: {image_key}"),
            "NOT_FOUND",
        )
    })
}

/// Records filtered by status and upload time, newest first
#[instrument(skip(state))]
async fn list_images(
    State(state): State<AppState>,
    Query(params): Query<ImageListQuery>,
) -> Result<Json<ImageListResponse>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<ImageStatus>)
        .transpose()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string(), "INVALID_STATUS"))?;

    if let (Some(start), Some(end)) = (params.start, params.end) {
        if start > end {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "start must not be after end",
                "INVALID_RANGE",
            ));
        }
    }

    let query = RecordQuery {
        status,
        start: params.start,
        end: params.end,
        limit: params.limit.clamp(1, MAX_LIST_LIMIT),
    };

    let images = state.records.query(&query).await.map_err(|e| {
        error!(error = %e, "Failed to query image records");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to query image records",
            "QUERY_ERROR",
        )
    })?;

    Ok(Json(ImageListResponse {
        count: images.len(),
        images,
    }))
}

/// Serve the API until `shutdown` fires
pub async fn start_api_server(state: AppState, config: &ApiConfig, shutdown: CancellationToken) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
