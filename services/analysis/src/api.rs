use crate::config::ApiConfig;
use crate::identity::ObjectIdentity;
use crate::poller::{PollError, ResultPoller};
use crate::result_store::ResultRecord;
use crate::uploads::{UploadAuthorizer, UploadError, UploadGrant, UploadRequest};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub poller: Arc<ResultPoller>,
    /// Also supplies the prefix image URLs are parsed against
    pub uploads: Arc<UploadAuthorizer>,
}

/// Body of `POST /analyze`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub image_url: Option<String>,
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
        .route("/analyze", post(analyze))
        .route("/upload", post(authorize_upload))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "analysis-service"
    }))
}

/// Wait for the analysis result of a previously uploaded image
#[instrument(skip(state, payload))]
async fn analyze(
    State(state): State<AppState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<Json<ResultRecord>, ApiError> {
    // An unreadable body carries no usable image URL either
    let Json(request) = payload.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "Rejected analyze body");
        api_error(
            StatusCode::BAD_REQUEST,
            "Image URL is required",
            "MISSING_IMAGE_URL",
        )
    })?;

    let image_url = request
        .image_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                "Image URL is required",
                "MISSING_IMAGE_URL",
            )
        })?;

    let id = ObjectIdentity::from_image_url(image_url, state.uploads.prefix()).map_err(|e| {
        warn!(error = %e, image_url, "Rejected image URL");
        api_error(StatusCode::BAD_REQUEST, "Invalid image URL", "INVALID_IMAGE_URL")
    })?;

    match state.poller.await_result(&id).await {
        Ok(record) => Ok(Json(record)),
        Err(e @ PollError::Timeout { .. }) => Err(api_error(
            StatusCode::GATEWAY_TIMEOUT,
            e.to_string(),
            "ANALYSIS_TIMEOUT",
        )),
        Err(PollError::Store(e)) => {
            error!(error = %e, id = %id, "Failed to read analysis result");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to analyze image",
                "ANALYSIS_ERROR",
            ))
        }
    }
}

/// Issue a presigned direct upload grant
#[instrument(skip(state, request))]
async fn authorize_upload(
    State(state): State<AppState>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<UploadGrant>, ApiError> {
    state
        .uploads
        .authorize(&request)
        .await
        .map(Json)
        .map_err(|e| match e {
            UploadError::Presign(reason) => {
                error!(error = %reason, "Failed to generate upload URL");
                api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to generate upload URL",
                    "UPLOAD_ERROR",
                )
            }
            UploadError::MissingFields => api_error(
                StatusCode::BAD_REQUEST,
                "Filename and content type are required",
                "MISSING_FIELDS",
            ),
            other => api_error(StatusCode::BAD_REQUEST, other.to_string(), "INVALID_UPLOAD"),
        })
}

/// Start the API server; returns once `shutdown` is cancelled and in-flight
/// requests have drained
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting analysis API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    info!("API server stopped");
    Ok(())
}
