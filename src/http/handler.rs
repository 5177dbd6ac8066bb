//! Axum router and request handlers.
//!
//! Routes:
//! - `POST /events`   - Notification payload receiver
//! - `GET  /healthz`  - Health check
//! - `GET  /metrics`  - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;
use tracing::{error, info, instrument, warn};

use crate::event::parse_invocation;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/events", post(handle_events))
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query parameter types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EventsQuery {
    /// Force a dry run regardless of the payload's `dryRun`.
    #[serde(default)]
    dry_run: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `POST /events`
///
/// Runs the pipeline for every record in the payload and returns the report.
/// Any failed record turns the response into a 500 so the sender retries or
/// alerts.
#[instrument(skip(state, body), fields(len = body.len()))]
async fn handle_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
    body: Bytes,
) -> Result<Response, AppError> {
    let mut invocation =
        parse_invocation(&body).map_err(|e| AppError::BadRequest(format!("{e:#}")))?;
    invocation.dry_run |= query.dry_run;

    let report = state.uploader.handle_invocation(&invocation).await;

    let status = if report.is_success() {
        info!(records = report.records.len(), "payload processed");
        StatusCode::OK
    } else {
        warn!(
            failed = report.failed(),
            skipped = report.skipped,
            "payload processed with failures"
        );
        StatusCode::INTERNAL_SERVER_ERROR
    };

    Ok((status, Json(report)).into_response())
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    crate::health::health_handler(State(Arc::clone(&state.config))).await
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state.metrics.encode()?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The request body is not a notification payload.
    BadRequest(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => {
                warn!(error = %msg, "rejected payload");
                (StatusCode::BAD_REQUEST, msg).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
