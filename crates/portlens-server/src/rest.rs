//! HTTP REST API over [`PortAnalytics`].
//!
//! | Method     | Path                          | Operation                 |
//! |------------|-------------------------------|---------------------------|
//! | GET        | `/api/companies`              | company list from file    |
//! | GET        | `/api/company/:name`          | cache-first analytics     |
//! | POST       | `/api/company/:name/refresh`  | forced re-extraction      |
//! | GET        | `/api/health`                 | browser and cache status  |
//! | GET, POST  | `/api/cache/clear`            | drop every cached result  |
//! | GET        | `/api/v1/events`              | extraction events (SSE)   |

use crate::companies;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use portlens::{Analytics, ErrorKind, FailureReport, PortAnalytics};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};

/// Shared handler state.
pub struct AppState {
    pub analytics: PortAnalytics,
    /// Newline-separated company list served by `/api/companies`.
    pub companies_path: PathBuf,
}

/// Build the axum Router with all REST endpoints.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/companies", get(handle_companies))
        .route("/api/company/:name", get(handle_company))
        .route(
            "/api/company/:name/refresh",
            post(handle_refresh),
        )
        .route("/api/health", get(handle_health))
        .route(
            "/api/cache/clear",
            get(handle_clear_cache).post(handle_clear_cache),
        )
        .route("/api/v1/events", get(events_sse))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `addr` until the listener fails.
pub async fn start(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("REST API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

// ── Helpers ─────────────────────────────────────────────────────

/// HTTP status for a failed lookup.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::EmptyResult => StatusCode::NOT_FOUND,
        ErrorKind::InvalidQuery => StatusCode::BAD_REQUEST,
        ErrorKind::Connection
        | ErrorKind::Navigation
        | ErrorKind::CaptureTimeout
        | ErrorKind::Decode => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn success(analytics: Analytics) -> Response {
    Json(json!({
        "success": true,
        "data": analytics.result.as_ref(),
        "cached": analytics.cached,
    }))
    .into_response()
}

fn failure(report: FailureReport) -> Response {
    let error = match report.kind {
        ErrorKind::EmptyResult => "No data available for this company".to_string(),
        _ => report.message.clone(),
    };
    let body = json!({
        "success": false,
        "error": error,
        "kind": report.kind,
        "stage": report.stage,
        "diagnostics": report.diagnostics,
    });
    (status_for(report.kind), Json(body)).into_response()
}

// ── Handlers ────────────────────────────────────────────────────

async fn handle_companies(State(state): State<Arc<AppState>>) -> Response {
    let path = state.companies_path.clone();
    match tokio::task::spawn_blocking(move || companies::lookup_company_list(&path)).await {
        Ok(Ok(list)) => {
            let total = list.len();
            Json(json!({ "companies": list, "total": total })).into_response()
        }
        Ok(Err(e)) => {
            tracing::error!("failed to read company list: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": format!("task panicked: {e}") })),
        )
            .into_response(),
    }
}

async fn handle_company(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    tracing::info!("GET company: {name}");
    match state.analytics.get_port_analytics(&name).await {
        Ok(analytics) => success(analytics),
        Err(report) => failure(report),
    }
}

async fn handle_refresh(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    tracing::info!("REFRESH company: {name}");
    match state.analytics.refresh(&name).await {
        Ok(analytics) => success(analytics),
        Err(report) => failure(report),
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let health = state.analytics.health_check().await;
    let status = if health.browser_reachable {
        "healthy"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "browser_reachable": health.browser_reachable,
        "cache_size": health.cache_size,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn handle_clear_cache(State(state): State<Arc<AppState>>) -> Json<Value> {
    let entries = state.analytics.clear_cache();
    Json(json!({
        "success": true,
        "message": "Cache cleared",
        "entries": entries,
    }))
}

/// SSE query parameters.
#[derive(serde::Deserialize, Default)]
struct EventsParams {
    company: Option<String>,
}

/// Server-Sent Events stream of extraction events, optionally filtered by
/// `?company=<name>`.
async fn events_sse(
    Query(params): Query<EventsParams>,
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.analytics.subscribe();
    let company_filter = params.company;

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(ref company) = company_filter {
                        if !event.matches_company(company) {
                            continue;
                        }
                    }
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(Event::default().data(json));
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
