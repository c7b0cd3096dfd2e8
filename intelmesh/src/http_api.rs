// intelmesh/src/http_api.rs
//
// Read-mostly HTTP surface over the coordinator. Same semantics as the
// event channel; dashboards and scripted agents use this instead of a
// persistent session.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::coordinator::Coordinator;
use crate::error::CoordError;
use crate::events::{IocFilter, IocPayload};

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/clients", get(clients))
        .route("/clients/:id", get(client_detail))
        .route("/iocs", get(list_iocs))
        .route("/iocs/:id", get(get_ioc))
        .route("/iocs/:id/expire", post(expire_ioc))
        .route("/report_threat", post(report_threat))
        .route("/sync_intel", get(sync_intel))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(coordinator)
}

pub async fn serve(coordinator: Arc<Coordinator>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("http api listening on {addr}");
    axum::serve(listener, router(coordinator)).await?;
    Ok(())
}

// ── Error mapping ─────────────────────────────────────────────────────────────

impl IntoResponse for CoordError {
    fn into_response(self) -> Response {
        let code = match &self {
            CoordError::BadRequest(_) => StatusCode::BAD_REQUEST,
            CoordError::NotFound      => StatusCode::NOT_FOUND,
            CoordError::Timeout       => StatusCode::REQUEST_TIMEOUT,
            CoordError::Conflict(_)   => StatusCode::CONFLICT,
            CoordError::Internal(_)   => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "kind":  self.kind(),
        }));
        (code, body).into_response()
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

async fn status(State(c): State<Arc<Coordinator>>) -> impl IntoResponse {
    Json(c.status())
}

async fn clients(State(c): State<Arc<Coordinator>>) -> impl IntoResponse {
    Json(c.clients())
}

async fn client_detail(
    State(c): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Result<Response, CoordError> {
    let detail = c.client_detail(&id)?;
    Ok(Json(detail).into_response())
}

async fn list_iocs(
    State(c): State<Arc<Coordinator>>,
    Query(filter): Query<IocFilter>,
) -> Result<Response, CoordError> {
    let iocs = c.aggregator.query(&filter)?;
    Ok(Json(iocs).into_response())
}

async fn get_ioc(
    State(c): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Result<Response, CoordError> {
    let ioc = c.aggregator.get(&id)?;
    Ok(Json(ioc).into_response())
}

#[derive(Debug, Deserialize)]
struct ReportBody {
    client_id: String,
    ioc:       IocPayload,
}

#[derive(Debug, Serialize)]
struct ReportResponse {
    ioc_id: String,
    status: crate::events::IocStatus,
}

async fn report_threat(
    State(c): State<Arc<Coordinator>>,
    Json(body): Json<ReportBody>,
) -> Result<Response, CoordError> {
    let result = c.handle_report(&body.client_id, body.ioc).await?;
    Ok(Json(ReportResponse { ioc_id: result.ioc_id, status: result.status }).into_response())
}

#[derive(Debug, Deserialize)]
struct SyncQuery {
    client_id: String,
    #[serde(default)]
    cursor:    i64,
}

async fn sync_intel(
    State(c): State<Arc<Coordinator>>,
    Query(q): Query<SyncQuery>,
) -> Result<Response, CoordError> {
    let (iocs, cursor) = c.handle_sync(&q.client_id, q.cursor)?;
    Ok(Json(serde_json::json!({ "iocs": iocs, "cursor": cursor })).into_response())
}

async fn expire_ioc(
    State(c): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Result<Response, CoordError> {
    let ioc = c.handle_expire(&id).await?;
    Ok(Json(ioc).into_response())
}
