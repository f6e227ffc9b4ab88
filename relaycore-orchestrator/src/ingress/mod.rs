//! HTTP ingress (§6): `POST /commands/{Name}`, `GET /commands/{id}`,
//! `GET /health`. Gated behind the `web-api` feature, following the
//! teacher's pattern of keeping the outer HTTP surface optional while the
//! core platform has no axum dependency at all.

#![cfg(feature = "web-api")]

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relaycore_queue::CommandQueue;
use relaycore_shared::db::{CommandRow, CommandStore};
use relaycore_shared::errors::PlatformError;
use serde::Serialize;
use sqlx::PgPool;
use tracing::instrument;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use crate::bus::CommandBus;
use crate::health::{self, HealthReport};
use crate::relay::RelayMetrics;

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
const BUSINESS_KEY_HEADER: &str = "Business-Key";
const COMMAND_ID_HEADER: &str = "X-Command-Id";

#[derive(Clone)]
pub struct IngressState {
    pub pool: PgPool,
    pub bus: CommandBus,
    pub queue: std::sync::Arc<dyn CommandQueue>,
    pub relay_metrics: std::sync::Arc<RelayMetrics>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CommandStatusResponse {
    pub status: String,
    pub name: String,
    pub retries: i32,
    pub error: Option<String>,
}

impl From<CommandRow> for CommandStatusResponse {
    fn from(row: CommandRow) -> Self {
        Self {
            status: format!("{:?}", row.status).to_uppercase(),
            name: row.name,
            retries: row.retries,
            error: row.error,
        }
    }
}

#[derive(OpenApi)]
#[openapi(paths(submit_command, get_command, health), components(schemas(CommandStatusResponse)))]
pub struct ApiDoc;

pub fn router(state: IngressState) -> Router {
    Router::new()
        .route("/commands/:name", post(submit_command))
        .route("/commands/:id", get(get_command))
        .route("/health", get(health))
        .merge(utoipa_swagger_ui::SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(Arc::new(state))
}

/// Accept a command for durable, exactly-once-effect processing (§4.E).
/// The body is the arbitrary JSON payload itself; idempotency and
/// business keys travel as headers, not body fields (§6).
#[utoipa::path(
    post,
    path = "/commands/{name}",
    params(
        ("name" = String, Path, description = "Command type, e.g. CreateUser"),
        ("Idempotency-Key" = String, Header),
        ("Business-Key" = Option<String>, Header),
    ),
    responses(
        (status = 202, description = "Command accepted, X-Command-Id header carries the id"),
        (status = 400, description = "Missing or invalid Idempotency-Key header"),
        (status = 409, description = "Idempotency key already used"),
    )
)]
#[instrument(skip(state, headers, payload))]
async fn submit_command(
    State(state): State<Arc<IngressState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    payload: Option<Json<serde_json::Value>>,
) -> Result<Response, ApiError> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing or invalid Idempotency-Key header"))?;
    let business_key = headers.get(BUSINESS_KEY_HEADER).and_then(|v| v.to_str().ok());
    let payload = payload.map(|Json(v)| v).unwrap_or(serde_json::Value::Null);

    let command_id = state.bus.submit(&name, idempotency_key, business_key, payload).await?;

    let mut response = StatusCode::ACCEPTED.into_response();
    response
        .headers_mut()
        .insert(COMMAND_ID_HEADER, HeaderValue::from_str(&command_id.to_string()).expect("uuid is valid header value"));
    Ok(response)
}

/// Poll a command's current status (§4.D).
#[utoipa::path(
    get,
    path = "/commands/{id}",
    params(("id" = Uuid, Path)),
    responses(
        (status = 200, description = "Command found", body = CommandStatusResponse),
        (status = 404, description = "No such command"),
    )
)]
#[instrument(skip(state))]
async fn get_command(State(state): State<Arc<IngressState>>, Path(id): Path<Uuid>) -> Result<Response, ApiError> {
    let mut conn = state.pool.acquire().await.map_err(PlatformError::from)?;
    match CommandStore::find_by_id(&mut conn, id).await? {
        Some(row) => Ok(Json(CommandStatusResponse::from(row)).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

/// §6: 200 only when the DB pool and the queue adapter's producer both
/// check out; 503 with the failing sub-check(s) otherwise.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Database and queue producer both reachable"),
        (status = 503, description = "Database or queue producer unreachable"),
    )
)]
async fn health(State(state): State<Arc<IngressState>>) -> impl IntoResponse {
    let relay_snapshot = state.relay_metrics.snapshot();
    let report: HealthReport = health::evaluate(&state.pool, &state.queue, &relay_snapshot).await;
    let status = if report.is_healthy() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(report))
}

/// Wraps [`PlatformError`] so handlers can just use `?`; maps the error
/// taxonomy onto HTTP status codes (§7).
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<PlatformError> for ApiError {
    fn from(err: PlatformError) -> Self {
        let status = match &err {
            PlatformError::DuplicateIdempotencyKey { .. } => StatusCode::CONFLICT,
            PlatformError::UnknownProcessType(_) | PlatformError::CommandNotFound(_) | PlatformError::ProcessInstanceNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            PlatformError::HandlerValidationError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_status_response_uppercases_the_debug_rendering() {
        let row = CommandRow {
            id: Uuid::nil(),
            name: "CreateUser".to_string(),
            business_key: None,
            payload: serde_json::json!({}),
            idempotency_key: "k1".to_string(),
            status: relaycore_shared::db::CommandStatus::Running,
            retries: 0,
            lease_until: None,
            error: None,
            headers: serde_json::json!({}),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let response = CommandStatusResponse::from(row);
        assert_eq!(response.status, "RUNNING");
    }
}
