//! axum surface: the proxy route plus a small admin API.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;

use super::ledger::UsageRecord;
use super::observability::ObservabilitySnapshot;
use super::{
    ErrorEnvelope, LimitRequest, MeteredProxy, ProxyError, ProxyRequestEnvelope, ProxyResponse,
    ProxySettings,
};

const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

type HttpError = (StatusCode, Json<ErrorEnvelope>);

#[derive(Clone)]
pub struct ProxyHttpState {
    proxy: Arc<MeteredProxy>,
    settings: Arc<ProxySettings>,
    admin_token: Option<String>,
    max_body_bytes: usize,
}

impl ProxyHttpState {
    pub fn new(proxy: Arc<MeteredProxy>, settings: ProxySettings) -> Self {
        Self {
            proxy,
            settings: Arc::new(settings),
            admin_token: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Admin routes answer 404 until a token is configured.
    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|token| !token.trim().is_empty());
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes.max(1);
        self
    }
}

pub fn router(state: ProxyHttpState) -> Router {
    let max_body_bytes = state.max_body_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/metrics/snapshot", get(metrics_snapshot))
        .route("/v1/proxy", post(handle_proxy))
        .route("/admin/limits", post(set_limit))
        .route("/admin/usage", get(list_usage))
        .route("/admin/cache/flush", post(flush_cache))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn metrics_snapshot(State(state): State<ProxyHttpState>) -> Json<ObservabilitySnapshot> {
    Json(state.proxy.observability())
}

async fn handle_proxy(
    State(state): State<ProxyHttpState>,
    body: Bytes,
) -> Result<Json<ProxyResponse>, HttpError> {
    let envelope: ProxyRequestEnvelope = serde_json::from_slice(&body).map_err(|err| {
        map_proxy_error(ProxyError::MalformedRequest {
            reason: format!("invalid request envelope: {err}"),
        })
    })?;
    let request = envelope.into_request().map_err(map_proxy_error)?;
    let response = state
        .proxy
        .handle(&state.settings, request)
        .await
        .map_err(map_proxy_error)?;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct LimitResponse {
    key: String,
    user: String,
    project: String,
    model: String,
    environment: String,
    limit_usd_micros: Option<u64>,
}

async fn set_limit(
    State(state): State<ProxyHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<LimitResponse>, HttpError> {
    ensure_admin(&state, &headers)?;
    let request: LimitRequest = serde_json::from_slice(&body).map_err(|err| {
        map_proxy_error(ProxyError::MalformedRequest {
            reason: format!("invalid limit request: {err}"),
        })
    })?;
    let (key, limit_usd_micros) = state
        .proxy
        .admin_set_limit(&state.settings, request)
        .await
        .map_err(map_proxy_error)?;
    Ok(Json(LimitResponse {
        key: key.composite(),
        user: key.user,
        project: key.project,
        model: key.model,
        environment: key.environment,
        limit_usd_micros,
    }))
}

async fn list_usage(
    State(state): State<ProxyHttpState>,
    headers: HeaderMap,
) -> Result<Json<Vec<UsageRecord>>, HttpError> {
    ensure_admin(&state, &headers)?;
    let records = state.proxy.list_usage().await.map_err(map_proxy_error)?;
    Ok(Json(records))
}

#[derive(Debug, Serialize)]
struct FlushResponse {
    removed: u64,
}

async fn flush_cache(
    State(state): State<ProxyHttpState>,
    headers: HeaderMap,
) -> Result<Json<FlushResponse>, HttpError> {
    ensure_admin(&state, &headers)?;
    let removed = state.proxy.flush_cache().await.map_err(|err| {
        error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "CacheUnavailable",
            err.to_string(),
        )
    })?;
    Ok(Json(FlushResponse { removed }))
}

fn ensure_admin(state: &ProxyHttpState, headers: &HeaderMap) -> Result<(), HttpError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "NotConfigured",
            "admin auth not configured",
        ));
    };
    let provided = extract_bearer(headers)
        .or_else(|| extract_header(headers, "x-admin-token"))
        .unwrap_or_default();
    if provided == expected {
        return Ok(());
    }
    Err(error_response(
        StatusCode::UNAUTHORIZED,
        "Unauthorized",
        "invalid admin token",
    ))
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = extract_header(headers, "authorization")?;
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// HTTP status for each error kind; upstream errors keep the upstream status.
pub fn status_for(err: &ProxyError) -> StatusCode {
    match err {
        ProxyError::MalformedRequest { .. } => StatusCode::BAD_REQUEST,
        ProxyError::ProjectUnconfigured { .. } => StatusCode::FORBIDDEN,
        ProxyError::ProjectQuotaExceeded { .. }
        | ProxyError::ModelQuotaExceeded { .. }
        | ProxyError::UserQuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
        ProxyError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
        ProxyError::UpstreamError { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        ProxyError::LedgerUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn map_proxy_error(err: ProxyError) -> HttpError {
    (status_for(&err), Json(err.to_envelope()))
}

fn error_response(status: StatusCode, kind: &str, message: impl Into<String>) -> HttpError {
    (
        status,
        Json(ErrorEnvelope {
            error_kind: kind.to_string(),
            message: message.into(),
            user: None,
            project: None,
            model: None,
            status_code: None,
            body: None,
        }),
    )
}
