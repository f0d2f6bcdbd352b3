use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use base64::Engine as _;
use bytes::Bytes;
use llm_meter::gateway::cache::MemoryResponseCache;
use llm_meter::gateway::costing::PricingTable;
use llm_meter::gateway::ledger::MemoryLedger;
use llm_meter::gateway::upstream::{Upstream, UpstreamRequest, UpstreamResponse};
use llm_meter::gateway::{
    MeteredProxy, ProxyError, ProxyHttpState, ProxyResponse, ProxySettings, router,
};
use serde_json::{Value, json};
use tower::util::ServiceExt;

const ADMIN: &str = "admin-secret";

#[derive(Default)]
struct EchoUpstream {
    calls: AtomicUsize,
}

#[async_trait]
impl Upstream for EchoUpstream {
    async fn forward(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProxyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let model = serde_json::from_slice::<Value>(&request.body)
            .ok()
            .and_then(|body| body.get("model").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        if model == "broken" {
            return Err(ProxyError::UpstreamError {
                status: 503,
                body: "overloaded".to_string(),
            });
        }
        let body = json!({
            "model": model,
            "choices": [{"message": {"role": "assistant", "content": "pong"}}],
            "usage": {"prompt_tokens": 1000, "completion_tokens": 0}
        });
        Ok(UpstreamResponse::from_response(ProxyResponse {
            status_code: 200,
            headers: Default::default(),
            body: Bytes::from(body.to_string()),
            reason_phrase: "OK".to_string(),
        }))
    }
}

fn build_app(admin_token: Option<&str>) -> (Router, Arc<EchoUpstream>) {
    let upstream = Arc::new(EchoUpstream::default());
    let proxy = MeteredProxy::new(
        Arc::new(MemoryLedger::new()),
        Arc::new(MemoryResponseCache::default()),
        upstream.clone(),
        PricingTable::default(),
    );
    let state = ProxyHttpState::new(Arc::new(proxy), ProxySettings::default())
        .with_admin_token(admin_token.map(str::to_string));
    (router(state), upstream)
}

fn post_json(uri: &str, body: Value, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("x-admin-token", token);
    }
    builder.body(Body::empty()).expect("request")
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn proxy_envelope(model: &str) -> Value {
    let body = json!({"model": model, "messages": [{"role": "user", "content": "ping"}]});
    json!({
        "user": "fulano",
        "project": "hello",
        "method": "POST",
        "url": "/v1/chat/completions",
        "headers": {"content-type": "application/json"},
        "content": base64::engine::general_purpose::STANDARD.encode(body.to_string()),
    })
}

async fn set_project_limit(app: &Router, usd: f64) {
    let (status, body) = send(
        app,
        post_json(
            "/admin/limits",
            json!({"project": "hello", "limit": usd}),
            Some(ADMIN),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

#[tokio::test]
async fn health_and_metrics_snapshot_respond() {
    let (app, _) = build_app(None);
    let (status, body) = send(&app, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));

    let (status, body) = send(&app, get("/metrics/snapshot", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requests"], json!(0));
}

#[tokio::test]
async fn unconfigured_project_is_forbidden() {
    let (app, upstream) = build_app(Some(ADMIN));
    let (status, body) = send(&app, post_json("/v1/proxy", proxy_envelope("gpt-4"), None)).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_kind"], json!("ProjectUnconfigured"));
    assert_eq!(body["message"], json!("Project hello must have a usage limit"));
    assert_eq!(body["project"], json!("hello"));
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn admitted_call_returns_base64_response_and_shows_in_usage() {
    let (app, upstream) = build_app(Some(ADMIN));
    set_project_limit(&app, 1.0).await;

    let (status, body) = send(&app, post_json("/v1/proxy", proxy_envelope("gpt-4"), None)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let response: ProxyResponse = serde_json::from_value(body).expect("proxy response");
    assert_eq!(response.status_code, 200);
    let upstream_body: Value = serde_json::from_slice(&response.body).expect("json body");
    assert_eq!(upstream_body["choices"][0]["message"]["content"], json!("pong"));

    // Cached on the second call.
    let (status, _) = send(&app, post_json("/v1/proxy", proxy_envelope("gpt-4"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

    let (status, usage) = send(&app, get("/admin/usage", Some(ADMIN))).await;
    assert_eq!(status, StatusCode::OK);
    let rows = usage.as_array().expect("rows");
    let project_row = rows
        .iter()
        .find(|row| row["user"] == json!("*") && row["model"] == json!("*"))
        .expect("project row");
    assert_eq!(project_row["limit_usd_micros"], json!(1_000_000));
    assert!(
        project_row["periods"]
            .as_object()
            .is_some_and(|periods| periods.values().any(|spent| spent == &json!(30_000)))
    );

    let (status, metrics) = send(&app, get("/metrics/snapshot", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["requests"], json!(2));
    assert_eq!(metrics["cache_hits"], json!(1));
}

#[tokio::test]
async fn exhausted_project_is_payment_required() {
    let (app, _) = build_app(Some(ADMIN));
    set_project_limit(&app, 0.0).await;

    let (status, body) = send(&app, post_json("/v1/proxy", proxy_envelope("gpt-4"), None)).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error_kind"], json!("ProjectQuotaExceeded"));
}

#[tokio::test]
async fn malformed_envelopes_are_bad_requests() {
    let (app, _) = build_app(None);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/proxy")
        .body(Body::from("not json"))
        .expect("request");
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_kind"], json!("MalformedRequest"));

    let mut envelope = proxy_envelope("gpt-4");
    envelope["content"] = json!("%%% not base64 %%%");
    let (status, _) = send(&app, post_json("/v1/proxy", envelope, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut envelope = proxy_envelope("gpt-4");
    envelope["user"] = Value::Null;
    let (status, _) = send(&app, post_json("/v1/proxy", envelope, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upstream_errors_keep_their_status() {
    let (app, _) = build_app(Some(ADMIN));
    set_project_limit(&app, 1.0).await;

    let (status, body) = send(&app, post_json("/v1/proxy", proxy_envelope("broken"), None)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error_kind"], json!("UpstreamError"));
    assert_eq!(body["status_code"], json!(503));
    assert_eq!(body["body"], json!("overloaded"));
}

#[tokio::test]
async fn admin_routes_require_the_configured_token() {
    let (app, _) = build_app(Some(ADMIN));
    let (status, body) = send(&app, get("/admin/usage", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_kind"], json!("Unauthorized"));

    let (status, _) = send(&app, get("/admin/usage", Some("wrong"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (app, _) = build_app(None);
    let (status, body) = send(
        &app,
        post_json("/admin/limits", json!({"project": "hello", "limit": 1.0}), Some(ADMIN)),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_kind"], json!("NotConfigured"));
}

#[tokio::test]
async fn set_limit_reports_the_row_and_clears_with_null() {
    let (app, _) = build_app(Some(ADMIN));
    let (status, body) = send(
        &app,
        post_json(
            "/admin/limits",
            json!({"project": "hello", "user": "fulano", "model": "gpt-4-0613", "limit": 2.5}),
            Some(ADMIN),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["key"], json!("fulano#hello#gpt-4#dev"));
    assert_eq!(body["limit_usd_micros"], json!(2_500_000));

    let (status, body) = send(
        &app,
        post_json(
            "/admin/limits",
            json!({"project": "hello", "user": "fulano", "model": "gpt-4"}),
            Some(ADMIN),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit_usd_micros"], Value::Null);

    let (status, body) = send(
        &app,
        post_json("/admin/limits", json!({"project": " ", "limit": 1.0}), Some(ADMIN)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_kind"], json!("MalformedRequest"));
}

#[tokio::test]
async fn cache_flush_forces_the_next_call_upstream() {
    let (app, upstream) = build_app(Some(ADMIN));
    set_project_limit(&app, 1.0).await;

    send(&app, post_json("/v1/proxy", proxy_envelope("gpt-4"), None)).await;
    let (status, body) = send(&app, post_json("/admin/cache/flush", json!({}), Some(ADMIN))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"removed": 1}));

    send(&app, post_json("/v1/proxy", proxy_envelope("gpt-4"), None)).await;
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn nocache_alias_bypasses_the_cache() {
    let (app, upstream) = build_app(Some(ADMIN));
    set_project_limit(&app, 1.0).await;

    let mut envelope = proxy_envelope("gpt-4");
    envelope["nocache"] = json!(true);
    send(&app, post_json("/v1/proxy", envelope.clone(), None)).await;
    send(&app, post_json("/v1/proxy", envelope, None)).await;
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn staging_tag_other_than_the_deployment_is_rejected() {
    let (app, upstream) = build_app(Some(ADMIN));
    set_project_limit(&app, 1.0).await;

    let mut envelope = proxy_envelope("gpt-4");
    envelope["staging"] = json!("prod");
    let (status, body) = send(&app, post_json("/v1/proxy", envelope, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_kind"], json!("MalformedRequest"));
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);

    let mut envelope = proxy_envelope("gpt-4");
    envelope["staging"] = json!("dev");
    let (status, _) = send(&app, post_json("/v1/proxy", envelope, None)).await;
    assert_eq!(status, StatusCode::OK);
}
