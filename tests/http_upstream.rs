use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use httpmock::Method::POST;
use httpmock::MockServer;
use llm_meter::gateway::cache::MemoryResponseCache;
use llm_meter::gateway::costing::PricingTable;
use llm_meter::gateway::ledger::{BillingPeriod, MemoryLedger, UsageKey, UsageLedger};
use llm_meter::gateway::upstream::{HttpUpstream, Upstream, UpstreamRequest};
use llm_meter::gateway::{
    Clock, MeteredProxy, ProxyError, ProxyErrorKind, ProxyRequest, ProxySettings, UpstreamConfig,
};
use serde_json::json;

struct FixedClock(u64);

impl Clock for FixedClock {
    fn now_epoch_seconds(&self) -> u64 {
        self.0
    }
}

fn upstream_config(base_url: String) -> UpstreamConfig {
    UpstreamConfig {
        base_url,
        api_key: Some("sk-test".to_string()),
        api_key_env: "LLM_METER_TEST_UNSET_KEY".to_string(),
        organization: Some("org-test".to_string()),
        ..UpstreamConfig::default()
    }
}

fn chat_request(body: serde_json::Value) -> UpstreamRequest {
    UpstreamRequest {
        method: "POST".to_string(),
        target: "/v1/chat/completions".to_string(),
        headers: BTreeMap::from([
            ("content-type".to_string(), "application/json".to_string()),
            ("x-request-id".to_string(), "req-1".to_string()),
        ]),
        body: Bytes::from(body.to_string()),
    }
}

#[tokio::test]
async fn forwards_with_upstream_credentials_and_parses_usage() -> llm_meter::Result<()> {
    if llm_meter::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("authorization", "Bearer sk-test")
            .header("openai-organization", "org-test")
            .header("x-request-id", "req-1")
            .json_body(json!({"model": "gpt-4", "messages": []}));
        then.status(200)
            .header("content-type", "application/json")
            .body(
                json!({
                    "id": "chatcmpl_1",
                    "model": "gpt-4-0613",
                    "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
                })
                .to_string(),
            );
    });

    let client = HttpUpstream::new(&upstream_config(upstream.base_url()))?;
    let forwarded = client
        .forward(chat_request(json!({"model": "gpt-4", "messages": []})))
        .await?;

    mock.assert();
    assert_eq!(forwarded.response.status_code, 200);
    assert_eq!(forwarded.model.as_deref(), Some("gpt-4-0613"));
    let usage = forwarded.usage.expect("usage");
    assert_eq!(usage.prompt_tokens, 12);
    assert_eq!(usage.completion_tokens, 3);
    assert!(forwarded.accruable());
    assert_eq!(
        forwarded
            .response
            .headers
            .get("content-type")
            .map(String::as_str),
        Some("application/json")
    );
    Ok(())
}

#[tokio::test]
async fn non_success_status_is_relayed_as_upstream_error() -> llm_meter::Result<()> {
    if llm_meter::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(429)
            .header("content-type", "application/json")
            .body(r#"{"error":{"message":"rate limited"}}"#);
    });

    let client = HttpUpstream::new(&upstream_config(upstream.base_url()))?;
    let err = client
        .forward(chat_request(json!({"model": "gpt-4"})))
        .await
        .expect_err("429");

    mock.assert_calls(1);
    assert_eq!(
        err,
        ProxyError::UpstreamError {
            status: 429,
            body: r#"{"error":{"message":"rate limited"}}"#.to_string(),
        }
    );
    Ok(())
}

#[tokio::test]
async fn oversized_error_body_is_capped_and_marked() -> llm_meter::Result<()> {
    if llm_meter::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(500).body("e".repeat(2 * 1024 * 1024));
    });

    let client = HttpUpstream::new(&upstream_config(upstream.base_url()))?;
    let err = client
        .forward(chat_request(json!({"model": "gpt-4"})))
        .await
        .expect_err("500");
    let (status, body) = match err {
        ProxyError::UpstreamError { status, body } => (status, body),
        other => panic!("expected an upstream error, got {other:?}"),
    };
    assert_eq!(status, 500);
    assert!(body.ends_with("...(truncated)"));
    assert!(body.starts_with(&"e".repeat(1024 * 1024)));
    assert!(body.len() < 1024 * 1024 + 32);
    Ok(())
}

#[tokio::test]
async fn unreachable_upstream_is_unavailable() -> llm_meter::Result<()> {
    let client = HttpUpstream::new(&UpstreamConfig {
        connect_timeout_seconds: 1,
        request_timeout_seconds: 2,
        ..upstream_config("http://127.0.0.1:1".to_string())
    })?;
    let err = client
        .forward(chat_request(json!({"model": "gpt-4"})))
        .await
        .expect_err("connection refused");
    assert_eq!(err.kind(), ProxyErrorKind::UpstreamUnavailable);
    Ok(())
}

#[tokio::test]
async fn oversized_success_body_is_not_relayed() -> llm_meter::Result<()> {
    if llm_meter::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).body("x".repeat(4096));
    });

    let client = HttpUpstream::new(&UpstreamConfig {
        max_body_bytes: 1024,
        ..upstream_config(upstream.base_url())
    })?;
    let err = client
        .forward(chat_request(json!({"model": "gpt-4"})))
        .await
        .expect_err("truncated");
    assert_eq!(err.kind(), ProxyErrorKind::UpstreamUnavailable);
    Ok(())
}

#[tokio::test]
async fn metered_proxy_bills_and_caches_a_live_upstream_call() -> llm_meter::Result<()> {
    if llm_meter::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("authorization", "Bearer sk-test");
        then.status(200)
            .header("content-type", "application/json")
            .body(
                json!({
                    "model": "gpt-3.5-turbo-0613",
                    "choices": [{"message": {"role": "assistant", "content": "hello"}}],
                    "usage": {"prompt_tokens": 1000, "completion_tokens": 1000}
                })
                .to_string(),
            );
    });

    let ledger = Arc::new(MemoryLedger::new());
    ledger
        .set_limit(&UsageKey::project("hello", "dev"), Some(1_000_000))
        .await
        .expect("limit");
    let client = HttpUpstream::new(&upstream_config(upstream.base_url()))?;
    // 2023-10-14T00:00:00Z
    let clock = Arc::new(FixedClock(1_697_241_600));
    let proxy = MeteredProxy::new(
        ledger.clone(),
        Arc::new(MemoryResponseCache::default()),
        Arc::new(client),
        PricingTable::default(),
    )
    .with_clock(clock);

    let request = ProxyRequest {
        user: "fulano".to_string(),
        project: "hello".to_string(),
        method: "POST".to_string(),
        target: "/v1/chat/completions".to_string(),
        body: Bytes::from(json!({"model": "gpt-3.5-turbo", "messages": []}).to_string()),
        // Callers' own credentials never reach the upstream.
        headers: BTreeMap::from([("authorization".to_string(), "Bearer caller".to_string())]),
        ..ProxyRequest::default()
    };
    let settings = ProxySettings::default();
    let first = proxy.handle(&settings, request.clone()).await?;
    let second = proxy.handle(&settings, request).await?;

    mock.assert_calls(1);
    assert_eq!(first, second);
    let snapshot = ledger
        .get(
            &UsageKey::project("hello", "dev"),
            &BillingPeriod::from_epoch_seconds(1_697_241_600),
        )
        .await
        .expect("get");
    assert_eq!(snapshot.usage_usd_micros, 3_500);
    Ok(())
}
