use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;

use super::config::UpstreamConfig;
use super::{ProxyError, ProxyResponse};
use crate::utils::http::{body_text, read_body_bounded};

const MAX_ERROR_BODY_BYTES: usize = 1024 * 1024;

/// Headers that describe the inbound hop and must not be replayed upstream.
const HOP_HEADERS: [&str; 6] = [
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
];

#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub method: String,
    pub target: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

/// Token counts from a success body; missing or non-integer counts are 0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A 2xx answer from the upstream, plus what the proxy needs for accrual.
#[derive(Clone, Debug)]
pub struct UpstreamResponse {
    pub response: ProxyResponse,
    /// `model` reported in the response body, if any.
    pub model: Option<String>,
    /// Token counts; `None` when the body is not a JSON object.
    pub usage: Option<TokenUsage>,
    /// The body carried an `error` field despite the success status.
    pub carries_error: bool,
}

impl UpstreamResponse {
    /// Only bodies that parsed and carry no error are billed and cached.
    pub fn accruable(&self) -> bool {
        !self.carries_error && self.usage.is_some()
    }

    pub fn from_response(response: ProxyResponse) -> Self {
        let (model, usage, carries_error) = inspect_body(&response.body);
        Self {
            response,
            model,
            usage,
            carries_error,
        }
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// One attempt; transport failures and non-2xx statuses come back as errors.
    async fn forward(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProxyError>;
}

#[derive(Clone)]
pub struct HttpUpstream {
    base_url: String,
    client: reqwest::Client,
    credentials: HeaderMap,
    max_body_bytes: usize,
}

impl std::fmt::Debug for HttpUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUpstream")
            .field("base_url", &self.base_url)
            .field("credentials", &"<redacted>")
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds.max(1)))
            .timeout(Duration::from_secs(config.request_timeout_seconds.max(1)))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_seconds))
            .build()?;

        let mut credentials = HeaderMap::new();
        if let Some(api_key) = config.resolved_api_key() {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|_| {
                ProxyError::MalformedRequest {
                    reason: "upstream api key is not a valid header value".to_string(),
                }
            })?;
            credentials.insert(axum::http::header::AUTHORIZATION, value);
        }
        if let Some(organization) = config.organization.as_deref() {
            let value = HeaderValue::from_str(organization).map_err(|_| {
                ProxyError::MalformedRequest {
                    reason: "upstream organization is not a valid header value".to_string(),
                }
            })?;
            credentials.insert(HeaderName::from_static("openai-organization"), value);
        }

        Ok(Self {
            base_url: config.base_url.clone(),
            client,
            credentials,
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn resolve_target(&self, target: &str) -> Result<String, ProxyError> {
        let target = target.trim();
        if target.starts_with("http://") || target.starts_with("https://") {
            let base = self.base_url.trim_end_matches('/');
            let within_base = target
                .strip_prefix(base)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '?']));
            if !within_base {
                return Err(ProxyError::MalformedRequest {
                    reason: format!("target {target} is outside the upstream {base}"),
                });
            }
            return Ok(target.to_string());
        }
        Ok(join_base_url(&self.base_url, target))
    }

    fn outbound_headers(&self, headers: &BTreeMap<String, String>) -> Result<HeaderMap, ProxyError> {
        let mut out = HeaderMap::new();
        for (name, value) in headers {
            let lowered = name.trim().to_ascii_lowercase();
            if HOP_HEADERS.contains(&lowered.as_str()) {
                continue;
            }
            let header_name =
                lowered
                    .parse::<HeaderName>()
                    .map_err(|_| ProxyError::MalformedRequest {
                        reason: format!("invalid header name: {name}"),
                    })?;
            let header_value =
                value
                    .parse::<HeaderValue>()
                    .map_err(|_| ProxyError::MalformedRequest {
                        reason: format!("invalid header value for {name}"),
                    })?;
            out.insert(header_name, header_value);
        }
        for (name, value) in &self.credentials {
            out.insert(name.clone(), value.clone());
        }
        Ok(out)
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProxyError> {
        let method = reqwest::Method::from_bytes(request.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| ProxyError::MalformedRequest {
                reason: format!("invalid method: {}", request.method),
            })?;
        let url = self.resolve_target(&request.target)?;
        let headers = self.outbound_headers(&request.headers)?;

        let mut builder = self.client.request(method, url).headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let reason_phrase = status.canonical_reason().unwrap_or_default().to_string();
        let response_headers = flatten_headers(response.headers());

        let limit = if status.is_success() {
            self.max_body_bytes
        } else {
            self.max_body_bytes.min(MAX_ERROR_BODY_BYTES)
        };
        let (body, truncated) = read_body_bounded(response, limit)
            .await
            .map_err(transport_error)?;

        if !status.is_success() {
            return Err(ProxyError::UpstreamError {
                status: status.as_u16(),
                body: body_text(&body, truncated),
            });
        }
        if truncated {
            return Err(ProxyError::UpstreamUnavailable {
                message: format!(
                    "upstream response exceeded {} bytes",
                    self.max_body_bytes
                ),
            });
        }

        Ok(UpstreamResponse::from_response(ProxyResponse {
            status_code: status.as_u16(),
            headers: response_headers,
            body,
            reason_phrase,
        }))
    }
}

fn transport_error(err: reqwest::Error) -> ProxyError {
    let message = if err.is_timeout() {
        format!("upstream request timed out: {err}")
    } else {
        format!("upstream request failed: {err}")
    };
    ProxyError::UpstreamUnavailable { message }
}

fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

/// Reads `model`, `usage` and `error` field by field, so a `null` or
/// oddly typed field never hides the rest of a billable body.
fn inspect_body(body: &[u8]) -> (Option<String>, Option<TokenUsage>, bool) {
    let Ok(serde_json::Value::Object(parsed)) = serde_json::from_slice::<serde_json::Value>(body)
    else {
        return (None, None, false);
    };
    let model = parsed
        .get("model")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);
    let count = |field: &str| {
        parsed
            .get("usage")
            .and_then(|usage| usage.get(field))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
    };
    let usage = TokenUsage {
        prompt_tokens: count("prompt_tokens"),
        completion_tokens: count("completion_tokens"),
    };
    let carries_error = parsed.get("error").is_some_and(|error| !error.is_null());
    (model, Some(usage), carries_error)
}

fn join_base_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path_no_leading_slash = path.strip_prefix('/').unwrap_or(path);

    // Tolerate a base_url that already ends in /v1 together with /v1/* targets.
    if base.ends_with("/v1") {
        if path_no_leading_slash == "v1" {
            return base.to_string();
        }
        if let Some(rest) = path_no_leading_slash.strip_prefix("v1/") {
            return format!("{base}/{rest}");
        }
    }
    format!("{base}/{path_no_leading_slash}")
}
