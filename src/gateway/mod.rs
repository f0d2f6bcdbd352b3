//! Metered proxy: quota check, response cache, upstream call and cost accrual.

pub mod cache;
pub mod config;
pub mod costing;
pub mod envelope;
pub mod http;
pub mod ledger;
pub mod observability;
pub mod quota;
pub mod telemetry;
pub mod upstream;

#[cfg(feature = "gateway-store-redis")]
pub mod redis_store;
#[cfg(feature = "gateway-store-sqlite")]
pub mod sqlite_store;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Instrument as _;

use cache::{CacheError, ResponseCache};
use costing::{PricingTable, usd_to_usd_micros};
use ledger::{BillingPeriod, LedgerError, UsageKey, UsageLedger, UsageRecord, WILDCARD};
use observability::{Observability, ObservabilitySnapshot};
use quota::{QuotaResolver, QuotaSubject};
use upstream::{Upstream, UpstreamRequest};

pub use config::{CacheConfig, MeterConfig, StoreConfig, StoreKind, UpstreamConfig};
pub use envelope::{ErrorEnvelope, ProxyRequestEnvelope};
pub use http::{ProxyHttpState, router};
#[cfg(feature = "gateway-store-redis")]
pub use redis_store::{RedisStore, RedisStoreError};
#[cfg(feature = "gateway-store-sqlite")]
pub use sqlite_store::{SqliteStore, SqliteStoreError};

const MODEL_HEADER: &str = "openai-model";

/// One call as the caller hands it to the proxy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxyRequest {
    pub user: String,
    pub project: String,
    /// Explicit model; falls back to the `openai-model` header, then the body.
    pub model: Option<String>,
    pub method: String,
    /// Absolute URL under the upstream base, or a path relative to it.
    pub target: String,
    pub body: Bytes,
    pub headers: BTreeMap<String, String>,
    /// Must match `ProxySettings::environment` when given; ledger rows always
    /// use the configured tag.
    pub environment: Option<String>,
    pub bypass_cache: bool,
}

impl ProxyRequest {
    /// Model named by the call, without normalization.
    pub fn requested_model(&self) -> Option<String> {
        if let Some(model) = self.model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            return Some(model.to_string());
        }
        let from_header = self
            .headers
            .iter()
            .find(|(name, _)| name.trim().eq_ignore_ascii_case(MODEL_HEADER))
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty());
        if let Some(model) = from_header {
            return Some(model.to_string());
        }
        serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()?
            .get("model")?
            .as_str()
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .map(str::to_string)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(rename = "content", with = "envelope::base64_bytes")]
    pub body: Bytes,
    #[serde(default)]
    pub reason_phrase: String,
}

/// Per-invocation knobs, passed explicitly on every call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub environment: String,
    pub caching_enabled: bool,
    pub cache_ttl_seconds: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            caching_enabled: true,
            cache_ttl_seconds: config::DEFAULT_CACHE_TTL_SECONDS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProxyError {
    #[error("Project {project} must have a usage limit")]
    ProjectUnconfigured { project: String },
    #[error("Project {project} usage limit exceeded")]
    ProjectQuotaExceeded { project: String },
    #[error("Project {project} usage limit exceeded for model {model}")]
    ModelQuotaExceeded { project: String, model: String },
    #[error("User {user} usage limit exceeded for project {project} and model {model}")]
    UserQuotaExceeded {
        user: String,
        project: String,
        model: String,
    },
    #[error("upstream unavailable: {message}")]
    UpstreamUnavailable { message: String },
    /// `body` is the upstream body as lossy UTF-8, capped at 1 MiB with a
    /// trailing `...(truncated)` marker when cut.
    #[error("upstream returned {status}: {body}")]
    UpstreamError { status: u16, body: String },
    #[error("malformed request: {reason}")]
    MalformedRequest { reason: String },
    #[error("usage ledger unavailable: {message}")]
    LedgerUnavailable { message: String },
}

impl ProxyError {
    pub fn kind(&self) -> ProxyErrorKind {
        match self {
            Self::ProjectUnconfigured { .. } => ProxyErrorKind::ProjectUnconfigured,
            Self::ProjectQuotaExceeded { .. } => ProxyErrorKind::ProjectQuotaExceeded,
            Self::ModelQuotaExceeded { .. } => ProxyErrorKind::ModelQuotaExceeded,
            Self::UserQuotaExceeded { .. } => ProxyErrorKind::UserQuotaExceeded,
            Self::UpstreamUnavailable { .. } => ProxyErrorKind::UpstreamUnavailable,
            Self::UpstreamError { .. } => ProxyErrorKind::UpstreamError,
            Self::MalformedRequest { .. } => ProxyErrorKind::MalformedRequest,
            Self::LedgerUnavailable { .. } => ProxyErrorKind::LedgerUnavailable,
        }
    }

    pub fn is_quota_denial(&self) -> bool {
        matches!(
            self.kind(),
            ProxyErrorKind::ProjectUnconfigured
                | ProxyErrorKind::ProjectQuotaExceeded
                | ProxyErrorKind::ModelQuotaExceeded
                | ProxyErrorKind::UserQuotaExceeded
        )
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope::from(self)
    }
}

impl From<LedgerError> for ProxyError {
    fn from(err: LedgerError) -> Self {
        Self::LedgerUnavailable {
            message: err.to_string(),
        }
    }
}

/// Stable wire tag of a [`ProxyError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProxyErrorKind {
    ProjectUnconfigured,
    ProjectQuotaExceeded,
    ModelQuotaExceeded,
    UserQuotaExceeded,
    UpstreamUnavailable,
    UpstreamError,
    MalformedRequest,
    LedgerUnavailable,
}

impl ProxyErrorKind {
    pub const ALL: [ProxyErrorKind; 8] = [
        Self::ProjectUnconfigured,
        Self::ProjectQuotaExceeded,
        Self::ModelQuotaExceeded,
        Self::UserQuotaExceeded,
        Self::UpstreamUnavailable,
        Self::UpstreamError,
        Self::MalformedRequest,
        Self::LedgerUnavailable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProjectUnconfigured => "ProjectUnconfigured",
            Self::ProjectQuotaExceeded => "ProjectQuotaExceeded",
            Self::ModelQuotaExceeded => "ModelQuotaExceeded",
            Self::UserQuotaExceeded => "UserQuotaExceeded",
            Self::UpstreamUnavailable => "UpstreamUnavailable",
            Self::UpstreamError => "UpstreamError",
            Self::MalformedRequest => "MalformedRequest",
            Self::LedgerUnavailable => "LedgerUnavailable",
        }
    }
}

impl fmt::Display for ProxyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyErrorKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == raw)
            .ok_or_else(|| format!("unknown error kind: {raw}"))
    }
}

/// Where a call is in its lifecycle; recorded on the `proxy` span.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyStage {
    Received,
    QuotaChecked,
    CacheChecked,
    Forwarded,
    Accrued,
    Responded,
}

impl ProxyStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::QuotaChecked => "quota_checked",
            Self::CacheChecked => "cache_checked",
            Self::Forwarded => "forwarded",
            Self::Accrued => "accrued",
            Self::Responded => "responded",
        }
    }
}

fn enter_stage(stage: ProxyStage) {
    tracing::Span::current().record("stage", stage.as_str());
    tracing::debug!(stage = stage.as_str(), "proxy stage");
}

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_secs()
    }
}

/// Limit assignment from the admin surface. `user` and `model` default to
/// the wildcard; a missing `limit` clears the ceiling.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LimitRequest {
    #[serde(default)]
    pub user: Option<String>,
    pub project: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    /// USD.
    #[serde(default)]
    pub limit: Option<f64>,
}

pub struct MeteredProxy {
    ledger: Arc<dyn UsageLedger>,
    cache: Arc<dyn ResponseCache>,
    upstream: Arc<dyn Upstream>,
    pricing: PricingTable,
    quota: QuotaResolver,
    observability: Observability,
    clock: Arc<dyn Clock>,
}

impl MeteredProxy {
    pub fn new(
        ledger: Arc<dyn UsageLedger>,
        cache: Arc<dyn ResponseCache>,
        upstream: Arc<dyn Upstream>,
        pricing: PricingTable,
    ) -> Self {
        Self {
            ledger,
            cache,
            upstream,
            pricing,
            quota: QuotaResolver,
            observability: Observability::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    fn period(&self) -> BillingPeriod {
        BillingPeriod::from_epoch_seconds(self.clock.now_epoch_seconds())
    }

    pub async fn handle(
        &self,
        settings: &ProxySettings,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, ProxyError> {
        let span = tracing::info_span!(
            "proxy",
            user = tracing::field::Empty,
            project = tracing::field::Empty,
            model = tracing::field::Empty,
            environment = tracing::field::Empty,
            stage = tracing::field::Empty,
            cache = tracing::field::Empty,
            status = tracing::field::Empty,
        );
        async move {
            self.observability.record_request();
            let result = self.handle_inner(settings, request).await;
            match &result {
                Ok(response) => {
                    tracing::Span::current().record("status", response.status_code);
                }
                Err(err) => {
                    if err.is_quota_denial() {
                        self.observability.record_quota_denied();
                        tracing::info!(error_kind = err.kind().as_str(), "{err}");
                    } else {
                        tracing::warn!(error_kind = err.kind().as_str(), "{err}");
                    }
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn handle_inner(
        &self,
        settings: &ProxySettings,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, ProxyError> {
        enter_stage(ProxyStage::Received);
        let requested_model = self.validate(settings, &request)?;
        let model = self.pricing.canonical_model(&requested_model).to_string();
        let environment = settings.environment.clone();

        let span = tracing::Span::current();
        span.record("user", request.user.as_str());
        span.record("project", request.project.as_str());
        span.record("model", model.as_str());
        span.record("environment", environment.as_str());

        let subject = QuotaSubject {
            user: &request.user,
            project: &request.project,
            model: &model,
            environment: &environment,
        };

        let decision = self
            .quota
            .check(self.ledger.as_ref(), &subject, &self.period())
            .await
            .inspect_err(|err| {
                if matches!(err, ProxyError::LedgerUnavailable { .. }) {
                    self.observability.record_ledger_failure();
                }
            })?;
        enter_stage(ProxyStage::QuotaChecked);
        tracing::debug!(
            project_usage = decision.project.usage_usd_micros,
            project_model_usage = decision.project_model.usage_usd_micros,
            user_usage = decision.user.usage_usd_micros,
            "quota admitted"
        );

        let use_cache = settings.caching_enabled && !request.bypass_cache;
        let key = cache::cache_key(&request.method, &request.target, &requested_model, &request.body);
        if use_cache {
            match self.cache.lookup(&key).await {
                Ok(Some(hit)) => {
                    enter_stage(ProxyStage::CacheChecked);
                    span.record("cache", "hit");
                    self.observability.record_cache_hit();
                    enter_stage(ProxyStage::Responded);
                    return Ok(hit);
                }
                Ok(None) => {
                    span.record("cache", "miss");
                }
                Err(err) => {
                    span.record("cache", "error");
                    tracing::warn!(error = %err, "cache lookup failed; forwarding");
                }
            }
        } else {
            span.record("cache", "bypass");
        }
        enter_stage(ProxyStage::CacheChecked);

        self.observability.record_upstream_call();
        let forwarded = self
            .upstream
            .forward(UpstreamRequest {
                method: request.method.clone(),
                target: request.target.clone(),
                headers: request.headers.clone(),
                body: request.body.clone(),
            })
            .await
            .inspect_err(|_| self.observability.record_upstream_failure())?;
        enter_stage(ProxyStage::Forwarded);

        let accruable = forwarded.accruable();
        if let (true, Some(usage)) = (accruable, forwarded.usage) {
            let priced_model = forwarded.model.as_deref().unwrap_or(&requested_model);
            let cost = self.pricing.cost_usd_micros(
                priced_model,
                usage.prompt_tokens,
                usage.completion_tokens,
            );
            self.accrue(&subject, cost).await?;
            tracing::info!(
                priced_model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                cost_usd_micros = cost,
                "usage accrued"
            );
        } else {
            tracing::warn!(
                carries_error = forwarded.carries_error,
                "upstream body has no billable usage; not accrued or cached"
            );
        }
        enter_stage(ProxyStage::Accrued);

        if use_cache && accruable {
            if let Err(err) = self
                .cache
                .store(&key, &forwarded.response, settings.cache_ttl_seconds)
                .await
            {
                tracing::warn!(error = %err, "cache store failed");
            }
        }
        enter_stage(ProxyStage::Responded);
        Ok(forwarded.response)
    }

    /// Rejects requests whose identity would alias an aggregate row or leave
    /// the deployment's environment.
    fn validate(
        &self,
        settings: &ProxySettings,
        request: &ProxyRequest,
    ) -> Result<String, ProxyError> {
        let malformed = |reason: String| {
            self.observability.record_malformed();
            ProxyError::MalformedRequest { reason }
        };
        let user = request.user.trim();
        if user.is_empty() {
            return Err(malformed("missing user".to_string()));
        }
        if user == WILDCARD {
            return Err(malformed(format!("user {WILDCARD} is reserved")));
        }
        if request.project.trim().is_empty() {
            return Err(malformed("missing project".to_string()));
        }
        if request.target.trim().is_empty() {
            return Err(malformed("missing target".to_string()));
        }
        if let Some(environment) = request
            .environment
            .as_deref()
            .map(str::trim)
            .filter(|env| !env.is_empty() && *env != settings.environment)
        {
            return Err(malformed(format!(
                "environment {environment} does not match this deployment ({})",
                settings.environment
            )));
        }
        let model = request
            .requested_model()
            .ok_or_else(|| malformed("missing model".to_string()))?;
        if model == WILDCARD || self.pricing.canonical_model(&model) == WILDCARD {
            return Err(malformed(format!("model {model} is reserved")));
        }
        Ok(model)
    }

    /// Accrues into the user, project+model and project rows, in that order.
    async fn accrue(&self, subject: &QuotaSubject<'_>, cost: u64) -> Result<(), ProxyError> {
        let period = self.period();
        for key in subject.accrual_keys() {
            if let Err(err) = self.ledger.accrue(&key, &period, cost).await {
                self.observability.record_ledger_failure();
                tracing::error!(key = %key, period = %period, error = %err, "accrual failed");
                return Err(err.into());
            }
        }
        self.observability.record_accrued(cost);
        Ok(())
    }

    /// Sets (or clears) one ceiling and returns the row it landed on.
    pub async fn admin_set_limit(
        &self,
        settings: &ProxySettings,
        request: LimitRequest,
    ) -> Result<(UsageKey, Option<u64>), ProxyError> {
        let project = request.project.trim();
        if project.is_empty() {
            return Err(ProxyError::MalformedRequest {
                reason: "missing project".to_string(),
            });
        }
        let limit_usd_micros = match request.limit {
            None => None,
            Some(usd) => Some(usd_to_usd_micros(usd).ok_or_else(|| {
                ProxyError::MalformedRequest {
                    reason: format!("invalid limit: {usd}"),
                }
            })?),
        };
        let wildcard_or = |value: Option<String>| {
            value
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| WILDCARD.to_string())
        };
        let model = wildcard_or(request.model);
        let model = if model == WILDCARD {
            model
        } else {
            self.pricing.canonical_model(&model).to_string()
        };
        let environment = request
            .environment
            .filter(|env| !env.trim().is_empty())
            .unwrap_or_else(|| settings.environment.clone());

        let key = UsageKey::new(wildcard_or(request.user), project, model, environment);
        self.ledger.set_limit(&key, limit_usd_micros).await?;
        tracing::info!(key = %key, limit_usd_micros, "usage limit set");
        Ok((key, limit_usd_micros))
    }

    pub async fn flush_cache(&self) -> Result<u64, CacheError> {
        let removed = self.cache.clear().await?;
        tracing::info!(removed, "response cache flushed");
        Ok(removed)
    }

    pub async fn list_usage(&self) -> Result<Vec<UsageRecord>, ProxyError> {
        Ok(self.ledger.list().await?)
    }
}
