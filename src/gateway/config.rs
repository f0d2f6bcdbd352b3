use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ProxySettings;

pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 60 * 60 * 24;
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const DEFAULT_ORGANIZATION_ENV: &str = "OPENAI_ORGANIZATION";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration for the `llm-meter` binary.
#[derive(Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Deployment tag used as the last component of every ledger key.
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_litellm_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            cache: CacheConfig::default(),
            upstream: UpstreamConfig::default(),
            store: StoreConfig::default(),
            pricing_litellm_path: None,
            admin_token: None,
        }
    }
}

impl std::fmt::Debug for MeterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeterConfig")
            .field("environment", &self.environment)
            .field("cache", &self.cache)
            .field("upstream", &self.upstream)
            .field("store", &self.store)
            .field("pricing_litellm_path", &self.pricing_litellm_path)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl MeterConfig {
    /// Loads TOML, or JSON when the file ends in `.json`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config: Self = if is_json {
            serde_json::from_str(&raw)?
        } else {
            toml::from_str(&raw)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.trim().is_empty() {
            return Err(ConfigError::Invalid("environment must not be empty".to_string()));
        }
        if self.upstream.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "upstream.base_url must not be empty".to_string(),
            ));
        }
        match self.store.kind {
            StoreKind::Redis if self.store.redis_url.is_none() => Err(ConfigError::Invalid(
                "store.redis_url is required for the redis store".to_string(),
            )),
            StoreKind::Sqlite if self.store.sqlite_path.is_none() => Err(ConfigError::Invalid(
                "store.sqlite_path is required for the sqlite store".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn settings(&self) -> ProxySettings {
        ProxySettings {
            environment: self.environment.clone(),
            caching_enabled: self.cache.enabled,
            cache_ttl_seconds: self.cache.ttl_seconds,
        }
    }
}

fn default_environment() -> String {
    "dev".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: DEFAULT_CACHE_TTL_SECONDS,
            max_entries: default_cache_max_entries(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL_SECONDS
}

fn default_cache_max_entries() -> usize {
    1024
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is unset.
    pub api_key_env: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    pub connect_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout_seconds: u64,
    pub max_body_bytes: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            organization: None,
            connect_timeout_seconds: 5,
            request_timeout_seconds: 600,
            pool_max_idle_per_host: 20,
            pool_idle_timeout_seconds: 5,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

impl UpstreamConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| env_nonempty(&self.api_key_env))
    }

    /// Fills `organization` from `OPENAI_ORGANIZATION` when not configured.
    pub fn with_env_organization(mut self) -> Self {
        if self.organization.is_none() {
            self.organization = env_nonempty(DEFAULT_ORGANIZATION_ENV);
        }
        self
    }
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_env", &self.api_key_env)
            .field("organization", &self.organization)
            .field("connect_timeout_seconds", &self.connect_timeout_seconds)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .field("pool_max_idle_per_host", &self.pool_max_idle_per_host)
            .field("pool_idle_timeout_seconds", &self.pool_idle_timeout_seconds)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Redis,
    Sqlite,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<PathBuf>,
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
