//! Content-addressed response cache.
//!
//! Keys hash what the upstream sees (method, target, model, body) and never
//! the caller's identity, so identical prompts from different projects share
//! one entry.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::Digest as _;
use thiserror::Error;

use super::{Clock, ProxyResponse, SystemClock};

#[cfg(feature = "gateway-store-redis")]
use super::RedisStoreError;

const CACHE_KEY_VERSION: &[u8] = b"llm-meter-cache-v1";

/// Builds the cache key.
///
/// Every field is length-prefixed before hashing, so moving bytes between
/// fields (or a field that is itself a separator) cannot produce the same
/// digest as another request.
pub fn cache_key(method: &str, target: &str, model: &str, body: &[u8]) -> String {
    let method = method.trim().to_ascii_uppercase();
    let mut hasher = sha2::Sha256::new();
    hasher.update(CACHE_KEY_VERSION);
    for field in [method.as_bytes(), target.trim().as_bytes(), model.as_bytes(), body] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }
    format!("llm-meter-cache-v1-{}", hex_lower(&hasher.finalize()))
}

fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len().saturating_mul(2));
    for &byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[cfg(feature = "gateway-store-redis")]
    #[error(transparent)]
    Redis(#[from] RedisStoreError),
    #[error("cache state poisoned")]
    Poisoned,
}

#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<Option<ProxyResponse>, CacheError>;

    /// Last write wins; a `ttl_seconds` of zero stores nothing.
    async fn store(
        &self,
        key: &str,
        response: &ProxyResponse,
        ttl_seconds: u64,
    ) -> Result<(), CacheError>;

    /// Drops every entry, returning how many were removed when the backend knows.
    async fn clear(&self) -> Result<u64, CacheError>;
}

#[derive(Clone, Debug)]
pub struct MemoryCacheLimits {
    pub max_entries: usize,
    pub max_body_bytes: usize,
    pub max_total_body_bytes: usize,
}

impl Default for MemoryCacheLimits {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_body_bytes: 1024 * 1024,
            max_total_body_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    response: ProxyResponse,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    total_body_bytes: usize,
}

impl Entries {
    fn remove(&mut self, key: &str) -> bool {
        let Some(entry) = self.map.remove(key) else {
            return false;
        };
        self.total_body_bytes = self
            .total_body_bytes
            .saturating_sub(entry.response.body.len());
        self.order.retain(|candidate| candidate != key);
        true
    }
}

/// In-process TTL map. Entries expire passively on lookup; the oldest
/// insertions are dropped when a size bound is exceeded.
pub struct MemoryResponseCache {
    limits: MemoryCacheLimits,
    clock: Arc<dyn Clock>,
    entries: Mutex<Entries>,
}

impl Default for MemoryResponseCache {
    fn default() -> Self {
        Self::new(MemoryCacheLimits::default())
    }
}

impl MemoryResponseCache {
    pub fn new(limits: MemoryCacheLimits) -> Self {
        Self::with_clock(limits, Arc::new(SystemClock))
    }

    pub fn with_clock(limits: MemoryCacheLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits,
            clock,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResponseCache for MemoryResponseCache {
    async fn lookup(&self, key: &str) -> Result<Option<ProxyResponse>, CacheError> {
        let now = self.clock.now_epoch_seconds();
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        let Some(expires_at) = entries.map.get(key).map(|entry| entry.expires_at) else {
            return Ok(None);
        };
        if now >= expires_at {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.map.get(key).map(|entry| entry.response.clone()))
    }

    async fn store(
        &self,
        key: &str,
        response: &ProxyResponse,
        ttl_seconds: u64,
    ) -> Result<(), CacheError> {
        if ttl_seconds == 0 || self.limits.max_entries == 0 {
            return Ok(());
        }
        let body_len = response.body.len();
        if body_len > self.limits.max_body_bytes || body_len > self.limits.max_total_body_bytes {
            return Ok(());
        }

        let expires_at = self.clock.now_epoch_seconds().saturating_add(ttl_seconds);
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        entries.remove(key);
        entries.map.insert(
            key.to_string(),
            CacheEntry {
                response: response.clone(),
                expires_at,
            },
        );
        entries.order.push_back(key.to_string());
        entries.total_body_bytes = entries.total_body_bytes.saturating_add(body_len);

        while entries.map.len() > self.limits.max_entries
            || entries.total_body_bytes > self.limits.max_total_body_bytes
        {
            let Some(oldest) = entries.order.front().cloned() else {
                break;
            };
            entries.remove(&oldest);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<u64, CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        let removed = entries.map.len() as u64;
        *entries = Entries::default();
        Ok(removed)
    }
}
