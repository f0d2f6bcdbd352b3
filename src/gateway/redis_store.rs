use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;

use super::ProxyResponse;
use super::cache::{CacheError, ResponseCache};
use super::ledger::{BillingPeriod, LedgerError, UsageKey, UsageLedger, UsageRecord, UsageSnapshot};

const LIMIT_FIELD: &str = "limit";
const DESCRIPTIVE_FIELDS: [&str; 4] = ["user", "project", "model", "environment"];

/// Shared ledger and response cache for multi-replica deployments.
///
/// Each usage row is a hash at `<prefix>:usage:<composite>` whose fields are
/// the period labels, `limit` and the descriptive key components. Accrual is
/// a single `HINCRBY`, so concurrent replicas never lose an increment.
#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

#[derive(Debug, Error)]
pub enum RedisStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, RedisStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "llm_meter".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key_usage_keys(&self) -> String {
        format!("{}:usage_keys", self.prefix)
    }

    fn key_usage(&self, composite: &str) -> String {
        format!("{}:usage:{composite}", self.prefix)
    }

    fn key_cache(&self, cache_key: &str) -> String {
        format!("{}:cache:{cache_key}", self.prefix)
    }

    async fn read_usage(
        &self,
        key: &UsageKey,
        period: &BillingPeriod,
    ) -> Result<UsageSnapshot, RedisStoreError> {
        let mut conn = self.connection().await?;
        let (usage, limit): (Option<u64>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.key_usage(&key.composite()))
            .arg(period.label())
            .arg(LIMIT_FIELD)
            .query_async(&mut conn)
            .await?;
        Ok(UsageSnapshot {
            usage_usd_micros: usage.unwrap_or(0),
            limit_usd_micros: limit,
        })
    }

    async fn increment_usage(
        &self,
        key: &UsageKey,
        period: &BillingPeriod,
        usd_micros: u64,
    ) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let composite = key.composite();
        let row_key = self.key_usage(&composite);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hincr(&row_key, period.label(), micros_to_i64(usd_micros));
        describe_row(&mut pipe, &row_key, key);
        let _: () = pipe
            .sadd(self.key_usage_keys(), &composite)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn write_limit(
        &self,
        key: &UsageKey,
        limit_usd_micros: Option<u64>,
    ) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let composite = key.composite();
        let row_key = self.key_usage(&composite);
        let mut pipe = redis::pipe();
        pipe.atomic();
        match limit_usd_micros {
            Some(limit) => pipe.hset(&row_key, LIMIT_FIELD, limit),
            None => pipe.hdel(&row_key, LIMIT_FIELD),
        };
        describe_row(&mut pipe, &row_key, key);
        let _: () = pipe
            .sadd(self.key_usage_keys(), &composite)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn list_usage_records(&self) -> Result<Vec<UsageRecord>, RedisStoreError> {
        let mut conn = self.connection().await?;
        let mut composites: Vec<String> = conn.smembers(self.key_usage_keys()).await?;
        composites.sort();

        let mut out = Vec::with_capacity(composites.len());
        for composite in composites {
            let raw: HashMap<String, String> = conn.hgetall(self.key_usage(&composite)).await?;
            if raw.is_empty() {
                continue;
            }
            let field = |name: &str| raw.get(name).cloned().unwrap_or_default();
            let periods: BTreeMap<String, u64> = raw
                .iter()
                .filter(|(name, _)| is_period_label(name))
                .filter_map(|(name, value)| Some((name.clone(), value.parse::<u64>().ok()?)))
                .collect();
            out.push(UsageRecord {
                user: field("user"),
                project: field("project"),
                model: field("model"),
                environment: field("environment"),
                limit_usd_micros: raw.get(LIMIT_FIELD).and_then(|value| value.parse().ok()),
                periods,
                composite_key: composite,
            });
        }
        Ok(out)
    }

    pub async fn get_cached_response(
        &self,
        cache_key: &str,
    ) -> Result<Option<ProxyResponse>, RedisStoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(self.key_cache(cache_key)).await?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(RedisStoreError::from)
    }

    pub async fn set_cached_response(
        &self,
        cache_key: &str,
        response: &ProxyResponse,
        ttl_seconds: u64,
    ) -> Result<(), RedisStoreError> {
        if ttl_seconds == 0 {
            return Ok(());
        }
        let payload = serde_json::to_string(response)?;
        let mut conn = self.connection().await?;
        let _: () = conn
            .set_ex(self.key_cache(cache_key), payload, ttl_seconds)
            .await?;
        Ok(())
    }

    pub async fn clear_cached_responses(&self) -> Result<u64, RedisStoreError> {
        let pattern = format!("{}:cache:*", self.prefix);
        let mut conn = self.connection().await?;
        let mut deleted = 0u64;
        let mut cursor = "0".to_string();
        loop {
            let (next_cursor, keys): (String, Vec<String>) = redis::cmd("SCAN")
                .arg(&cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(256)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let removed: u64 = conn.del(keys).await?;
                deleted = deleted.saturating_add(removed);
            }
            if next_cursor == "0" {
                break;
            }
            cursor = next_cursor;
        }
        Ok(deleted)
    }
}

fn describe_row(pipe: &mut redis::Pipeline, row_key: &str, key: &UsageKey) {
    let values = [&key.user, &key.project, &key.model, &key.environment];
    for (field, value) in DESCRIPTIVE_FIELDS.iter().zip(values) {
        pipe.hset(row_key, *field, value.as_str()).ignore();
    }
}

fn is_period_label(field: &str) -> bool {
    field.len() == 4 && field.bytes().all(|b| b.is_ascii_digit())
}

fn micros_to_i64(micros: u64) -> i64 {
    i64::try_from(micros).unwrap_or(i64::MAX)
}

#[async_trait]
impl UsageLedger for RedisStore {
    async fn get(
        &self,
        key: &UsageKey,
        period: &BillingPeriod,
    ) -> Result<UsageSnapshot, LedgerError> {
        Ok(self.read_usage(key, period).await?)
    }

    async fn accrue(
        &self,
        key: &UsageKey,
        period: &BillingPeriod,
        usd_micros: u64,
    ) -> Result<(), LedgerError> {
        Ok(self.increment_usage(key, period, usd_micros).await?)
    }

    async fn set_limit(
        &self,
        key: &UsageKey,
        limit_usd_micros: Option<u64>,
    ) -> Result<(), LedgerError> {
        Ok(self.write_limit(key, limit_usd_micros).await?)
    }

    async fn list(&self) -> Result<Vec<UsageRecord>, LedgerError> {
        Ok(self.list_usage_records().await?)
    }
}

#[async_trait]
impl ResponseCache for RedisStore {
    async fn lookup(&self, key: &str) -> Result<Option<ProxyResponse>, CacheError> {
        Ok(self.get_cached_response(key).await?)
    }

    async fn store(
        &self,
        key: &str,
        response: &ProxyResponse,
        ttl_seconds: u64,
    ) -> Result<(), CacheError> {
        Ok(self.set_cached_response(key, response, ttl_seconds).await?)
    }

    async fn clear(&self) -> Result<u64, CacheError> {
        Ok(self.clear_cached_responses().await?)
    }
}
