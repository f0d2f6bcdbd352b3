//! Usage ledger: composite-keyed cost counters with an optional limit per key.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "gateway-store-redis")]
use super::RedisStoreError;
#[cfg(feature = "gateway-store-sqlite")]
use super::SqliteStoreError;

pub const WILDCARD: &str = "*";

/// One ledger row: `(user, project, model, environment)`, where `user` and
/// `model` may be [`WILDCARD`] for the aggregate rows.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsageKey {
    pub user: String,
    pub project: String,
    pub model: String,
    pub environment: String,
}

impl UsageKey {
    pub fn new(
        user: impl Into<String>,
        project: impl Into<String>,
        model: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            project: project.into(),
            model: model.into(),
            environment: environment.into(),
        }
    }

    pub fn user_model(user: &str, project: &str, model: &str, environment: &str) -> Self {
        Self::new(user, project, model, environment)
    }

    pub fn project_model(project: &str, model: &str, environment: &str) -> Self {
        Self::new(WILDCARD, project, model, environment)
    }

    pub fn project(project: &str, environment: &str) -> Self {
        Self::new(WILDCARD, project, WILDCARD, environment)
    }

    /// `user#project#model#environment`, with `%` and `#` escaped inside
    /// each component so a separator in a name cannot alias another row.
    pub fn composite(&self) -> String {
        let mut out = String::with_capacity(
            self.user.len() + self.project.len() + self.model.len() + self.environment.len() + 3,
        );
        for (idx, part) in [&self.user, &self.project, &self.model, &self.environment]
            .into_iter()
            .enumerate()
        {
            if idx > 0 {
                out.push('#');
            }
            escape_component(part, &mut out);
        }
        out
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.composite())
    }
}

fn escape_component(part: &str, out: &mut String) {
    for ch in part.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '#' => out.push_str("%23"),
            other => out.push(other),
        }
    }
}

/// Calendar-month bucket, labelled `MMYY` in UTC.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BillingPeriod(String);

impl BillingPeriod {
    pub fn from_epoch_seconds(epoch_seconds: u64) -> Self {
        let seconds = i64::try_from(epoch_seconds).unwrap_or(i64::MAX);
        let instant = time::OffsetDateTime::from_unix_timestamp(seconds)
            .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
        Self(format!(
            "{:02}{:02}",
            u8::from(instant.month()),
            instant.year().rem_euclid(100)
        ))
    }

    pub fn label(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current-period usage and the configured limit for one key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub usage_usd_micros: u64,
    pub limit_usd_micros: Option<u64>,
}

impl UsageSnapshot {
    /// Inclusive ceiling: reaching the limit already exhausts it.
    pub fn exhausted(&self) -> bool {
        self.limit_usd_micros
            .is_some_and(|limit| self.usage_usd_micros >= limit)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub composite_key: String,
    pub user: String,
    pub project: String,
    pub model: String,
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_usd_micros: Option<u64>,
    #[serde(default)]
    pub periods: BTreeMap<String, u64>,
}

impl UsageRecord {
    fn empty(key: &UsageKey) -> Self {
        Self {
            composite_key: key.composite(),
            user: key.user.clone(),
            project: key.project.clone(),
            model: key.model.clone(),
            environment: key.environment.clone(),
            limit_usd_micros: None,
            periods: BTreeMap::new(),
        }
    }

    pub fn snapshot(&self, period: &BillingPeriod) -> UsageSnapshot {
        UsageSnapshot {
            usage_usd_micros: self.periods.get(period.label()).copied().unwrap_or(0),
            limit_usd_micros: self.limit_usd_micros,
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[cfg(feature = "gateway-store-redis")]
    #[error(transparent)]
    Redis(#[from] RedisStoreError),
    #[cfg(feature = "gateway-store-sqlite")]
    #[error(transparent)]
    Sqlite(#[from] SqliteStoreError),
    #[error("ledger state poisoned")]
    Poisoned,
}

#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Usage for `period` and the key's limit; an absent row reads as zero
    /// usage with no limit.
    async fn get(
        &self,
        key: &UsageKey,
        period: &BillingPeriod,
    ) -> Result<UsageSnapshot, LedgerError>;

    /// Atomically adds `usd_micros` to the period counter, creating the row
    /// (without a limit) when needed.
    async fn accrue(
        &self,
        key: &UsageKey,
        period: &BillingPeriod,
        usd_micros: u64,
    ) -> Result<(), LedgerError>;

    /// Upserts the limit without touching any period counter. `None` removes it.
    async fn set_limit(
        &self,
        key: &UsageKey,
        limit_usd_micros: Option<u64>,
    ) -> Result<(), LedgerError>;

    async fn list(&self) -> Result<Vec<UsageRecord>, LedgerError>;
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<String, UsageRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageLedger for MemoryLedger {
    async fn get(
        &self,
        key: &UsageKey,
        period: &BillingPeriod,
    ) -> Result<UsageSnapshot, LedgerError> {
        let records = self.records.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(records
            .get(&key.composite())
            .map(|record| record.snapshot(period))
            .unwrap_or_default())
    }

    async fn accrue(
        &self,
        key: &UsageKey,
        period: &BillingPeriod,
        usd_micros: u64,
    ) -> Result<(), LedgerError> {
        let mut records = self.records.lock().map_err(|_| LedgerError::Poisoned)?;
        let record = records
            .entry(key.composite())
            .or_insert_with(|| UsageRecord::empty(key));
        let spent = record
            .periods
            .entry(period.label().to_string())
            .or_insert(0);
        *spent = spent.saturating_add(usd_micros);
        Ok(())
    }

    async fn set_limit(
        &self,
        key: &UsageKey,
        limit_usd_micros: Option<u64>,
    ) -> Result<(), LedgerError> {
        let mut records = self.records.lock().map_err(|_| LedgerError::Poisoned)?;
        records
            .entry(key.composite())
            .or_insert_with(|| UsageRecord::empty(key))
            .limit_usd_micros = limit_usd_micros;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<UsageRecord>, LedgerError> {
        let records = self.records.lock().map_err(|_| LedgerError::Poisoned)?;
        let mut out: Vec<UsageRecord> = records.values().cloned().collect();
        out.sort_by(|a, b| a.composite_key.cmp(&b.composite_key));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    // 2023-10-14T00:00:00Z
    const OCT_2023: u64 = 1_697_241_600;
    // 2023-11-14T00:00:00Z
    const NOV_2023: u64 = 1_699_920_000;

    #[test]
    fn composite_key_uses_hash_separator_and_wildcards() {
        assert_eq!(
            UsageKey::user_model("fulano", "hello", "gpt-4", "dev").composite(),
            "fulano#hello#gpt-4#dev"
        );
        assert_eq!(
            UsageKey::project_model("hello", "gpt-4", "dev").composite(),
            "*#hello#gpt-4#dev"
        );
        assert_eq!(UsageKey::project("hello", "dev").composite(), "*#hello#*#dev");
    }

    #[test]
    fn composite_key_escapes_separator_inside_components() {
        let tricky = UsageKey::new("a#b", "c", "m", "dev");
        let plain = UsageKey::new("a", "b#c", "m", "dev");
        assert_ne!(tricky.composite(), plain.composite());
        assert_eq!(tricky.composite(), "a%23b#c#m#dev");
        assert_eq!(UsageKey::new("50%", "p", "m", "e").composite(), "50%25#p#m#e");
    }

    #[test]
    fn billing_period_is_two_digit_month_and_year() {
        assert_eq!(BillingPeriod::from_epoch_seconds(OCT_2023).label(), "1023");
        assert_eq!(BillingPeriod::from_epoch_seconds(0).label(), "0170");
    }

    #[tokio::test]
    async fn absent_row_reads_as_zero_without_limit() {
        let ledger = MemoryLedger::new();
        let period = BillingPeriod::from_epoch_seconds(OCT_2023);
        let snapshot = ledger
            .get(&UsageKey::project("p", "dev"), &period)
            .await
            .expect("get");
        assert_eq!(snapshot, UsageSnapshot::default());
        assert!(!snapshot.exhausted());
    }

    #[tokio::test]
    async fn accrual_is_bucketed_per_period_and_limit_spans_periods() {
        let ledger = MemoryLedger::new();
        let key = UsageKey::project("p", "dev");
        let october = BillingPeriod::from_epoch_seconds(OCT_2023);
        let november = BillingPeriod::from_epoch_seconds(NOV_2023);

        ledger.accrue(&key, &october, 7).await.expect("accrue");
        ledger.accrue(&key, &october, 5).await.expect("accrue");
        ledger.set_limit(&key, Some(10)).await.expect("limit");

        let oct = ledger.get(&key, &october).await.expect("get");
        assert_eq!(oct.usage_usd_micros, 12);
        assert_eq!(oct.limit_usd_micros, Some(10));
        assert!(oct.exhausted());

        let nov = ledger.get(&key, &november).await.expect("get");
        assert_eq!(nov.usage_usd_micros, 0);
        assert_eq!(nov.limit_usd_micros, Some(10));
        assert!(!nov.exhausted());
    }

    #[tokio::test]
    async fn set_limit_does_not_touch_counters() {
        let ledger = MemoryLedger::new();
        let key = UsageKey::project_model("p", "gpt-4", "dev");
        let period = BillingPeriod::from_epoch_seconds(OCT_2023);

        ledger.accrue(&key, &period, 3).await.expect("accrue");
        ledger.set_limit(&key, Some(100)).await.expect("limit");
        ledger.set_limit(&key, None).await.expect("clear");

        let snapshot = ledger.get(&key, &period).await.expect("get");
        assert_eq!(snapshot.usage_usd_micros, 3);
        assert_eq!(snapshot.limit_usd_micros, None);

        let records = ledger.list().await.expect("list");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].project, "p");
        assert_eq!(records[0].periods.get("1023"), Some(&3));
    }

    #[test]
    fn zero_limit_is_exhausted_immediately() {
        let snapshot = UsageSnapshot {
            usage_usd_micros: 0,
            limit_usd_micros: Some(0),
        };
        assert!(snapshot.exhausted());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_accrual_on_one_row_loses_nothing() {
        let ledger = Arc::new(MemoryLedger::new());
        let key = UsageKey::project("p", "dev");
        let period = BillingPeriod::from_epoch_seconds(OCT_2023);

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let ledger = ledger.clone();
            let key = key.clone();
            let period = period.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    ledger.accrue(&key, &period, 1).await.expect("accrue");
                }
            }));
        }
        for task in tasks {
            task.await.expect("join");
        }

        let snapshot = ledger.get(&key, &period).await.expect("get");
        assert_eq!(snapshot.usage_usd_micros, 32 * 50);
    }
}
