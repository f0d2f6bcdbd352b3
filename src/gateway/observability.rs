use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub quota_denied: u64,
    pub malformed: u64,
    pub upstream_calls: u64,
    pub upstream_failures: u64,
    pub ledger_failures: u64,
    pub accrued_usd_micros: u64,
}

#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    quota_denied: AtomicU64,
    malformed: AtomicU64,
    upstream_calls: AtomicU64,
    upstream_failures: AtomicU64,
    ledger_failures: AtomicU64,
    accrued_usd_micros: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    // fetch_update keeps the counter saturating instead of wrapping.
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
        Some(value.saturating_add(by))
    });
}

impl Observability {
    pub fn record_request(&self) {
        bump(&self.requests, 1);
    }

    pub fn record_cache_hit(&self) {
        bump(&self.cache_hits, 1);
    }

    pub fn record_quota_denied(&self) {
        bump(&self.quota_denied, 1);
    }

    pub fn record_malformed(&self) {
        bump(&self.malformed, 1);
    }

    pub fn record_upstream_call(&self) {
        bump(&self.upstream_calls, 1);
    }

    pub fn record_upstream_failure(&self) {
        bump(&self.upstream_failures, 1);
    }

    pub fn record_ledger_failure(&self) {
        bump(&self.ledger_failures, 1);
    }

    pub fn record_accrued(&self, usd_micros: u64) {
        bump(&self.accrued_usd_micros, usd_micros);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            quota_denied: self.quota_denied.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            ledger_failures: self.ledger_failures.load(Ordering::Relaxed),
            accrued_usd_micros: self.accrued_usd_micros.load(Ordering::Relaxed),
        }
    }
}
