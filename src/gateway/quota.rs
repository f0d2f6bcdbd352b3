use serde::Serialize;

use super::ProxyError;
use super::ledger::{BillingPeriod, UsageKey, UsageLedger, UsageSnapshot};

/// Who is asking, for which model, in which deployment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaSubject<'a> {
    pub user: &'a str,
    pub project: &'a str,
    pub model: &'a str,
    pub environment: &'a str,
}

impl QuotaSubject<'_> {
    pub fn user_key(&self) -> UsageKey {
        UsageKey::user_model(self.user, self.project, self.model, self.environment)
    }

    pub fn project_model_key(&self) -> UsageKey {
        UsageKey::project_model(self.project, self.model, self.environment)
    }

    pub fn project_key(&self) -> UsageKey {
        UsageKey::project(self.project, self.environment)
    }

    /// Rows a successful call accrues into, most specific first.
    pub fn accrual_keys(&self) -> [UsageKey; 3] {
        [self.user_key(), self.project_model_key(), self.project_key()]
    }
}

/// Snapshot of the three rows that admitted a request.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct QuotaDecision {
    pub project: UsageSnapshot,
    pub project_model: UsageSnapshot,
    pub user: UsageSnapshot,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct QuotaResolver;

impl QuotaResolver {
    /// Project-wide, then project+model, then per-user.
    ///
    /// A project with no limit on either project-level row is rejected even
    /// if the user row carries one.
    pub async fn check(
        &self,
        ledger: &dyn UsageLedger,
        subject: &QuotaSubject<'_>,
        period: &BillingPeriod,
    ) -> Result<QuotaDecision, ProxyError> {
        let project = ledger.get(&subject.project_key(), period).await?;
        if project.exhausted() {
            return Err(ProxyError::ProjectQuotaExceeded {
                project: subject.project.to_string(),
            });
        }

        let project_model = ledger.get(&subject.project_model_key(), period).await?;
        if project_model.exhausted() {
            return Err(ProxyError::ModelQuotaExceeded {
                project: subject.project.to_string(),
                model: subject.model.to_string(),
            });
        }

        if project.limit_usd_micros.is_none() && project_model.limit_usd_micros.is_none() {
            return Err(ProxyError::ProjectUnconfigured {
                project: subject.project.to_string(),
            });
        }

        let user = ledger.get(&subject.user_key(), period).await?;
        if user.exhausted() {
            return Err(ProxyError::UserQuotaExceeded {
                user: subject.user.to_string(),
                project: subject.project.to_string(),
                model: subject.model.to_string(),
            });
        }

        Ok(QuotaDecision {
            project,
            project_model,
            user,
        })
    }
}
