use thiserror::Error;

use crate::gateway::config::ConfigError;
use crate::gateway::costing::PricingTableError;
use crate::gateway::ledger::LedgerError;
use crate::gateway::ProxyError;

#[derive(Debug, Error)]
pub enum MeterError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("pricing error: {0}")]
    Pricing(#[from] PricingTableError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MeterError>;
