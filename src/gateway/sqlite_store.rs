use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;
use thiserror::Error;

use super::ledger::{BillingPeriod, LedgerError, UsageKey, UsageLedger, UsageRecord, UsageSnapshot};

/// File-backed ledger for single-node deployments.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    pub async fn read_usage(
        &self,
        key: &UsageKey,
        period: &BillingPeriod,
    ) -> Result<UsageSnapshot, SqliteStoreError> {
        let path = self.path.clone();
        let composite = key.composite();
        let period = period.label().to_string();

        tokio::task::spawn_blocking(move || -> Result<UsageSnapshot, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let limit: Option<Option<i64>> = conn
                .query_row(
                    "SELECT limit_usd_micros FROM usage_records WHERE composite_key=?1",
                    rusqlite::params![composite],
                    |row| row.get(0),
                )
                .optional()?;
            let spent: Option<i64> = conn
                .query_row(
                    "SELECT spent_usd_micros FROM usage_periods
                     WHERE composite_key=?1 AND period=?2",
                    rusqlite::params![composite, period],
                    |row| row.get(0),
                )
                .optional()?;

            Ok(UsageSnapshot {
                usage_usd_micros: spent.map(i64_to_u64).unwrap_or(0),
                limit_usd_micros: limit.flatten().map(i64_to_u64),
            })
        })
        .await?
    }

    pub async fn record_spent_usd_micros(
        &self,
        key: &UsageKey,
        period: &BillingPeriod,
        usd_micros: u64,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let key = key.clone();
        let period = period.label().to_string();
        let usd_micros = usd_micros_to_i64(usd_micros);

        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let composite = upsert_record(&tx, &key)?;
            tx.execute(
                "INSERT INTO usage_periods (composite_key, period, spent_usd_micros)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(composite_key, period) DO UPDATE SET
                    spent_usd_micros = spent_usd_micros + excluded.spent_usd_micros",
                rusqlite::params![composite, period, usd_micros],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    pub async fn write_limit(
        &self,
        key: &UsageKey,
        limit_usd_micros: Option<u64>,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let key = key.clone();
        let limit = limit_usd_micros.map(usd_micros_to_i64);

        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let composite = upsert_record(&tx, &key)?;
            tx.execute(
                "UPDATE usage_records SET limit_usd_micros=?2 WHERE composite_key=?1",
                rusqlite::params![composite, limit],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    pub async fn list_usage_records(&self) -> Result<Vec<UsageRecord>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<UsageRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT composite_key, user, project, model, environment, limit_usd_micros
                 FROM usage_records ORDER BY composite_key",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(UsageRecord {
                    composite_key: row.get(0)?,
                    user: row.get(1)?,
                    project: row.get(2)?,
                    model: row.get(3)?,
                    environment: row.get(4)?,
                    limit_usd_micros: row.get::<_, Option<i64>>(5)?.map(i64_to_u64),
                    periods: BTreeMap::new(),
                })
            })?;
            let mut out = rows.collect::<Result<Vec<_>, _>>()?;

            let mut periods = conn.prepare(
                "SELECT period, spent_usd_micros FROM usage_periods WHERE composite_key=?1",
            )?;
            for record in &mut out {
                let rows = periods.query_map(rusqlite::params![record.composite_key], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (period, spent) = row?;
                    record.periods.insert(period, i64_to_u64(spent));
                }
            }
            Ok(out)
        })
        .await?
    }
}

fn upsert_record(tx: &rusqlite::Transaction<'_>, key: &UsageKey) -> Result<String, rusqlite::Error> {
    let composite = key.composite();
    tx.execute(
        "INSERT INTO usage_records (composite_key, user, project, model, environment)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(composite_key) DO UPDATE SET
            user=excluded.user,
            project=excluded.project,
            model=excluded.model,
            environment=excluded.environment",
        rusqlite::params![composite, key.user, key.project, key.model, key.environment],
    )?;
    Ok(composite)
}

#[async_trait]
impl UsageLedger for SqliteStore {
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
        Ok(self.record_spent_usd_micros(key, period, usd_micros).await?)
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

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS usage_records (
            composite_key TEXT PRIMARY KEY NOT NULL,
            user TEXT NOT NULL,
            project TEXT NOT NULL,
            model TEXT NOT NULL,
            environment TEXT NOT NULL,
            limit_usd_micros INTEGER
        );

        CREATE TABLE IF NOT EXISTS usage_periods (
            composite_key TEXT NOT NULL,
            period TEXT NOT NULL,
            spent_usd_micros INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (composite_key, period)
        );
        CREATE INDEX IF NOT EXISTS idx_usage_records_project
            ON usage_records(project);",
    )
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn usd_micros_to_i64(usd_micros: u64) -> i64 {
    i64::try_from(usd_micros).unwrap_or(i64::MAX)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
