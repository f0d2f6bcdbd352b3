use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use llm_meter::gateway::cache::{MemoryCacheLimits, MemoryResponseCache, ResponseCache};
use llm_meter::gateway::costing::PricingTable;
use llm_meter::gateway::ledger::{MemoryLedger, UsageLedger};
use llm_meter::gateway::upstream::HttpUpstream;
use llm_meter::gateway::{
    LimitRequest, MeterConfig, MeteredProxy, ProxyHttpState, StoreKind, router, telemetry,
};

#[derive(Parser, Debug)]
#[command(name = "llm-meter")]
#[command(version)]
#[command(about = "Quota-enforcing, cost-metering proxy for OpenAI-compatible APIs", long_about = None)]
struct Cli {
    /// TOML config, or JSON when the file ends in `.json`.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP proxy.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,
        #[arg(long)]
        json_logs: bool,
        /// Export spans over OTLP/HTTP (needs the `gateway-otel` feature).
        #[arg(long)]
        otel: bool,
        #[arg(long)]
        otel_endpoint: Option<String>,
    },
    /// Set or clear a usage limit directly in the configured store.
    SetLimit {
        #[arg(long)]
        project: String,
        /// Defaults to every user of the project.
        #[arg(long)]
        user: Option<String>,
        /// Defaults to every model.
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        environment: Option<String>,
        /// Limit in USD per billing month.
        #[arg(long, conflicts_with = "clear", required_unless_present = "clear")]
        limit: Option<f64>,
        #[arg(long)]
        clear: bool,
    },
    /// Drop every cached response.
    FlushCache,
    /// Print every ledger row as JSON.
    Usage,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match cli.config.as_deref() {
        Some(path) => MeterConfig::from_path(path)?,
        None => MeterConfig::default(),
    };

    match cli.command {
        Command::Serve {
            listen,
            json_logs,
            otel,
            otel_endpoint,
        } => {
            let _otel_guard = attach_tracing(json_logs, otel, otel_endpoint.as_deref())?;
            serve(config, &listen).await
        }
        Command::SetLimit {
            project,
            user,
            model,
            environment,
            limit,
            clear: _,
        } => {
            telemetry::init_tracing(false)?;
            let proxy = build_proxy(&config).await?;
            let (key, limit_usd_micros) = proxy
                .admin_set_limit(
                    &config.settings(),
                    LimitRequest {
                        user,
                        project,
                        model,
                        environment,
                        limit,
                    },
                )
                .await?;
            println!(
                "{}",
                serde_json::json!({ "key": key.composite(), "limit_usd_micros": limit_usd_micros })
            );
            Ok(())
        }
        Command::FlushCache => {
            telemetry::init_tracing(false)?;
            let proxy = build_proxy(&config).await?;
            let removed = proxy.flush_cache().await?;
            println!("{}", serde_json::json!({ "removed": removed }));
            Ok(())
        }
        Command::Usage => {
            let proxy = build_proxy(&config).await?;
            let records = proxy.list_usage().await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
    }
}

async fn serve(config: MeterConfig, listen: &str) -> Result<(), Box<dyn std::error::Error>> {
    let proxy = Arc::new(build_proxy(&config).await?);
    let state = ProxyHttpState::new(proxy, config.settings())
        .with_admin_token(config.admin_token.clone())
        .with_max_body_bytes(config.upstream.max_body_bytes);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(
        listen,
        environment = %config.environment,
        store = ?config.store.kind,
        upstream = %config.upstream.base_url,
        "llm-meter listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn build_proxy(config: &MeterConfig) -> Result<MeteredProxy, Box<dyn std::error::Error>> {
    let pricing = match config.pricing_litellm_path.as_deref() {
        Some(path) => PricingTable::from_path(path)?,
        None => PricingTable::default(),
    };
    let upstream = HttpUpstream::new(&config.upstream.clone().with_env_organization())?;
    let (ledger, cache) = build_store(config).await?;
    Ok(MeteredProxy::new(ledger, cache, Arc::new(upstream), pricing))
}

type Collaborators = (Arc<dyn UsageLedger>, Arc<dyn ResponseCache>);

fn memory_cache(config: &MeterConfig) -> Arc<dyn ResponseCache> {
    Arc::new(MemoryResponseCache::new(MemoryCacheLimits {
        max_entries: config.cache.max_entries,
        ..MemoryCacheLimits::default()
    }))
}

async fn build_store(config: &MeterConfig) -> Result<Collaborators, Box<dyn std::error::Error>> {
    match config.store.kind {
        StoreKind::Memory => {
            tracing::warn!("memory store: usage and limits are lost on restart");
            let ledger: Arc<dyn UsageLedger> = Arc::new(MemoryLedger::new());
            Ok((ledger, memory_cache(config)))
        }
        StoreKind::Redis => build_redis_store(config).await,
        StoreKind::Sqlite => build_sqlite_store(config).await,
    }
}

#[cfg(feature = "gateway-store-redis")]
async fn build_redis_store(config: &MeterConfig) -> Result<Collaborators, Box<dyn std::error::Error>> {
    let url = config
        .store
        .redis_url
        .as_deref()
        .ok_or("store.redis_url is required for the redis store")?;
    let mut store = llm_meter::gateway::RedisStore::new(url)?;
    if let Some(prefix) = config.store.redis_prefix.as_deref() {
        store = store.with_prefix(prefix);
    }
    store.ping().await?;
    let store = Arc::new(store);
    let ledger: Arc<dyn UsageLedger> = store.clone();
    let cache: Arc<dyn ResponseCache> = store;
    Ok((ledger, cache))
}

#[cfg(not(feature = "gateway-store-redis"))]
async fn build_redis_store(_config: &MeterConfig) -> Result<Collaborators, Box<dyn std::error::Error>> {
    Err("redis store requires `--features gateway-store-redis`".into())
}

#[cfg(feature = "gateway-store-sqlite")]
async fn build_sqlite_store(config: &MeterConfig) -> Result<Collaborators, Box<dyn std::error::Error>> {
    let path = config
        .store
        .sqlite_path
        .as_deref()
        .ok_or("store.sqlite_path is required for the sqlite store")?;
    let store = llm_meter::gateway::SqliteStore::new(path);
    store.init().await?;
    let ledger: Arc<dyn UsageLedger> = Arc::new(store);
    Ok((ledger, memory_cache(config)))
}

#[cfg(not(feature = "gateway-store-sqlite"))]
async fn build_sqlite_store(_config: &MeterConfig) -> Result<Collaborators, Box<dyn std::error::Error>> {
    Err("sqlite store requires `--features gateway-store-sqlite`".into())
}

#[cfg(feature = "gateway-otel")]
fn attach_tracing(
    json_logs: bool,
    otel: bool,
    endpoint: Option<&str>,
) -> Result<Option<telemetry::OtelGuard>, Box<dyn std::error::Error>> {
    if !otel {
        telemetry::init_tracing(json_logs)?;
        return Ok(None);
    }
    Ok(Some(telemetry::init_tracing_with_otel(
        "llm-meter",
        endpoint,
        json_logs,
    )?))
}

#[cfg(not(feature = "gateway-otel"))]
fn attach_tracing(
    json_logs: bool,
    otel: bool,
    _endpoint: Option<&str>,
) -> Result<Option<()>, Box<dyn std::error::Error>> {
    if otel {
        return Err("otel requires `--features gateway-otel`".into());
    }
    telemetry::init_tracing(json_logs)?;
    Ok(None)
}
