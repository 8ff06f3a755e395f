use std::sync::Arc;

use tokio::{net::TcpListener, sync::watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use updown_api::{
    audit::TracingAudit,
    cache::RedisCache,
    chain::RpcTransferClient,
    config::{Config, LedgerBackend},
    handlers::{self, AppState},
    join::JoinHandler,
    keeper::Keeper,
    ledger::{memory::MemoryLedger, postgres::PostgresLedger, Ledger},
    metrics::Metrics,
    oracle::{http::HttpOracle, OracleSource},
    settlement::SettlementEngine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());
    if let Err(err) = config.validate() {
        anyhow::bail!("invalid configuration: {err}");
    }

    let metrics = Metrics::new()?;
    let cache = RedisCache::new(&config.redis_url).await?;
    let ledger: Arc<dyn Ledger> = match config.ledger_backend {
        LedgerBackend::Postgres => Arc::new(PostgresLedger::connect(&config.database_url).await?),
        LedgerBackend::Memory => {
            tracing::warn!("using non-durable in-memory ledger");
            Arc::new(MemoryLedger::new())
        }
    };

    let oracle = Arc::new(OracleSource::new(Arc::new(HttpOracle::new(
        &config.oracle_url,
        config.oracle_max_age_sec,
    ))));
    let chain = Arc::new(RpcTransferClient::new(&config.chain_rpc_url));
    let audit = Arc::new(TracingAudit);

    let engine = Arc::new(SettlementEngine::new(
        ledger.clone(),
        oracle.clone(),
        chain.clone(),
        config.clone(),
        metrics.clone(),
        audit.clone(),
    ));
    let join = JoinHandler::new(ledger.clone(), chain, config.clone(), metrics.clone());

    let keeper = Arc::new(Keeper::new(
        ledger.clone(),
        oracle.clone(),
        engine.clone(),
        config.clone(),
        metrics.clone(),
        audit,
    ));
    // Treasury hard lock: refuse to start when operations expects a
    // different payout treasury.
    keeper.verify_treasury().map_err(|err| anyhow::anyhow!("{err}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let keeper_task = tokio::spawn(keeper.run(shutdown_rx));

    let state = Arc::new(AppState {
        config: config.clone(),
        ledger,
        oracle,
        engine,
        join,
        cache,
        metrics,
    });
    let app = handlers::router(state)
        .into_make_service_with_connect_info::<std::net::SocketAddr>();

    let listener = TcpListener::bind(config.bind_addr).await?;
    tracing::info!("API listening on {}", config.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = keeper_task.await;
    Ok(())
}
