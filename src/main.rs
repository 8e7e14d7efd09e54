use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use topup_engine::api::{self, AppState};
use topup_engine::cache::{CounterStore, InMemoryCounterStore, RateLimiter};
use topup_engine::config::Config;
use topup_engine::database::{self, topup_repository::TopUpRepository, wallet_repository::WalletRepository};
use topup_engine::logging;
use topup_engine::payments::providers::{BankTransferProvider, MpesaProvider};
use topup_engine::services::{FeePolicy, LoggingNotifier, OrchestratorConfig, TopUpOrchestrator};
use topup_engine::workers::{ReconcilerConfig, TopUpReconciler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    logging::init_tracing();

    let config = Config::from_env()?;

    tracing::info!("Starting top-up engine");
    tracing::info!("Environment: {}", config.server.environment);
    tracing::info!("Currency: {}", config.topup.currency);

    let pool = database::init_pool(
        &config.database.url,
        Some(database::PoolConfig {
            max_connections: config.database.max_connections,
            ..Default::default()
        }),
    )
    .await
    .context("failed to connect to the database")?;

    database::run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;

    let topups = Arc::new(TopUpRepository::new(pool.clone()));

    #[cfg(feature = "cache")]
    let (wallets, counters) = match &config.redis.url {
        Some(url) => {
            let cache_pool = topup_engine::cache::init_cache_pool(topup_engine::cache::CacheConfig {
                redis_url: url.clone(),
                ..Default::default()
            })
            .await
            .context("failed to create Redis pool")?;
            let cache = topup_engine::cache::RedisCache::new(cache_pool);
            let counters: Arc<dyn CounterStore> = Arc::new(cache.clone());
            (WalletRepository::with_cache(pool.clone(), cache), counters)
        }
        None => {
            tracing::warn!("REDIS_URL not set, rate limiting with in-process counters");
            let counters: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
            (WalletRepository::new(pool.clone()), counters)
        }
    };

    #[cfg(not(feature = "cache"))]
    let (wallets, counters) = {
        let counters: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        (WalletRepository::new(pool.clone()), counters)
    };

    let policy = FeePolicy::new(config.topup.daily_limit, config.topup.timezone_offset_minutes)?;

    let mut orchestrator = TopUpOrchestrator::new(
        topups,
        Arc::new(wallets),
        policy,
        OrchestratorConfig::from(&config.topup),
    )
    .with_notifier(Arc::new(LoggingNotifier));

    match MpesaProvider::from_env() {
        Ok(provider) => orchestrator = orchestrator.with_provider(Arc::new(provider)),
        Err(e) => tracing::warn!(error = %e, "Mobile money rail disabled"),
    }
    match BankTransferProvider::from_env() {
        Ok(provider) => orchestrator = orchestrator.with_provider(Arc::new(provider)),
        Err(e) => tracing::warn!(error = %e, "Bank transfer rail disabled"),
    }

    let orchestrator = Arc::new(orchestrator);
    let rate_limiter = Arc::new(RateLimiter::new(
        counters,
        "topups",
        config.topup.rate_limit_per_minute,
        Duration::from_secs(60),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = TopUpReconciler::new(orchestrator.clone(), ReconcilerConfig::from_env());
    let reconciler_handle = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

    let app = api::router(AppState {
        orchestrator,
        rate_limiter,
        environment: config.server.environment.clone(),
        pool: Some(pool),
    });

    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .context("HOST must be a valid IP address")?;
    let addr = SocketAddr::from((host, config.server.port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = reconciler_handle.await {
        tracing::error!(error = %e, "Reconciler task ended abnormally");
    }

    Ok(())
}
