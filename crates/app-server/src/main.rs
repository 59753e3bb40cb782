mod account_service;
mod bet_placement;
mod draw_announcer;
mod draw_scheduler;
mod game_service;

use std::sync::Arc;
use std::time::Duration;

use account_service::{AccountService, RewardPolicy};
use anyhow::{Context, Result};
use bet_placement::BetPlacementService;
use draw_announcer::TracingDrawAnnouncer;
use draw_scheduler::{DrawScheduler, DrawSchedulerConfig};
use game_service::GameService;
use ledger_store::{LedgerStores, PostgresLedgerRepository};
use observability::init_tracing;
use ops_http::{OpsState, build_router_with_state};
use platform_core::AppConfig;
use settlement::{LockRegistry, RandDiceChannel, SettlementEngine};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

async fn connect_stores(config: &AppConfig) -> Result<LedgerStores> {
    let Some(url) = config.database.url.as_deref() else {
        warn!("no database url configured, using in-memory stores");
        return Ok(LedgerStores::in_memory());
    };
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .context("failed to connect to postgres")?;
    PostgresLedgerRepository::new(pool.clone())
        .ensure_schema()
        .await
        .context("failed to apply schema")?;
    info!(max_connections = config.database.max_connections, "postgres stores ready");
    Ok(LedgerStores::postgres(pool))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("failed to load config")?;
    init_tracing(&config.app.service_name, &config.observability.log_filter);
    info!(
        env = config.app.env.as_str(),
        bind = %config.app.http_bind_addr,
        "starting dice lottery"
    );

    let stores = connect_stores(&config).await?;
    let locks = Arc::new(LockRegistry::new());
    let engine = SettlementEngine::new(
        &stores,
        Arc::new(RandDiceChannel),
        Arc::new(TracingDrawAnnouncer),
        locks.clone(),
    );
    let scheduler = DrawScheduler::new(
        &stores,
        engine,
        DrawSchedulerConfig::from(&config.scheduler),
    );
    scheduler
        .resume_enabled_sessions()
        .await
        .context("failed to resume draw schedules")?;

    let game = GameService::new(
        &stores,
        scheduler.clone(),
        BetPlacementService::new(&stores, locks.clone()),
        AccountService::new(&stores, locks, RewardPolicy::from(&config.rewards)),
    );
    let router = build_router_with_state(OpsState {
        game: Arc::new(game),
    });

    let listener = tokio::net::TcpListener::bind(&config.app.http_bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.app.http_bind_addr))?;
    info!(addr = %config.app.http_bind_addr, "ops http listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await
        .context("ops http server error")?;

    info!(
        running = scheduler.running_chats().len(),
        "stopping draw schedules"
    );
    scheduler.shutdown().await;
    info!("dice lottery stopped");
    Ok(())
}
