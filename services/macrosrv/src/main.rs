//! Macrosrv entry point

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use macro_engine::{
    ActionExecutor, AutomationEngine, DefinitionSource, EventRouter, ExecutionGuard,
    MacroDefinition, MacroScheduler, MemoryDefinitions, OwnerPermissions, RateLimit, RuleMatcher,
    SqliteExecutionStore, SqliteScheduleStore,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use macrosrv::config::Config;
use macrosrv::effects::{HttpEgress, HttpWorkItemEffects};
use macrosrv::routes::{create_routes, AppState};

#[derive(Parser)]
#[command(name = "macrosrv", about = "Work-item macro automation service")]
struct Args {
    /// Path to the YAML config file
    #[arg(short, long, env = "MACROSRV_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting macrosrv");

    let pool = macro_engine::connect(&config.database.url)
        .await
        .with_context(|| format!("failed to open database {}", config.database.url))?;
    let store = Arc::new(SqliteExecutionStore::new(pool.clone()));
    let schedule_store = Arc::new(SqliteScheduleStore::new(pool));

    let defs = Arc::new(MemoryDefinitions::new());
    if let Some(path) = &config.definitions_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read definitions file {path}"))?;
        let loaded: Vec<MacroDefinition> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid definitions file {path}"))?;
        info!(count = loaded.len(), "loaded macro definitions");
        for def in loaded {
            defs.insert(def);
        }
    }

    let work_items = Arc::new(HttpWorkItemEffects::new(&config.work_items)?);
    let egress = Arc::new(HttpEgress::new(&config.notifications)?);
    let guard = ExecutionGuard::new(
        Arc::new(OwnerPermissions::new(defs.clone())),
        RateLimit {
            capacity: config.engine.rate_capacity,
            refill_per_sec: config.engine.rate_refill_per_sec,
        },
    );
    let engine = Arc::new(AutomationEngine::new(
        ActionExecutor::standard(work_items, egress),
        store.clone(),
        defs.clone(),
        guard,
    ));

    let router = Arc::new(EventRouter::new(RuleMatcher::new(defs.clone()), engine.clone()));
    let router_handle = router.start();

    let scheduler = Arc::new(
        MacroScheduler::new(schedule_store, router.publisher())
            .with_tick_interval(Duration::from_millis(config.engine.scheduler_tick_ms)),
    );
    for def in defs.list_enabled().await? {
        if let Some(next) = scheduler.ensure(&def).await? {
            info!(macro_id = %def.id, next_run_at = %next, "schedule registered");
        }
    }
    let scheduler_handle = scheduler.start();

    let state = Arc::new(AppState {
        publisher: router.publisher(),
        engine,
        store,
        token: config.api.token.clone(),
    });
    let app = create_routes(state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("macrosrv listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown();
    router.shutdown();
    scheduler_handle.await?;
    if let Some(handle) = router_handle {
        handle.await?;
    }
    info!("macrosrv stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
