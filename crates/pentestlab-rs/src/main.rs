mod adapters;
mod ai;
mod api;
mod config;
mod db;
mod error;
mod hub;
mod models;
mod parser;
mod registry;
mod runner;
mod scheduler;
mod security;
mod tasks;
#[cfg(test)]
mod test_support;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use sqlx::SqlitePool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    ai::InsightService, config::AppConfig, hub::NotificationHub, registry::ScanRegistry,
    runner::ToolRunner, scheduler::ScanScheduler, tasks::ToolTaskStore,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: ScanRegistry,
    pub scheduler: Arc<ScanScheduler>,
    pub hub: Arc<NotificationHub>,
    pub runner: ToolRunner,
    pub tasks: ToolTaskStore,
    pub insights: Arc<InsightService>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// Wires the services together and starts the scheduler's dispatch loop.
    pub fn build(config: AppConfig, pool: SqlitePool) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let registry = ScanRegistry::new(pool);
        let hub = Arc::new(NotificationHub::new(config.subscriber_buffer));
        let runner = ToolRunner::new(config.tools.clone(), config.tool_timeout());
        let scheduler = ScanScheduler::start(
            registry.clone(),
            hub.clone(),
            runner.clone(),
            config.scope_allowlist.clone(),
            config.max_concurrent_scans,
        );
        let insights = Arc::new(InsightService::from_config(
            &config.ai,
            registry.clone(),
            hub.clone(),
        )?);

        Ok(Self {
            registry,
            scheduler,
            hub,
            runner,
            tasks: ToolTaskStore::default(),
            insights,
            config,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = AppConfig::load()?;

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;
    if config.scope_allowlist.is_empty() {
        warn!("scope allowlist is empty; every valid target is accepted");
    }

    let state = AppState::build(config, pool)?;
    let requeued = state.scheduler.recover().await?;
    info!(requeued, "startup recovery finished");

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!(%addr, "pentestlab-rs listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}
