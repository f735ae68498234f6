use std::sync::Arc;

use anyhow::Context;
use progeny_gateway::config::{GatewayConfig, LookupMode};
use progeny_gateway::shutdown::ShutdownSignal;
use progeny_gateway::{AppState, Backends};
use sea_orm_migration::MigratorTrait;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let shutdown = ShutdownSignal::install().context("install signal handlers")?;
    let cfg = GatewayConfig::from_env()?;
    let db = progeny_db::connect(&cfg.database_url)
        .await
        .with_context(|| format!("connect {}", cfg.database_url))?;

    // The agent normally creates the table; make sure lookups never hit a
    // missing one when the gateway starts first.
    progeny_migration::Migrator::up(&db, None).await?;

    let backends = match cfg.lookup {
        LookupMode::Registry => Backends::Registry(Arc::new(db)),
        LookupMode::Snapshot => Backends::snapshot(&db).await?,
    };
    let state = AppState::new(backends, &cfg.upstream_host, cfg.upstream_timeout);
    let app = progeny_gateway::router(state);

    tracing::info!(addr = %cfg.addr, lookup = cfg.lookup.as_str(), "progeny-gateway HTTP listening");
    let listener = tokio::net::TcpListener::bind(cfg.addr)
        .await
        .with_context(|| format!("bind {}", cfg.addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let sig = shutdown.recv().await;
            tracing::info!(signal = sig, "shutdown requested");
        })
        .await?;

    Ok(())
}
