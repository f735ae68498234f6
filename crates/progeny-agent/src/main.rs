use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use progeny_agent::config::ProgenyConfig;
use progeny_agent::port_alloc::PortManager;
use progeny_agent::process_manager::ProcessRegistry;
use progeny_agent::process_manager_support::{ShutdownSignals, format_error_chain};
use progeny_agent::recipes::init_capabilities;
use progeny_agent::spinner::LaunchSettings;
use progeny_agent::templates::CommandBuilder;
use progeny_agent::Progeny;

fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("PROGENY_CONFIG").map(PathBuf::from))
}

async fn start() -> anyhow::Result<Progeny> {
    let path = config_path();
    let cfg = ProgenyConfig::load(path.as_deref())
        .with_context(|| format!("load config {:?}", path.as_deref()))?;

    let exclude = cfg.recipe_exclude_pattern.as_deref();
    let capabilities = init_capabilities(cfg.recipe_dir.as_deref(), exclude, cfg.base_recipes.iter().cloned())
        .context("discover recipes")?
        .clone();
    let builder = CommandBuilder::from_dir(cfg.prebaked_dir.as_deref()).context("load prebaked projects")?;

    let db = progeny_db::connect(&cfg.database_url)
        .await
        .with_context(|| format!("connect {}", cfg.database_url))?;
    let ports = PortManager::new(cfg.port_range()?);
    tracing::info!(range = %ports.range(), database = %cfg.database_url, "registry opening");
    let registry = ProcessRegistry::open(db, ports, cfg.registry_options()).await?;

    if let Some((interval, timeout)) = cfg.scheduled_cleaning() {
        registry.start_scheduled_cleaning(interval, timeout).await;
    }

    let progeny = Progeny::new(builder, registry, capabilities, LaunchSettings::from_config(&cfg));
    for instance in &cfg.instances {
        match progeny.spin_instance(instance).await {
            Ok((port, session)) => {
                println!("{}: port {port}, open /start_session/{session}", instance.identifier);
            }
            Err(err) => {
                tracing::error!(identifier = %instance.identifier, %err, "failed to start instance");
            }
        }
    }
    Ok(progeny)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut signals = match ShutdownSignals::install() {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(%err, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let progeny = match start().await {
        Ok(p) => p,
        Err(err) => {
            tracing::error!(error = %format_error_chain(&err), "progeny-agent failed to start");
            return ExitCode::FAILURE;
        }
    };

    let sig = signals.recv().await;
    tracing::info!(signal = sig, "shutdown requested");

    match progeny.shutdown().await {
        Ok(report) => {
            tracing::info!(swept = report.swept, "workers cleaned up");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(%err, "shutdown failed");
            ExitCode::FAILURE
        }
    }
}
