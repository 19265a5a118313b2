//! Runner binary: wires configuration, the Postgres backend, and the engine,
//! then drains gracefully on ctrl-c.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use unveil::{Config, LoggingNotifier, PostgresBackend, ReleaseEngine, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "unveil", about = "Scheduled content-release engine")]
struct Args {
    /// Run one poll pass, drain, and exit instead of staying resident.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    let backend = PostgresBackend::connect(&config.database_url).await?;
    let engine = ReleaseEngine::new(
        backend.clone(),
        Arc::new(LoggingNotifier),
        Arc::new(backend.clone()),
        Arc::new(SystemClock),
        config.engine_config(),
    );

    engine.start().await;
    if args.once {
        engine.stop().await;
        return Ok(());
    }

    info!("engine running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received; draining");
    engine.stop().await;
    Ok(())
}
