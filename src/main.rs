//! Switchback server binary.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use switchback::executors::default_registry;
use switchback::{ApiServer, Config, Engine};

#[derive(Parser, Debug)]
#[command(name = "switchback", about = "Branch-aware multi-tenant workflow scheduler")]
struct Args {
    /// Bind address, overriding SWITCHBACK_HTTP_ADDR
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,

    /// Global worker cap, overriding SWITCHBACK_MAX_WORKERS
    #[arg(long)]
    max_workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(bind) = args.bind {
        config.http_addr = bind;
    }
    if let Some(max_workers) = args.max_workers {
        config.max_workers = max_workers.max(1);
    }

    let (engine, engine_task) = Engine::start(&config, default_registry());
    let server = ApiServer::start(config.http_addr, engine.clone()).await?;

    info!(addr = %server.addr(), "switchback ready");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    server.shutdown();
    engine.shutdown();
    engine_task.await.ok();

    Ok(())
}
