use anyhow::{Context, Result};
use arbflow::config::EngineConfig;
use arbflow::engine::Engine;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "arbflow", about = "Cross-venue DEX arbitrage engine")]
struct Args {
    /// TOML configuration file; environment variables override nothing when
    /// a file is given.
    #[arg(long, env = "ARBFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Prometheus exporter listen address.
    #[arg(long, env = "ARBFLOW_METRICS_ADDR", default_value = "127.0.0.1:9615")]
    metrics_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("arbflow=info".parse()?))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => EngineConfig::from_env().context("failed to load config from environment")?,
    };

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(args.metrics_addr)
        .install()
        .context("failed to install prometheus exporter")?;
    arbflow::metrics::describe();
    info!("metrics exporter listening on {}", args.metrics_addr);

    let engine = Engine::new(config).context("failed to construct engine")?;
    engine.initialize().await.context("engine initialization failed")?;
    engine.start().await.context("engine start failed")?;

    info!("arbflow running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal handler failed")?;
    info!("shutdown signal received");

    if let Err(err) = engine.stop().await {
        error!("graceful stop failed: {err}");
    }
    Ok(())
}
