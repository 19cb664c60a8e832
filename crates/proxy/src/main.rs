//! Burrow - Main entry point
//!
//! Forwarding proxy with CONNECT-tunnel upstream transports.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use burrow_config::Config;
use burrow_proxy::ProxyServer;

/// Burrow - forwarding proxy with CONNECT-tunnel upstreams
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "BURROW_CONFIG")]
    config: String,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,
}

fn main() -> Result<()> {
    // Install rustls crypto provider before any TLS operations
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    burrow_common::init_tracing(level)?;

    let config = load_config(&cli.config)?;

    if cli.test {
        info!("Configuration test successful:");
        info!("  - {} listener(s)", config.listeners.len());
        info!("  - {} cluster(s)", config.clusters.len());
        for (id, cluster) in &config.clusters {
            info!(
                "  - cluster '{}' -> {} via {}",
                id,
                cluster.endpoint,
                cluster.transport.name()
            );
        }
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_server(config))
}

fn load_config(path: &str) -> Result<Config> {
    info!("Loading configuration from: {}", path);
    let config = Config::from_file(path).context("Failed to load configuration file")?;
    config
        .validate()
        .context("Configuration validation failed")?;
    Ok(config)
}

async fn run_server(config: Config) -> Result<()> {
    let server = ProxyServer::from_config(&config).context("Failed to initialize proxy")?;
    let bound = server.bind().await.context("Failed to bind listeners")?;

    info!(
        listeners = config.listeners.len(),
        clusters = config.clusters.len(),
        "Burrow started"
    );

    bound
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
        .context("Server error")?;

    info!("Burrow stopped");
    Ok(())
}
