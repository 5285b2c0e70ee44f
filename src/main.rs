use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use edge_tunnel::{DEFAULT_CONFIG_PATH, Server, load_config};

/// WebSocket tunnel endpoint.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    info!(
        config_file = %cli.config.display(),
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        tls = config.listen.tls.is_some(),
        fallback_address = %config.tunnel.fallback_address,
        "Configuration loaded"
    );

    let server = Server::bind(&config).await?;
    server.run().await
}
