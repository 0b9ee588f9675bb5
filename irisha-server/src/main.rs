use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use irisha_server::config::{ServerConfig, Settings};
use irisha_server::server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (IRISHA_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("IRISHA_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("irisha_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = ServerConfig::parse();
    let settings = Settings::load(&config.config)?;
    tracing::info!("Starting {} on {}", settings.domain, config.listen_addr);
    if let Some(peer) = &config.peer {
        tracing::info!("Will link to peer {}", peer.address());
    }

    Server::new(config, settings).run().await
}
