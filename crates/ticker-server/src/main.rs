//! WebSocket time ticker server.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ticker_server::config::Config;
use ticker_server::server;

#[derive(Parser)]
#[clap(name = "ticker-server")]
#[clap(about = "Pushes the current time to every connected WebSocket client")]
struct Cli {
    /// Interface to bind (overrides TICKER_BIND_ADDR)
    #[clap(short, long)]
    bind: Option<String>,

    /// Port to listen on (overrides TICKER_PORT)
    #[clap(short, long)]
    port: Option<u16>,

    /// Maximum simultaneous clients (overrides TICKER_MAX_CLIENTS)
    #[clap(short, long)]
    max_clients: Option<usize>,

    /// Broadcast period in milliseconds (overrides TICKER_BROADCAST_INTERVAL_MS)
    #[clap(short, long)]
    interval_ms: Option<u64>,
}

impl Cli {
    fn apply(self, mut config: Config) -> Config {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max_clients) = self.max_clients {
            config.max_clients = max_clients;
        }
        if let Some(ms) = self.interval_ms {
            config.broadcast_interval = Duration::from_millis(ms);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().apply(Config::from_env()?);

    info!(
        addr = %config.socket_addr_string(),
        max_clients = config.max_clients,
        interval_ms = config.broadcast_interval.as_millis() as u64,
        "starting ticker-server"
    );

    server::run(config).await
}
