use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::network::Server;
use std::path::PathBuf;

/// Parses command-line arguments, loads the configuration and runs the
/// server until it fails or Ctrl+C is pressed.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// JSON configuration file; flags below override its values
        #[clap(short, long)]
        config: Option<PathBuf>,
        /// Server IP address to bind to
        #[clap(short = 'H', long)]
        host: Option<String>,
        /// Server port to listen on
        #[clap(short, long)]
        port: Option<u16>,
        /// Tick rate (updates per second)
        #[clap(short, long)]
        tick_rate: Option<u32>,
        /// Maximum number of connected players
        #[clap(short, long)]
        max_clients: Option<usize>,
        /// Seed for world generation and spawn points
        #[clap(long)]
        seed: Option<u64>,
    }

    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_json_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(tick_rate) = args.tick_rate {
        config.tick_rate = tick_rate;
    }
    if let Some(max_clients) = args.max_clients {
        config.max_clients = max_clients;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }

    info!(
        "Starting server on {} at {} Hz, up to {} players",
        config.address(),
        config.tick_rate,
        config.max_clients
    );
    let server = Server::new(config)?;

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Cannot listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    if let Err(e) = server.run_until(shutdown).await {
        error!("Server stopped: {}", e);
        return Err(e);
    }

    Ok(())
}
