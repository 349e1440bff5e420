use clap::Parser;
use client::network::{Client, ClientConfig};
use log::info;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server WebSocket URL
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:8080")]
    server: String,

    /// Username to join with
    #[arg(short = 'u', long, default_value = "player")]
    username: String,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Reconnect attempts before giving up
    #[arg(short = 'r', long, default_value = "5")]
    max_attempts: u32,

    /// First reconnect delay in milliseconds, doubled on every retry
    #[arg(short = 'b', long, default_value = "250")]
    backoff_ms: u64,

    /// Client tick rate (commands per second)
    #[arg(short = 't', long, default_value = "30")]
    tick_rate: u32,

    /// Disable client-side prediction
    #[arg(long)]
    no_prediction: bool,

    /// Walk back and forth instead of standing still
    #[arg(long)]
    patrol: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {} as {}", args.server, args.username);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let config = ClientConfig {
        url: args.server,
        username: args.username,
        max_attempts: args.max_attempts,
        base_backoff: Duration::from_millis(args.backoff_ms),
        fake_latency_ms: args.fake_ping,
        tick_rate: args.tick_rate,
        prediction: !args.no_prediction,
        patrol: args.patrol,
        ..Default::default()
    };
    let mut client = Client::new(config)?;

    tokio::select! {
        result = client.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, disconnecting"),
    }

    Ok(())
}
