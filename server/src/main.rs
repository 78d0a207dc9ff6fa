use clap::Parser;
use log::{error, info};
use server::config::{RoomConfig, RuntimeConfig};
use server::network::{Server, ServerMessage};
use server::store::MemoryStore;
use std::sync::Arc;

/// Parses command-line arguments, loads the match roster and runs the
/// session server until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Maximum concurrent connections
        #[clap(long, default_value = "256")]
        max_clients: usize,
        /// JSON file with live match rosters and character levels
        #[clap(short, long)]
        matches: Option<String>,
        /// JSON file with runtime overrides (reward multipliers, floor, ceiling)
        #[clap(short, long, default_value = "overrides.json")]
        overrides: String,
        /// Simulation ticks per second
        #[clap(short, long, default_value = "60")]
        tick_rate: u32,
        /// Emit a snapshot every N ticks
        #[clap(short, long, default_value = "3")]
        snapshot_every: u64,
    }

    let args = Args::parse();

    let store = match &args.matches {
        Some(path) => MemoryStore::from_json_file(path)?,
        None => {
            info!("No match roster given, starting with an empty store");
            MemoryStore::new()
        }
    };
    let runtime = RuntimeConfig::load(&args.overrides);
    let room_config = RoomConfig::with_tick_rate(args.tick_rate, args.snapshot_every);

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(
        &address,
        args.max_clients,
        Arc::new(store),
        runtime,
        room_config,
    )
    .await?;
    let control = server.control();

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Server stopped with error: {}", e);
        }
    });

    // Handle shutdown gracefully
    tokio::select! {
        result = server_handle => {
            if let Err(e) = result {
                error!("Server task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            let _ = control.send(ServerMessage::Shutdown);
        }
    }

    Ok(())
}
