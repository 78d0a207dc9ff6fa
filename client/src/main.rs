use clap::Parser;
use client::network::Client;
use log::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Account to connect as
    #[arg(short = 'u', long)]
    user_id: u64,

    /// Display name; must match the roster name for the match
    #[arg(short = 'n', long)]
    name: String,

    /// Match to join
    #[arg(short = 'm', long)]
    match_id: u64,

    /// Stop after this many rendered frames (0 runs until game over)
    #[arg(short = 'f', long, default_value = "0")]
    frames: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);

    let mut client = Client::new(&args.server, args.user_id, &args.name, args.match_id).await?;
    let summary = client.run(args.frames).await?;

    info!(
        "Rendered {} frames from {} snapshots ({} dropped, {} clock resets)",
        summary.frames_rendered, summary.snapshots, summary.dropped, summary.severe_resets
    );

    Ok(())
}
