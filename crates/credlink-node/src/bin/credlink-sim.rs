//! Runs the channel manager against simulated routers and checks every echo.

use std::path::PathBuf;

use clap::Parser;

use credlink_node::NodeConfig;
use credlink_node::peer_sim::{self, SimConfig};

#[derive(Parser)]
#[command(
    name = "credlink-sim",
    about = "Echo payloads through the channel manager from simulated routers"
)]
struct Cli {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of simulated routers
    #[arg(short, long, default_value_t = 4)]
    peers: u16,

    /// Payloads each router sends
    #[arg(long, default_value_t = 16)]
    payloads: usize,

    /// Seed for payload generation
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match NodeConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("failed to load config from {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => NodeConfig::default(),
    };

    credlink_node::logging::init(&config.logging);

    let sim = SimConfig {
        peers: cli.peers,
        payloads: cli.payloads,
        seed: cli.seed,
        ..SimConfig::default()
    };

    let report = match peer_sim::simulate(&config, &sim).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("simulation failed: {e}");
            std::process::exit(1);
        }
    };

    println!("channels opened:   {}", report.opened);
    println!("opens rejected:    {}", report.rejected);
    println!("payloads sent:     {}", report.payloads_sent);
    println!("echoes matched:    {}", report.echoes_ok);
    println!("echo mismatches:   {}", report.mismatches);
    println!("unexpected:        {}", report.unexpected);
    println!(
        "credit grants:     {} ({} credits)",
        report.grants, report.credits_granted
    );
    println!("tx credit updates: {}", report.tx_updates);
    println!("channels closed:   {}", report.closed);

    if !report.is_clean() {
        std::process::exit(2);
    }
}
