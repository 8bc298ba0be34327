use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use talon::config::TalonConfig;
use talon::node::TalonNode;

#[derive(Parser)]
#[command(name = "talon")]
#[command(about = "Coin ledger and instance provisioning node", long_about = None)]
struct Cli {
    /// Path to the TOML config; created with defaults when missing.
    #[arg(long, default_value = "talon.toml")]
    config: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node with its queue drainer and transfer sweeper.
    Start,
    /// Write the default config file and exit.
    InitConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::InitConfig => {
            TalonConfig::load_or_default(&cli.config);
        }
        Commands::Start => start(&cli.config).await,
    }
}

async fn start(config_path: &str) {
    let config = TalonConfig::load_or_default(config_path);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.node.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let node = match TalonNode::open(config) {
        Ok(node) => node,
        Err(e) => {
            eprintln!("failed to open node: {}", e);
            std::process::exit(1);
        }
    };

    let drainer = node.spawn_drainer();
    let sweeper = node.spawn_transfer_sweeper();
    info!("talon node running, press ctrl-c to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal handling failed: {}", e);
    }
    info!("shutting down");
    drainer.abort();
    sweeper.abort();
    if let Err(e) = node.shutdown().await {
        error!("final flush failed: {}", e);
    }
}
