mod config;
mod server;

use clap::{Parser, Subcommand};
use config::Config;
use quire_core::KeyPair;
use server::run_server;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "quire")]
#[command(about = "Peer-to-peer block store with gossip membership")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Generate a key pair file
    Keygen {
        /// Where to write the key pair
        #[arg(short, long, default_value = "keys.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quire=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting Quire server with config: {}", config);

            let cfg = match Config::from_file(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            if let Err(e) = run_server(cfg).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Keygen { output } => {
            if output.exists() {
                anyhow::bail!("{} already exists", output.display());
            }
            let keys = KeyPair::generate();
            config::write_keys(&output, &keys)?;
            tracing::info!("Wrote key pair to {}", output.display());
            println!("{}", keys.public());
        }
    }

    Ok(())
}
