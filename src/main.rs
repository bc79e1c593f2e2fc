use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use atelier::config::EngineConfig;
use atelier::server::{ServerConfig, start_server};

#[derive(Parser)]
#[command(name = "atelier")]
#[command(version, about = "Phase-driven project build engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        #[arg(short, long, default_value = "8787")]
        port: u16,

        /// SQLite database path
        #[arg(long, default_value = ".atelier/engine.db")]
        db: PathBuf,

        /// Bind on all interfaces and allow any CORS origin
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, db, dev } => {
            let config = ServerConfig {
                port,
                db_path: db,
                dev_mode: dev,
            };
            start_server(config, EngineConfig::from_env()).await
        }
    }
}
