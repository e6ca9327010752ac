pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control API server and event stream
    Serve {
        /// Bind address (overrides configuration)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides configuration)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Discover and crawl a city once, then exit
    Crawl {
        /// City name to discover and crawl
        #[arg(required = true)]
        city: String,

        /// Maximum crawling depth
        #[arg(short, long)]
        depth: Option<u32>,
    },

    /// Show the current configuration
    Config,
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve { host, port } => {
            info!("Starting control API server");
            commands::serve(host, port).await
        }
        Commands::Crawl { city, depth } => {
            info!("Starting one-shot crawl for {}", city);
            commands::crawl(city, depth).await
        }
        Commands::Config => commands::show_config(),
    }
}
