//! pfxfer CLI - Command-line front end of the transfer engine
//!
//! Manages the transfer settings and runs local, bandwidth-limited copies
//! through the full download pipeline.

mod commands;
mod loopback;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// pfxfer - Bandwidth-limited, resumable file transfers
#[derive(Parser)]
#[command(name = "pfxfer")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for pfxfer
    #[arg(long, env = "PFXFER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a file through the transfer engine. Re-run to resume.
    Copy {
        /// Source file
        source: PathBuf,

        /// Destination file or directory
        destination: PathBuf,

        /// Bandwidth limit in bytes/sec (overrides the LAN limits of the settings)
        #[arg(short, long)]
        limit: Option<u64>,

        /// Bytes per chunk
        #[arg(short, long, default_value_t = 32 * 1024)]
        chunk_size: usize,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key, e.g. `bandwidth.upload_limit_wan`
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("pfxfer"))
            .unwrap_or_else(|| PathBuf::from(".pfxfer"))
    });

    // Initialize core
    let core = pfxfer_core::TransferCore::new(data_dir).await?;

    // Execute command
    match cli.command {
        Commands::Copy {
            source,
            destination,
            limit,
            chunk_size,
        } => commands::copy_file(&core, source, destination, limit, chunk_size, cli.output).await?,

        Commands::Config { action } => commands::config_action(&core, action, cli.output).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "pfxfer", &mut std::io::stdout());
        }
    }

    Ok(())
}
