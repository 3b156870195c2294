//! Synclink CLI
//!
//! Command-line tools for synclink client configurations.
//!
//! # Commands
//!
//! - `check-config` - Validate a client configuration file
//! - `simulate` - Replay a timeline of sessions and transport events

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use synclink_core::LogLevel;
use tracing_subscriber::EnvFilter;

/// Synclink command-line tools.
#[derive(Parser)]
#[command(name = "synclink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Log level (off, fatal, error, warn, info, detail, debug, trace, all)
    #[arg(global = true, long)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a client configuration file
    CheckConfig {
        /// Path to the JSON configuration
        file: PathBuf,

        /// Accept PEM pinned certificates
        #[arg(long)]
        allow_pem: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Replay a timeline against a mock transport
    Simulate {
        /// Path to the JSON timeline
        file: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.log_level {
        Some(level) => EnvFilter::default().add_directive(level.to_level_filter().into()),
        None if cli.verbose => EnvFilter::new("debug"),
        None => EnvFilter::new("info"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::CheckConfig {
            file,
            allow_pem,
            format,
        } => {
            commands::check_config::run(&file, allow_pem, &format)?;
        }
        Commands::Simulate { file, format } => {
            commands::simulate::run(&file, cli.log_level, &format)?;
        }
        Commands::Version => {
            println!("synclink CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
