//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Keep mTLS client credentials hot-reloaded from a secret store
#[derive(Parser, Debug)]
#[command(name = "certloader")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CERTLOADER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "CERTLOADER_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CERTLOADER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to run)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load credentials and keep them hot until interrupted (default)
    Run,

    /// Load credentials and print their metadata as JSON
    Inspect,

    /// Fetch a document through the first supported access strategy
    Fetch {
        /// Document URL
        #[arg(long)]
        url: String,

        /// Declared access strategy types, in preference order (`custom=<type>` for custom)
        #[arg(long = "strategy", default_value = "open")]
        strategies: Vec<String>,

        /// Tenant id sent with mTLS requests
        #[arg(long)]
        tenant: Option<String>,
    },
}
