//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// OAuth 2.1 authorization proxy and token broker for MCP clients
#[derive(Parser, Debug)]
#[command(name = "mcp-auth-broker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "BROKER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "BROKER_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "BROKER_HOST")]
    pub host: Option<String>,

    /// Externally visible base URL
    #[arg(long, env = "BROKER_BASE_URL")]
    pub base_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "BROKER_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "BROKER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the broker server (default)
    Serve,
}
