//! MCP Auth Broker - OAuth 2.1 authorization proxy for MCP clients
//!
//! Brokers delegated access to Google APIs: MCP clients authenticate with
//! opaque broker tokens and never see the user's Google credentials.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use mcp_auth_broker::{
    cli::{Cli, Command},
    config::Config,
    server::Broker,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Run the broker server
async fn run_server(cli: Cli) -> ExitCode {
    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            if let Some(ref base_url) = cli.base_url {
                config.server.base_url = base_url.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        base_url = %config.server.base_url,
        "Starting MCP auth broker"
    );

    let broker = match Broker::new(config) {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to create broker: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = broker.run().await {
        error!("Broker error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Broker shutdown complete");
    ExitCode::SUCCESS
}
