//! BFF Gateway - OAuth2 token-exchanging reverse proxy

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use bff_gateway::{
    cli::{Cli, Command},
    config::{Config, Environment},
    gateway::Gateway,
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

    let Some(config) = load_config(&cli) else {
        return ExitCode::FAILURE;
    };

    match cli.command {
        Some(Command::CheckConfig) => {
            println!(
                "Configuration OK: {} route(s), {} identity provider(s), environment {:?}",
                config.proxies.len(),
                config.identity_providers.len(),
                config.environment
            );
            ExitCode::SUCCESS
        }
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load configuration, apply CLI overrides, validate
fn load_config(cli: &Cli) -> Option<Config> {
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return None;
        }
    };

    // Apply CLI overrides
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    if cli.local {
        config.environment = Environment::Local;
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return None;
    }
    Some(config)
}

async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        routes = config.proxies.len(),
        environment = ?config.environment,
        "Starting BFF gateway"
    );

    // Create and run gateway
    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
