//! capsuled - data-capsule server daemon
//!
//! Advertises its capsule names to the home RIB and echoes delivered
//! overlay datagrams back along the reverse source route.

use capsuled::config::Config;
use capsuled::server::CapsuleServer;
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let default_directive = if config.verbose { "capsuled=debug" } else { "capsuled=info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(default_directive.parse().unwrap()))
        .init();

    info!("capsuled v{} - trustmesh capsule server", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    match CapsuleServer::new(config) {
        Ok(server) => {
            if let Err(e) = server.run().await {
                error!("Server error: {e}");
                return ExitCode::FAILURE;
            }
        }
        Err(e) => {
            error!("Failed to initialize server: {e}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
