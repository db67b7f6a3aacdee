//! clientd - trustmesh client daemon
//!
//! Pledges trust to its home RIB, discovers the nearest local overlay
//! switch, requests source routes toward capsule names, injects
//! request datagrams, and measures RTT from the echoed replies.

use clap::Parser;
use clientd::config::Config;
use clientd::daemon::ClientDaemon;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let default_directive = if config.verbose { "clientd=debug" } else { "clientd=info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(default_directive.parse().unwrap()))
        .init();

    info!("clientd v{} - trustmesh client", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    match ClientDaemon::new(config) {
        Ok(daemon) => {
            if let Err(e) = daemon.run().await {
                error!("Client error: {e}");
                return ExitCode::FAILURE;
            }
        }
        Err(e) => {
            error!("Failed to initialize client: {e}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
