//! switchd - overlay switch daemon
//!
//! Forwards source-routed overlay datagrams hop by hop, pings its RIB
//! so the link-state manager keeps it in the live set, and probes
//! neighbour switches for RTT.

use clap::Parser;
use std::process::ExitCode;
use switchd::config::Config;
use switchd::switch::OverlaySwitch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let default_directive = if config.verbose { "switchd=debug" } else { "switchd=info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(default_directive.parse().unwrap()))
        .init();

    info!("switchd v{} - trustmesh overlay switch", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    match OverlaySwitch::new(config) {
        Ok(switch) => {
            if let Err(e) = switch.run().await {
                error!("Switch error: {e}");
                return ExitCode::FAILURE;
            }
        }
        Err(e) => {
            error!("Failed to initialize switch: {e}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
