//! ribd - trust-domain RIB daemon
//!
//! Runs the four control-plane services of one trust domain: the
//! advertisement store, the link-state manager, the certificate
//! store, and the path computer, plus the trace probe that discovers
//! peer domains.

use clap::Parser;
use ribd::config::Config;
use ribd::rib::Rib;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let default_directive = if config.verbose { "ribd=debug" } else { "ribd=info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(default_directive.parse().unwrap()))
        .init();

    info!("ribd v{} - trustmesh RIB daemon", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    match Rib::new(config) {
        Ok(rib) => {
            if let Err(e) = rib.run().await {
                error!("RIB error: {e}");
                return ExitCode::FAILURE;
            }
        }
        Err(e) => {
            error!("Failed to initialize RIB: {e}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
