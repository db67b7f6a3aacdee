//! Configuration for ribd

use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// ribd - trust-domain RIB daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "ribd")]
#[command(about = "Trust-domain control plane: ad store, cert store, path computer, link-state manager")]
pub struct Config {
    /// Address this RIB answers on; must appear in the topology file
    #[arg(short, long)]
    pub addr: Ipv4Addr,

    /// Topology fact table (every TD's RIB and router addresses)
    #[arg(short, long, default_value = "./topology.json")]
    pub topology: PathBuf,

    /// Switch liveness ping interval in seconds; entries expire after
    /// three missed intervals
    #[arg(long, default_value = "1")]
    pub ping_interval_secs: u64,

    /// Trust-graph rebuild cadence in seconds
    #[arg(long, default_value = "1")]
    pub rebuild_interval_secs: u64,

    /// Peer-discovery trace sweep cadence in seconds
    #[arg(long, default_value = "120")]
    pub trace_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ping_interval_secs == 0 {
            anyhow::bail!("ping interval must be positive");
        }
        if self.rebuild_interval_secs == 0 {
            anyhow::bail!("rebuild interval must be positive");
        }
        if !self.topology.exists() {
            anyhow::bail!("topology file not found: {}", self.topology.display());
        }
        Ok(())
    }
}
