//! Configuration for switchd

use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// switchd - overlay switch daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "switchd")]
#[command(about = "Overlay switch: hop-by-hop forwarder, liveness pinger, neighbour prober")]
pub struct Config {
    /// Address this switch answers on
    #[arg(short, long)]
    pub addr: Ipv4Addr,

    /// Trust domain this switch belongs to
    #[arg(short, long)]
    pub td: u32,

    /// Topology fact table (every TD's RIB and router addresses)
    #[arg(long, default_value = "./topology.json")]
    pub topology: PathBuf,

    /// Delay before the first peer/switch bootstrap, letting trace
    /// discovery settle on the RIBs
    #[arg(long, default_value = "15")]
    pub peer_calc_delay_secs: u64,

    /// Cadence for refreshing the peer map and peer-switch cache
    #[arg(long, default_value = "60")]
    pub refresh_interval_secs: u64,

    /// RIB liveness ping interval in seconds
    #[arg(long, default_value = "1")]
    pub ping_interval_secs: u64,

    /// Delay before the first neighbour probe round
    #[arg(long, default_value = "50")]
    pub probe_first_delay_secs: u64,

    /// Interval between neighbour probe rounds
    #[arg(long, default_value = "100")]
    pub probe_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ping_interval_secs == 0 {
            anyhow::bail!("ping interval must be positive");
        }
        if !self.topology.exists() {
            anyhow::bail!("topology file not found: {}", self.topology.display());
        }
        Ok(())
    }
}
