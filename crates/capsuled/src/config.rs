//! Configuration for capsuled

use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// capsuled - data-capsule server daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "capsuled")]
#[command(about = "Data-capsule server: advertises its names and echoes overlay datagrams")]
pub struct Config {
    /// Address this server answers on
    #[arg(short, long)]
    pub addr: Ipv4Addr,

    /// Trust domain this server lives in
    #[arg(short, long)]
    pub td: u32,

    /// Topology fact table (every TD's RIB and router addresses)
    #[arg(long, default_value = "./topology.json")]
    pub topology: PathBuf,

    /// Capsule names to advertise, owner-scoped (owner:name)
    #[arg(short, long = "name", required = true)]
    pub names: Vec<String>,

    /// Seconds between advertisements (one name per tick)
    #[arg(long, default_value = "1")]
    pub advertise_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.advertise_interval_secs == 0 {
            anyhow::bail!("advertise interval must be positive");
        }
        for name in &self.names {
            if !name.contains(':') {
                anyhow::bail!("capsule name must be owner-scoped (owner:name): {name}");
            }
        }
        if !self.topology.exists() {
            anyhow::bail!("topology file not found: {}", self.topology.display());
        }
        Ok(())
    }
}
