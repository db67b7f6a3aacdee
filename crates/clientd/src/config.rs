//! Configuration for clientd

use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use trustmesh_core::wire::SEND_TIME_LEN;

/// clientd - trustmesh client daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "clientd")]
#[command(about = "Client: pledges trust, requests paths, injects datagrams, measures RTT")]
pub struct Config {
    /// Name this client pledges under, of the form user:<name>
    #[arg(short, long, default_value = "user:1")]
    pub name: String,

    /// Address this client answers on
    #[arg(short, long)]
    pub addr: Ipv4Addr,

    /// Trust domain this client lives in
    #[arg(short, long)]
    pub td: u32,

    /// Topology fact table (every TD's RIB and router addresses)
    #[arg(long, default_value = "./topology.json")]
    pub topology: PathBuf,

    /// Capsule names to route toward
    #[arg(short = 'd', long = "dc-name")]
    pub dc_names: Vec<String>,

    /// Entities to distrust at startup (e.g. AS0)
    #[arg(long = "distrust")]
    pub distrusts: Vec<String>,

    /// Seconds between path request rounds
    #[arg(long, default_value = "10")]
    pub path_interval_secs: u64,

    /// Seconds between datagram injections per route
    #[arg(long, default_value = "1")]
    pub send_interval_secs: u64,

    /// Payload bytes per injected datagram (send time included)
    #[arg(long, default_value = "256")]
    pub payload_size: usize,

    /// Delay before the first local-switch probe round
    #[arg(long, default_value = "5")]
    pub probe_first_delay_secs: u64,

    /// Interval between local-switch probe rounds
    #[arg(long, default_value = "30")]
    pub probe_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.name.starts_with("user:") {
            anyhow::bail!("client name must be user-scoped (user:<name>): {}", self.name);
        }
        if self.payload_size < SEND_TIME_LEN {
            anyhow::bail!("payload size must hold the {SEND_TIME_LEN}-byte send time");
        }
        if !self.topology.exists() {
            anyhow::bail!("topology file not found: {}", self.topology.display());
        }
        Ok(())
    }
}
