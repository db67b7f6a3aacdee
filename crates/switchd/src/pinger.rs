//! RIB liveness pinger.
//!
//! Switches only ping their own RIB. Two switches that can both reach
//! the RIB have at least one IP path between them, so switch-to-switch
//! liveness is unnecessary.

use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use trustmesh_core::{LINKSTATE_PORT, SWITCH_PING_PORT};
use trustmesh_net::udp;

pub async fn run(
    addr: Ipv4Addr,
    rib: Ipv4Addr,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> io::Result<()> {
    let socket = udp::bind(addr, SWITCH_PING_PORT)?;
    let dest = udp::dest(rib, LINKSTATE_PORT);
    let mut ticker = tokio::time::interval(interval);
    let mut seq: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = socket.send_to(&seq.to_le_bytes(), dest).await {
                    debug!(%err, "liveness ping failed");
                } else {
                    trace!(seq, %rib, "liveness ping sent");
                }
                seq = seq.wrapping_add(1);
            }
            _ = shutdown.recv() => return Ok(()),
        }
    }
}
