//! Link-state manager.
//!
//! Any datagram landing on the liveness port marks its source address
//! as a live local switch. Entries expire after three missed ping
//! intervals. The same port answers `GIVEPEERS` with the peer table
//! discovered by the trace probe.

use crate::rib::PeerMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use trustmesh_core::proto;

pub struct LinkStateManager {
    expiry: Duration,
    live: RwLock<HashMap<Ipv4Addr, Instant>>,
    peers: Arc<PeerMap>,
}

impl LinkStateManager {
    pub fn new(ping_interval: Duration, peers: Arc<PeerMap>) -> Self {
        Self {
            expiry: ping_interval * 3,
            live: RwLock::new(HashMap::new()),
            peers,
        }
    }

    pub fn record_ping(&self, switch: Ipv4Addr) {
        self.live.write().insert(switch, Instant::now());
    }

    /// Live switches, expired entries pruned, sorted for stable output.
    pub fn live_switches(&self) -> Vec<Ipv4Addr> {
        let now = Instant::now();
        let mut live = self.live.write();
        live.retain(|_, seen| now.duration_since(*seen) <= self.expiry);
        let mut out: Vec<Ipv4Addr> = live.keys().copied().collect();
        out.sort();
        out
    }

    /// One datagram in, at most one reply out.
    pub fn handle(&self, raw: &[u8], from: SocketAddr) -> Option<Vec<u8>> {
        if raw == proto::GIVEPEERS.as_bytes() {
            return Some(proto::format_peer_lines(&self.peers.snapshot()).into_bytes());
        }
        let SocketAddr::V4(from) = from else {
            return None;
        };
        debug!(switch = %from.ip(), "liveness ping");
        self.record_ping(*from.ip());
        None
    }
}

pub async fn serve(
    manager: Arc<LinkStateManager>,
    socket: tokio::net::UdpSocket,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; trustmesh_net::udp::MAX_DATAGRAM];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        if let Some(reply) = manager.handle(&buf[..len], from) {
                            if let Err(err) = socket.send_to(&reply, from).await {
                                debug!(%from, %err, "peer reply failed");
                            }
                        }
                    }
                    Err(err) => debug!(%err, "link state recv error"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
