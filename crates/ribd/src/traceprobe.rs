//! Trace-based peer discovery.
//!
//! Every other RIB in the topology is traced in turn, serially with a
//! staggered start. A trace crossing exactly the local domain and one
//! other proves direct peering, and the remote RIB lands in the peer
//! map that the ad store floods against and `GIVEPEERS` reports. This
//! is the only way peers are ever learned.

use crate::rib::PeerMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};
use trustmesh_core::topology::Topology;
use trustmesh_core::types::TdId;
use trustmesh_net::trace::{infer_peer_td, ProbeTransport, Tracer};

/// Gap between consecutive trace targets within one sweep.
const TARGET_STAGGER: Duration = Duration::from_secs(1);

pub struct TraceProbe<T> {
    td: TdId,
    addr: Ipv4Addr,
    topology: Arc<Topology>,
    peers: Arc<PeerMap>,
    tracer: Tracer<T>,
    sweep_interval: Duration,
}

impl<T: ProbeTransport> TraceProbe<T> {
    pub fn new(
        td: TdId,
        addr: Ipv4Addr,
        topology: Arc<Topology>,
        peers: Arc<PeerMap>,
        tracer: Tracer<T>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            td,
            addr,
            topology,
            peers,
            tracer,
            sweep_interval,
        }
    }

    /// Trace one remote RIB and record it if it proves to be a peer.
    pub async fn probe_target(&self, target_td: TdId, target_rib: Ipv4Addr) {
        let hops = self.tracer.trace(target_rib).await;
        for (ttl, hop) in hops.iter().enumerate() {
            let resolved = hop.and_then(|ip| self.topology.td_of(ip));
            debug!(ttl = ttl + 1, hop = ?hop, td = ?resolved, "trace hop resolved");
        }

        match infer_peer_td(self.td, &hops, &self.topology) {
            Some(peer_td) => {
                self.peers.insert(peer_td, target_rib);
                info!(td = self.td, peer_td, rib = %target_rib, "direct peer recorded");
            }
            None => {
                debug!(td = self.td, target_td, rib = %target_rib, "not a one-hop peer");
            }
        }
    }

    /// Sweep every other RIB forever, one full pass per interval.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let targets: Vec<(TdId, Ipv4Addr)> = self
                .topology
                .ribs()
                .filter(|(_, rib)| *rib != self.addr)
                .collect();

            for (target_td, target_rib) in targets {
                tokio::select! {
                    _ = tokio::time::sleep(TARGET_STAGGER) => {}
                    _ = shutdown.recv() => return,
                }
                self.probe_target(target_td, target_rib).await;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.sweep_interval) => {}
                _ = shutdown.recv() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;
    use trustmesh_core::topology::TdEntry;
    use trustmesh_net::trace::TraceConfig;

    /// Routes keyed by (target, ttl).
    struct FixtureTransport {
        hops: HashMap<(Ipv4Addr, u32), Ipv4Addr>,
    }

    impl ProbeTransport for FixtureTransport {
        async fn probe(
            &self,
            target: Ipv4Addr,
            ttl: u32,
            _seq: u16,
        ) -> io::Result<Option<Ipv4Addr>> {
            Ok(self.hops.get(&(target, ttl)).copied())
        }
    }

    fn topology() -> Arc<Topology> {
        Arc::new(
            Topology::from_entries(vec![
                TdEntry {
                    td: 0,
                    rib: "10.0.0.1".parse().unwrap(),
                    addrs: vec!["10.0.0.7".parse().unwrap()],
                },
                TdEntry {
                    td: 1,
                    rib: "10.0.1.1".parse().unwrap(),
                    addrs: vec!["10.0.1.7".parse().unwrap()],
                },
                TdEntry {
                    td: 2,
                    rib: "10.0.2.1".parse().unwrap(),
                    addrs: vec!["10.0.2.7".parse().unwrap()],
                },
            ])
            .unwrap(),
        )
    }

    fn route(entries: &[(&str, u32, &str)]) -> FixtureTransport {
        FixtureTransport {
            hops: entries
                .iter()
                .map(|(target, ttl, hop)| {
                    ((target.parse().unwrap(), *ttl), hop.parse().unwrap())
                })
                .collect(),
        }
    }

    fn quick_tracer(transport: FixtureTransport) -> Tracer<FixtureTransport> {
        Tracer::new(
            transport,
            TraceConfig {
                max_ttl: 8,
                probes_per_hop: 1,
                reply_timeout: Duration::from_millis(20),
            },
        )
    }

    #[tokio::test]
    async fn adjacent_rib_becomes_peer() {
        // From TD 0, the trace to TD 1's RIB crosses only TDs 0 and 1.
        let transport = route(&[
            ("10.0.1.1", 1, "10.0.0.7"),
            ("10.0.1.1", 2, "10.0.1.7"),
            ("10.0.1.1", 3, "10.0.1.1"),
        ]);
        let peers = Arc::new(PeerMap::new());
        let probe = TraceProbe::new(
            0,
            "10.0.0.1".parse().unwrap(),
            topology(),
            peers.clone(),
            quick_tracer(transport),
            Duration::from_secs(60),
        );

        probe.probe_target(1, "10.0.1.1".parse().unwrap()).await;
        assert_eq!(
            peers.snapshot().get(&1),
            Some(&"10.0.1.1".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn two_hop_rib_is_not_a_peer() {
        // The trace to TD 2 passes through TD 1 routers.
        let transport = route(&[
            ("10.0.2.1", 1, "10.0.0.7"),
            ("10.0.2.1", 2, "10.0.1.7"),
            ("10.0.2.1", 3, "10.0.2.7"),
            ("10.0.2.1", 4, "10.0.2.1"),
        ]);
        let peers = Arc::new(PeerMap::new());
        let probe = TraceProbe::new(
            0,
            "10.0.0.1".parse().unwrap(),
            topology(),
            peers.clone(),
            quick_tracer(transport),
            Duration::from_secs(60),
        );

        probe.probe_target(2, "10.0.2.1".parse().unwrap()).await;
        assert!(peers.snapshot().is_empty());
    }
}
