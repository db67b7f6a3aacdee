//! TTL-sweep trace engine.
//!
//! A trace walks TTLs from 1 upward, sending a bounded number of
//! probes per hop and recording which router answered. The transport
//! that actually emits probes is a trait so the sweep logic runs the
//! same against the raw-ICMP implementation and against fixtures.
//!
//! Peer inference: a remote RIB is a direct peer exactly when the
//! trace toward it crosses two distinct trust domains, the local one
//! and the remote one. Any third domain on the path means the remote
//! is not one hop away.

use std::collections::BTreeSet;
use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::debug;
use trustmesh_core::topology::Topology;
use trustmesh_core::types::TdId;

/// Emits a single bounded-TTL probe and resolves to the address of
/// whichever router answered it, if any.
pub trait ProbeTransport {
    fn probe(
        &self,
        target: Ipv4Addr,
        ttl: u32,
        seq: u16,
    ) -> impl Future<Output = io::Result<Option<Ipv4Addr>>> + Send;
}

#[derive(Clone, Copy, Debug)]
pub struct TraceConfig {
    pub max_ttl: u32,
    pub probes_per_hop: u32,
    pub reply_timeout: Duration,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_ttl: 30,
            probes_per_hop: 3,
            reply_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Tracer<T> {
    transport: T,
    config: TraceConfig,
}

impl<T: ProbeTransport> Tracer<T> {
    pub fn new(transport: T, config: TraceConfig) -> Self {
        Self { transport, config }
    }

    /// Sweep TTLs toward `target`. Each element is the router that
    /// answered at that TTL, `None` when every probe timed out. The
    /// sweep stops once the target itself answers or `max_ttl` is
    /// exhausted.
    pub async fn trace(&self, target: Ipv4Addr) -> Vec<Option<Ipv4Addr>> {
        let mut hops = Vec::new();
        let mut seq: u16 = 0;

        for ttl in 1..=self.config.max_ttl {
            let mut hop = None;
            for _ in 0..self.config.probes_per_hop {
                seq = seq.wrapping_add(1);
                let attempt = tokio::time::timeout(
                    self.config.reply_timeout,
                    self.transport.probe(target, ttl, seq),
                );
                match attempt.await {
                    Ok(Ok(Some(router))) => {
                        hop = Some(router);
                        break;
                    }
                    Ok(Ok(None)) => continue,
                    Ok(Err(err)) => {
                        debug!(ttl, %err, "probe send failed");
                        continue;
                    }
                    Err(_) => continue,
                }
            }

            debug!(ttl, hop = ?hop, "trace hop");
            let reached = hop == Some(target);
            hops.push(hop);
            if reached {
                break;
            }
        }

        hops
    }
}

/// Apply the exactly-two-domains rule to a completed trace. Returns
/// the remote TD when the hops resolve to the local TD plus one other.
pub fn infer_peer_td(local_td: TdId, hops: &[Option<Ipv4Addr>], topo: &Topology) -> Option<TdId> {
    let mut seen = BTreeSet::new();
    for router in hops.iter().flatten() {
        if let Some(td) = topo.td_of(*router) {
            seen.insert(td);
        }
    }
    if seen.len() == 2 && seen.contains(&local_td) {
        seen.into_iter().find(|td| *td != local_td)
    } else {
        None
    }
}
