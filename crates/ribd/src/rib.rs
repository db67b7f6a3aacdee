//! RIB aggregate - wires the four control-plane services together.
//!
//! Each component owns its state and exposes read accessors; nothing
//! reaches across except through those. Sockets bind at startup (the
//! only fatal failure), then every service runs as a task until the
//! shutdown broadcast fires.

use crate::adstore::{self, AdStore};
use crate::certstore::{self, CertStore};
use crate::config::Config;
use crate::linkstate::{self, LinkStateManager};
use crate::pathcomputer::{self, PathComputer};
use crate::traceprobe::TraceProbe;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;
use trustmesh_core::topology::{Topology, TopologyError};
use trustmesh_core::types::TdId;
use trustmesh_core::{ADSTORE_PORT, CERTSTORE_PORT, LINKSTATE_PORT, PATHCOMPUTER_PORT};
use trustmesh_net::icmp::IcmpProbeTransport;
use trustmesh_net::trace::{TraceConfig, Tracer};
use trustmesh_net::udp;

#[derive(Debug, Error)]
pub enum RibError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),
    #[error("address {0} is not a RIB in the topology")]
    UnknownAddress(Ipv4Addr),
}

/// Peer-TD table, written by the trace probe and read by the ad store
/// and the link-state manager.
#[derive(Default)]
pub struct PeerMap {
    inner: RwLock<BTreeMap<TdId, Ipv4Addr>>,
}

impl PeerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, td: TdId, rib: Ipv4Addr) {
        self.inner.write().insert(td, rib);
    }

    pub fn snapshot(&self) -> BTreeMap<TdId, Ipv4Addr> {
        self.inner.read().clone()
    }

    pub fn contains_addr(&self, rib: Ipv4Addr) -> bool {
        self.inner.read().values().any(|a| *a == rib)
    }
}

pub struct Rib {
    config: Config,
    td: TdId,
    addr: Ipv4Addr,
    topology: Arc<Topology>,
    peers: Arc<PeerMap>,
    certs: Arc<CertStore>,
    links: Arc<LinkStateManager>,
    ads: Arc<AdStore>,
    paths: Arc<PathComputer>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Rib {
    pub fn new(config: Config) -> Result<Self, RibError> {
        let topology = Arc::new(Topology::load(&config.topology)?);
        let addr = config.addr;
        let td = topology
            .td_of(addr)
            .filter(|td| topology.rib_of(*td) == Some(addr))
            .ok_or(RibError::UnknownAddress(addr))?;

        let peers = Arc::new(PeerMap::new());
        let certs = Arc::new(CertStore::new());
        let links = Arc::new(LinkStateManager::new(
            Duration::from_secs(config.ping_interval_secs),
            peers.clone(),
        ));
        let ads = Arc::new(AdStore::new(
            td,
            addr,
            topology.clone(),
            certs.clone(),
            links.clone(),
            peers.clone(),
        ));
        let paths = Arc::new(PathComputer::new(td, addr, certs.clone()));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            td,
            addr,
            topology,
            peers,
            certs,
            links,
            ads,
            paths,
            shutdown_tx,
        })
    }

    pub fn td(&self) -> TdId {
        self.td
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn run(&self) -> Result<(), RibError> {
        info!(td = self.td, addr = %self.addr, tds = self.topology.len(), "starting ribd");

        let ad_socket = udp::bind(self.addr, ADSTORE_PORT)?;
        let link_socket = udp::bind(self.addr, LINKSTATE_PORT)?;
        let cert_socket = udp::bind(self.addr, CERTSTORE_PORT)?;
        let path_socket = udp::bind(self.addr, PATHCOMPUTER_PORT)?;

        let transport = IcmpProbeTransport::new()?;
        let probe = TraceProbe::new(
            self.td,
            self.addr,
            self.topology.clone(),
            self.peers.clone(),
            Tracer::new(transport, TraceConfig::default()),
            Duration::from_secs(self.config.trace_interval_secs),
        );

        let mut tasks = tokio::task::JoinSet::new();
        tasks.spawn(adstore::serve(
            self.ads.clone(),
            ad_socket,
            self.shutdown_tx.subscribe(),
        ));
        tasks.spawn(linkstate::serve(
            self.links.clone(),
            link_socket,
            self.shutdown_tx.subscribe(),
        ));
        tasks.spawn(certstore::serve(
            self.certs.clone(),
            cert_socket,
            self.shutdown_tx.subscribe(),
        ));
        tasks.spawn(pathcomputer::serve(
            self.paths.clone(),
            path_socket,
            Duration::from_secs(self.config.rebuild_interval_secs),
            self.shutdown_tx.subscribe(),
        ));

        let shutdown_rx = self.shutdown_tx.subscribe();
        tasks.spawn(async move { probe.run(shutdown_rx).await });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                self.shutdown();
            }
            _ = shutdown_rx.recv() => {}
        }

        while tasks.join_next().await.is_some() {}
        let (trust, distrust) = self.certs.relation_count();
        info!(
            ads = self.ads.record_count(),
            trust,
            distrust,
            peers = self.peers.snapshot().len(),
            switches = self.links.live_switches().len(),
            "ribd stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_map_lookups() {
        let peers = PeerMap::new();
        assert!(!peers.contains_addr("10.0.1.1".parse().unwrap()));
        peers.insert(1, "10.0.1.1".parse().unwrap());
        assert!(peers.contains_addr("10.0.1.1".parse().unwrap()));
        assert_eq!(peers.snapshot().len(), 1);
    }
}
