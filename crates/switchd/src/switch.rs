//! Overlay switch aggregate.

use crate::config::Config;
use crate::engine::{self, ForwardingEngine};
use crate::pinger;
use crate::prober::{self, NeighborProber};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};
use trustmesh_core::topology::{Topology, TopologyError};
use trustmesh_core::{OVERLAY_FWD_PORT, SWITCH_PROBER_PORT};
use trustmesh_net::udp;

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),
    #[error("TD {0} has no RIB in the topology")]
    UnknownTd(u32),
}

pub struct OverlaySwitch {
    config: Config,
    rib: Ipv4Addr,
    engine: Arc<ForwardingEngine>,
    prober: Arc<NeighborProber>,
    shutdown_tx: broadcast::Sender<()>,
}

impl OverlaySwitch {
    pub fn new(config: Config) -> Result<Self, SwitchError> {
        let topology = Topology::load(&config.topology)?;
        let rib = topology
            .rib_of(config.td)
            .ok_or(SwitchError::UnknownTd(config.td))?;

        let engine = Arc::new(ForwardingEngine::new(config.td, config.addr, rib));
        let prober = Arc::new(NeighborProber::new(config.td, engine.clone()));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            rib,
            engine,
            prober,
            shutdown_tx,
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn run(&self) -> Result<(), SwitchError> {
        info!(td = self.config.td, addr = %self.config.addr, rib = %self.rib, "starting switchd");

        let fwd_socket = udp::bind(self.config.addr, OVERLAY_FWD_PORT)?;
        let prober_socket = udp::bind(self.config.addr, SWITCH_PROBER_PORT)?;

        let mut tasks = tokio::task::JoinSet::new();
        tasks.spawn(engine::serve(
            self.engine.clone(),
            fwd_socket,
            self.shutdown_tx.subscribe(),
        ));
        tasks.spawn(prober::serve(
            self.prober.clone(),
            prober_socket,
            Duration::from_secs(self.config.probe_first_delay_secs),
            Duration::from_secs(self.config.probe_interval_secs),
            self.shutdown_tx.subscribe(),
        ));

        let engine = self.engine.clone();
        let settle = Duration::from_secs(self.config.peer_calc_delay_secs);
        let refresh = Duration::from_secs(self.config.refresh_interval_secs);
        let shutdown_rx = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(err) = engine.run_bootstrap(settle, refresh, shutdown_rx).await {
                warn!(%err, "bootstrap task failed");
            }
        });

        let addr = self.config.addr;
        let rib = self.rib;
        let ping_interval = Duration::from_secs(self.config.ping_interval_secs);
        let shutdown_rx = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(err) = pinger::run(addr, rib, ping_interval, shutdown_rx).await {
                warn!(%err, "pinger task failed");
            }
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                self.shutdown();
            }
            _ = shutdown_rx.recv() => {}
        }

        while tasks.join_next().await.is_some() {}
        info!(
            peers = self.engine.peer_ribs().len(),
            nearest = self.prober.nearest_snapshot().len(),
            "switchd stopped"
        );
        Ok(())
    }
}
