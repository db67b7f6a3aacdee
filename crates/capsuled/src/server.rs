//! Capsule server aggregate.

use crate::advertiser;
use crate::config::Config;
use crate::echo::{self, EchoServer};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};
use trustmesh_core::topology::{Topology, TopologyError};
use trustmesh_core::CAPSULE_ECHO_PORT;
use trustmesh_net::udp;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),
    #[error("TD {0} has no RIB in the topology")]
    UnknownTd(u32),
}

pub struct CapsuleServer {
    config: Config,
    rib: Ipv4Addr,
    echo: Arc<EchoServer>,
    shutdown_tx: broadcast::Sender<()>,
}

impl CapsuleServer {
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let topology = Topology::load(&config.topology)?;
        let rib = topology
            .rib_of(config.td)
            .ok_or(ServerError::UnknownTd(config.td))?;
        let echo = Arc::new(EchoServer::new(config.addr, rib));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            rib,
            echo,
            shutdown_tx,
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn run(&self) -> Result<(), ServerError> {
        info!(
            addr = %self.config.addr,
            rib = %self.rib,
            names = self.config.names.len(),
            "starting capsuled"
        );

        let echo_socket = udp::bind(self.config.addr, CAPSULE_ECHO_PORT)?;

        let mut tasks = tokio::task::JoinSet::new();

        let echo = self.echo.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(err) = echo.bootstrap(shutdown_rx).await {
                warn!(%err, "switch bootstrap failed");
            }
        });

        let echo = self.echo.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(err) = echo::serve(echo, echo_socket, shutdown_rx).await {
                warn!(%err, "echo task failed");
            }
        });

        let names = self.config.names.clone();
        let addr = self.config.addr;
        let rib = self.rib;
        let interval = Duration::from_secs(self.config.advertise_interval_secs);
        let shutdown_rx = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(err) = advertiser::run(names, addr, rib, interval, shutdown_rx).await {
                warn!(%err, "advertiser task failed");
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
        info!("capsuled stopped");
        Ok(())
    }
}
