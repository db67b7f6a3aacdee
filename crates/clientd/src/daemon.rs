//! Client daemon tasks.
//!
//! Startup order mirrors the fabric's dependencies: learn the local
//! switches, pledge trust to the home RIB, then keep asking for paths
//! and injecting along whatever routes come back. Every exchange is
//! fire-and-forget over UDP; the periodic cadences are the only retry
//! mechanism.

use crate::client::Client;
use crate::config::Config;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use trustmesh_core::proto::{
    self, decode_echo_response, encode_echo_request, EchoScope, PathQuery,
};
use trustmesh_core::topology::{Topology, TopologyError};
use trustmesh_core::types::CertSubmission;
use trustmesh_core::{
    ADSTORE_PORT, CERTSTORE_PORT, CLIENT_PROBER_PORT, CLIENT_REPLY_PORT, OVERLAY_FWD_PORT,
    PATHCOMPUTER_PORT, SWITCH_PROBER_PORT,
};
use trustmesh_net::clock::micros_now;
use trustmesh_net::udp;

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),
    #[error("TD {0} has no RIB in the topology")]
    UnknownTd(u32),
}

pub struct ClientDaemon {
    config: Config,
    rib: Ipv4Addr,
    client: Arc<Client>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ClientDaemon {
    pub fn new(config: Config) -> Result<Self, ClientError> {
        let topology = Topology::load(&config.topology)?;
        let rib = topology
            .rib_of(config.td)
            .ok_or(ClientError::UnknownTd(config.td))?;
        let client = Arc::new(Client::new(
            config.name.clone(),
            config.addr,
            config.payload_size,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            rib,
            client,
            shutdown_tx,
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Ask the home RIB for local switches until it answers.
    async fn bootstrap_switches(
        client: Arc<Client>,
        addr: Ipv4Addr,
        rib: Ipv4Addr,
        mut shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<()> {
        let socket = udp::bind_ephemeral(addr)?;
        let mut buf = vec![0u8; udp::MAX_DATAGRAM];
        loop {
            socket
                .send_to(proto::GIVESWITCHES.as_bytes(), udp::dest(rib, ADSTORE_PORT))
                .await?;
            let attempt = tokio::time::timeout(BOOTSTRAP_TIMEOUT, socket.recv_from(&mut buf));
            tokio::select! {
                result = attempt => {
                    if let Ok(Ok((len, _))) = result {
                        let switches =
                            proto::parse_switch_list(&String::from_utf8_lossy(&buf[..len]));
                        if !switches.is_empty() {
                            info!(count = switches.len(), "local switches learned");
                            client.install_switches(switches);
                            return Ok(());
                        }
                    }
                }
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }

    /// One-shot: pledge trust in the home RIB, then file any
    /// configured distrust assertions.
    async fn pledge(
        name: String,
        addr: Ipv4Addr,
        rib: Ipv4Addr,
        distrusts: Vec<String>,
    ) -> std::io::Result<()> {
        let socket = udp::bind_ephemeral(addr)?;
        let dest = udp::dest(rib, CERTSTORE_PORT);

        let pledge = CertSubmission::trust(name.clone(), rib.to_string());
        socket.send_to(pledge.to_json().as_bytes(), dest).await?;
        info!(%rib, "pledged trust to home RIB");

        for entity in distrusts {
            let cert = CertSubmission::distrust(name.clone(), entity.clone());
            socket.send_to(cert.to_json().as_bytes(), dest).await?;
            info!(entity, "distrust filed");
        }
        Ok(())
    }

    /// Request a path for every configured capsule name each round and
    /// digest whatever replies arrive.
    async fn path_loop(
        client: Arc<Client>,
        config: Config,
        rib: Ipv4Addr,
        mut shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<()> {
        let socket = udp::bind_ephemeral(config.addr)?;
        let dest = udp::dest(rib, PATHCOMPUTER_PORT);
        let mut ticker = tokio::time::interval(Duration::from_secs(config.path_interval_secs));
        let mut buf = vec![0u8; udp::MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for dc_name in &config.dc_names {
                        let query = PathQuery {
                            client_name: config.name.clone(),
                            dc_name: dc_name.clone(),
                        };
                        if let Err(err) = socket.send_to(query.to_request().as_bytes(), dest).await {
                            debug!(%err, "path request failed");
                        }
                    }
                }
                result = socket.recv_from(&mut buf) => {
                    if let Ok((len, _)) = result {
                        let raw = String::from_utf8_lossy(&buf[..len]);
                        if client.handle_path_reply(&raw).is_none() {
                            debug!("path reply ignored");
                        }
                    }
                }
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }

    /// Inject one request per route per tick through the nearest local
    /// switch.
    async fn inject_loop(
        client: Arc<Client>,
        config: Config,
        mut shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<()> {
        let socket = udp::bind_ephemeral(config.addr)?;
        let mut ticker = tokio::time::interval(Duration::from_secs(config.send_interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(switch) = client.chosen_switch() else {
                        continue;
                    };
                    for route in client.routes() {
                        let dgram = client.build_request(&route);
                        let dest = udp::dest(switch, OVERLAY_FWD_PORT);
                        if let Err(err) = socket.send_to(&dgram.encode(), dest).await {
                            debug!(%dest, %err, "injection failed");
                        } else {
                            debug!(server = %route.server, %switch, "request injected");
                        }
                    }
                }
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }

    /// Sink for echoed replies on the client reply port.
    async fn reply_loop(
        client: Arc<Client>,
        addr: Ipv4Addr,
        mut shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<()> {
        let socket = udp::bind(addr, CLIENT_REPLY_PORT)?;
        let mut buf = vec![0u8; udp::MAX_DATAGRAM];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    if let Ok((len, _)) = result {
                        client.handle_reply(&buf[..len]);
                    }
                }
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }

    /// Probe the local switches for RTT and keep the nearest.
    async fn probe_loop(
        client: Arc<Client>,
        config: Config,
        mut shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<()> {
        let socket = udp::bind(config.addr, CLIENT_PROBER_PORT)?;
        let start =
            tokio::time::Instant::now() + Duration::from_secs(config.probe_first_delay_secs);
        let mut ticker =
            tokio::time::interval_at(start, Duration::from_secs(config.probe_interval_secs));
        let mut buf = vec![0u8; udp::MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for switch in client.switches() {
                        let request = encode_echo_request(EchoScope::Client, micros_now());
                        let dest = udp::dest(switch, SWITCH_PROBER_PORT);
                        if let Err(err) = socket.send_to(&request, dest).await {
                            debug!(%dest, %err, "client probe failed");
                        }
                    }
                }
                result = socket.recv_from(&mut buf) => {
                    if let Ok((len, from)) = result {
                        if let Some((EchoScope::Client, sent, _td)) =
                            decode_echo_response(&buf[..len])
                        {
                            if let std::net::SocketAddr::V4(from) = from {
                                client.observe_probe(*from.ip(), micros_now() - sent);
                            }
                        }
                    }
                }
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }

    pub async fn run(&self) -> Result<(), ClientError> {
        info!(
            name = %self.config.name,
            addr = %self.config.addr,
            rib = %self.rib,
            targets = self.config.dc_names.len(),
            "starting clientd"
        );

        let mut tasks = tokio::task::JoinSet::new();

        let client = self.client.clone();
        let addr = self.config.addr;
        let rib = self.rib;
        let shutdown = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(err) = Self::bootstrap_switches(client, addr, rib, shutdown).await {
                warn!(%err, "switch bootstrap task failed");
            }
        });

        let name = self.config.name.clone();
        let distrusts = self.config.distrusts.clone();
        let rib = self.rib;
        tasks.spawn(async move {
            if let Err(err) = Self::pledge(name, addr, rib, distrusts).await {
                warn!(%err, "pledge task failed");
            }
        });

        let client = self.client.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(err) = Self::path_loop(client, config, rib, shutdown).await {
                warn!(%err, "path task failed");
            }
        });

        let client = self.client.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(err) = Self::inject_loop(client, config, shutdown).await {
                warn!(%err, "inject task failed");
            }
        });

        let client = self.client.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(err) = Self::reply_loop(client, addr, shutdown).await {
                warn!(%err, "reply task failed");
            }
        });

        let client = self.client.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(err) = Self::probe_loop(client, config, shutdown).await {
                warn!(%err, "probe task failed");
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
        info!(routes = self.client.routes().len(), "clientd stopped");
        Ok(())
    }
}
