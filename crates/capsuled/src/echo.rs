//! Datagram echo service.
//!
//! A delivered UP datagram is turned around in place: the magic flips
//! to DOWN, the current hop resets to the last element of the hop
//! vector, and the packet goes to a local overlay switch which walks
//! it back to the originator. Until the server has learned a local
//! switch from its RIB it drops everything.

use parking_lot::RwLock;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info};
use trustmesh_core::wire::{Direction, OverlayDatagram};
use trustmesh_core::{proto, ADSTORE_PORT, OVERLAY_FWD_PORT};
use trustmesh_net::udp;

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EchoServer {
    addr: Ipv4Addr,
    rib: Ipv4Addr,
    switches: RwLock<Vec<Ipv4Addr>>,
}

impl EchoServer {
    pub fn new(addr: Ipv4Addr, rib: Ipv4Addr) -> Self {
        Self {
            addr,
            rib,
            switches: RwLock::new(Vec::new()),
        }
    }

    pub fn local_switch(&self) -> Option<Ipv4Addr> {
        self.switches.read().first().copied()
    }

    pub fn install_switches(&self, switches: Vec<Ipv4Addr>) {
        if !switches.is_empty() {
            *self.switches.write() = switches;
        }
    }

    /// Turn one delivered datagram into its reply, or drop it.
    pub fn echo(&self, raw: &[u8]) -> Option<(SocketAddr, Vec<u8>)> {
        let switch = match self.local_switch() {
            Some(switch) => switch,
            None => {
                debug!("datagram arrived before a local switch is known, dropping");
                return None;
            }
        };

        let mut dgram = match OverlayDatagram::decode(raw) {
            Ok(dgram) => dgram,
            Err(err) => {
                debug!(%err, "dropping malformed datagram");
                return None;
            }
        };
        if dgram.direction != Direction::Up {
            debug!("non-request datagram at echo port, dropping");
            return None;
        }

        dgram.direction = Direction::Down;
        dgram.current_hop = dgram.hop_count().saturating_sub(1);
        Some((udp::dest(switch, OVERLAY_FWD_PORT), dgram.encode()))
    }

    /// Ask the home RIB for local switches until it answers with a
    /// non-empty set.
    pub async fn bootstrap(&self, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
        let socket = udp::bind_ephemeral(self.addr)?;
        let mut buf = vec![0u8; udp::MAX_DATAGRAM];

        loop {
            socket
                .send_to(
                    proto::GIVESWITCHES.as_bytes(),
                    udp::dest(self.rib, ADSTORE_PORT),
                )
                .await?;

            let attempt = tokio::time::timeout(BOOTSTRAP_TIMEOUT, socket.recv_from(&mut buf));
            tokio::select! {
                result = attempt => {
                    if let Ok(Ok((len, _))) = result {
                        let switches =
                            proto::parse_switch_list(&String::from_utf8_lossy(&buf[..len]));
                        if !switches.is_empty() {
                            info!(count = switches.len(), "local switches learned");
                            self.install_switches(switches);
                            return Ok(());
                        }
                    }
                }
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }
}

pub async fn serve(
    server: std::sync::Arc<EchoServer>,
    socket: UdpSocket,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let reply_socket = udp::bind_ephemeral(server.addr)?;
    let mut buf = vec![0u8; udp::MAX_DATAGRAM];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        if let Some((dest, reply)) = server.echo(&buf[..len]) {
                            debug!(%from, %dest, "echoing datagram");
                            if let Err(err) = reply_socket.send_to(&reply, dest).await {
                                debug!(%dest, %err, "echo send failed");
                            }
                        }
                    }
                    Err(err) => debug!(%err, "echo recv error"),
                }
            }
            _ = shutdown.recv() => return Ok(()),
        }
    }
}
