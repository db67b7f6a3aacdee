//! Source-routed forwarding engine.
//!
//! On arrival a datagram is validated against the hop vector: an UP
//! datagram must name this TD at its current hop and advances toward
//! last-mile delivery at the destination; a DOWN datagram walks the
//! same vector backwards toward the originator. Anything that fails
//! validation is dropped without reply.
//!
//! Next-hop switches in peer TDs are learned at startup: after a
//! settling delay the engine asks its own RIB `GIVEPEERS`, then asks
//! every peer RIB `GIVESWITCHES`, retrying each stage on timeout, and
//! repeats the whole exchange on a fixed cadence to pick up peers the
//! trace probe finds later.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use trustmesh_core::wire::{to_socket_addr, Direction, OverlayDatagram};
use trustmesh_core::{proto, TdId, ADSTORE_PORT, LINKSTATE_PORT, OVERLAY_FWD_PORT};
use trustmesh_net::udp;

/// How long to wait on each bootstrap reply before retrying.
const STAGE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ForwardingEngine {
    td: TdId,
    addr: Ipv4Addr,
    rib: Ipv4Addr,
    peer_ribs: RwLock<BTreeMap<TdId, Ipv4Addr>>,
    peer_switches: RwLock<BTreeMap<TdId, Vec<Ipv4Addr>>>,
    /// Round-robin cursor per destination TD.
    cursors: Mutex<HashMap<TdId, usize>>,
    /// Connected sockets cached by destination so per-packet setup is
    /// amortised.
    send_cache: Mutex<HashMap<SocketAddr, Arc<UdpSocket>>>,
}

impl ForwardingEngine {
    pub fn new(td: TdId, addr: Ipv4Addr, rib: Ipv4Addr) -> Self {
        Self {
            td,
            addr,
            rib,
            peer_ribs: RwLock::new(BTreeMap::new()),
            peer_switches: RwLock::new(BTreeMap::new()),
            cursors: Mutex::new(HashMap::new()),
            send_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn peer_ribs(&self) -> BTreeMap<TdId, Ipv4Addr> {
        self.peer_ribs.read().clone()
    }

    pub fn peer_switches(&self) -> BTreeMap<TdId, Vec<Ipv4Addr>> {
        self.peer_switches.read().clone()
    }

    pub fn apply_peers(&self, peers: BTreeMap<TdId, Ipv4Addr>) {
        self.peer_ribs.write().extend(peers);
    }

    pub fn apply_switches(&self, td: TdId, switches: Vec<Ipv4Addr>) {
        let mut cache = self.peer_switches.write();
        let entry = cache.entry(td).or_default();
        for switch in switches {
            if !entry.contains(&switch) {
                entry.push(switch);
            }
        }
    }

    /// Validate one datagram and decide where it goes next. `None`
    /// means drop.
    pub fn route(&self, mut dgram: OverlayDatagram) -> Option<(SocketAddr, OverlayDatagram)> {
        match dgram.direction {
            Direction::Up => {
                // A zero-hop vector is delivered by whichever switch
                // sees it first.
                if dgram.hops.is_empty() {
                    return Some((to_socket_addr(dgram.dst), dgram));
                }
                if dgram.current_hop >= dgram.hop_count() {
                    return None;
                }
                if dgram.hops[dgram.current_hop as usize] != self.td {
                    debug!(td = self.td, hop = dgram.current_hop, "hop vector mismatch, dropping");
                    return None;
                }
                dgram.current_hop += 1;
                if dgram.current_hop == dgram.hop_count() {
                    return Some((to_socket_addr(dgram.dst), dgram));
                }
                let next_td = dgram.hops[dgram.current_hop as usize];
                let switch = self.pick_switch(next_td)?;
                Some((udp::dest(switch, OVERLAY_FWD_PORT), dgram))
            }
            Direction::Down => {
                let index = dgram.current_hop as usize;
                if index >= dgram.hops.len() {
                    if dgram.hops.is_empty() {
                        return Some((to_socket_addr(dgram.src), dgram));
                    }
                    return None;
                }
                if dgram.hops[index] != self.td {
                    debug!(td = self.td, hop = dgram.current_hop, "hop vector mismatch, dropping");
                    return None;
                }
                if dgram.current_hop == 0 {
                    return Some((to_socket_addr(dgram.src), dgram));
                }
                dgram.current_hop -= 1;
                let next_td = dgram.hops[dgram.current_hop as usize];
                let switch = self.pick_switch(next_td)?;
                Some((udp::dest(switch, OVERLAY_FWD_PORT), dgram))
            }
        }
    }

    /// Round-robin over the known switches of a TD.
    fn pick_switch(&self, td: TdId) -> Option<Ipv4Addr> {
        let switches = self.peer_switches.read();
        let candidates = switches.get(&td)?;
        if candidates.is_empty() {
            debug!(next_td = td, "no switch known for next hop, dropping");
            return None;
        }
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(td).or_insert(0);
        let pick = candidates[*cursor % candidates.len()];
        *cursor = cursor.wrapping_add(1);
        Some(pick)
    }

    /// Send through the per-destination socket cache.
    pub async fn send(&self, dest: SocketAddr, payload: &[u8]) -> io::Result<()> {
        let socket = {
            let mut cache = self.send_cache.lock();
            match cache.get(&dest) {
                Some(socket) => socket.clone(),
                None => {
                    let socket = Arc::new(udp::bind_ephemeral(self.addr)?);
                    cache.insert(dest, socket.clone());
                    socket
                }
            }
        };
        socket.send_to(payload, dest).await?;
        Ok(())
    }

    /// One full peer-and-switch refresh against the control plane.
    async fn refresh(&self, socket: &UdpSocket) -> io::Result<()> {
        let mut buf = vec![0u8; udp::MAX_DATAGRAM];

        socket
            .send_to(proto::GIVEPEERS.as_bytes(), udp::dest(self.rib, LINKSTATE_PORT))
            .await?;
        let peers = match tokio::time::timeout(STAGE_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => proto::parse_peer_lines(&String::from_utf8_lossy(&buf[..len])),
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                warn!(rib = %self.rib, "GIVEPEERS timed out");
                return Ok(());
            }
        };
        debug!(td = self.td, peers = peers.len(), "peer table received");
        self.apply_peers(peers.clone());

        if peers.is_empty() {
            return Ok(());
        }
        for peer_rib in peers.values() {
            socket
                .send_to(
                    proto::GIVESWITCHES.as_bytes(),
                    udp::dest(*peer_rib, ADSTORE_PORT),
                )
                .await?;
        }

        // Replies arrive in any order; attribute each to its peer TD
        // by source address.
        let mut outstanding = peers.len();
        while outstanding > 0 {
            match tokio::time::timeout(STAGE_TIMEOUT, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => {
                    let SocketAddr::V4(from) = from else { continue };
                    let Some((&peer_td, _)) =
                        peers.iter().find(|(_, rib)| **rib == *from.ip())
                    else {
                        debug!(from = %from.ip(), "switch list from unknown peer, ignoring");
                        continue;
                    };
                    let switches = proto::parse_switch_list(&String::from_utf8_lossy(&buf[..len]));
                    debug!(peer_td, count = switches.len(), "peer switches received");
                    self.apply_switches(peer_td, switches);
                    outstanding -= 1;
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    warn!(outstanding, "GIVESWITCHES replies timed out");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Bootstrap after the settling delay, then keep the caches fresh.
    pub async fn run_bootstrap(
        &self,
        settle_delay: Duration,
        refresh_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> io::Result<()> {
        let socket = udp::bind_ephemeral(self.addr)?;

        tokio::select! {
            _ = tokio::time::sleep(settle_delay) => {}
            _ = shutdown.recv() => return Ok(()),
        }

        loop {
            if let Err(err) = self.refresh(&socket).await {
                warn!(%err, "bootstrap refresh failed");
            } else {
                info!(
                    td = self.td,
                    peers = self.peer_ribs.read().len(),
                    tds_with_switches = self.peer_switches.read().len(),
                    "peer-switch cache refreshed"
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(refresh_interval) => {}
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }
}

/// Receive loop for the overlay forwarding port.
pub async fn serve(
    engine: Arc<ForwardingEngine>,
    socket: UdpSocket,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; udp::MAX_DATAGRAM];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        let dgram = match OverlayDatagram::decode(&buf[..len]) {
                            Ok(dgram) => dgram,
                            Err(err) => {
                                debug!(%from, %err, "dropping malformed datagram");
                                continue;
                            }
                        };
                        if let Some((dest, dgram)) = engine.route(dgram) {
                            if let Err(err) = engine.send(dest, &dgram.encode()).await {
                                debug!(%dest, %err, "forward failed");
                            }
                        }
                    }
                    Err(err) => debug!(%err, "forwarding recv error"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
