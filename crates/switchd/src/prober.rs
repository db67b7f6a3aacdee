//! Neighbour RTT prober.
//!
//! Periodically echoes against every known overlay switch in every
//! peer TD and remembers, per TD, whichever switch answered fastest.
//! The same port answers incoming echo requests, both the
//! switch-to-switch pair and the client variant, with the timestamp
//! echoed byte-exact so only the sender's clock is ever compared.

use crate::engine::ForwardingEngine;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info};
use trustmesh_core::proto::{
    decode_echo_request, decode_echo_response, encode_echo_request, encode_echo_response,
    EchoScope,
};
use trustmesh_core::{TdId, CLIENT_PROBER_PORT, SWITCH_PROBER_PORT};
use trustmesh_net::clock::micros_now;
use trustmesh_net::udp;

pub struct NeighborProber {
    td: TdId,
    engine: Arc<ForwardingEngine>,
    nearest: RwLock<HashMap<TdId, (Ipv4Addr, i64)>>,
}

impl NeighborProber {
    pub fn new(td: TdId, engine: Arc<ForwardingEngine>) -> Self {
        Self {
            td,
            engine,
            nearest: RwLock::new(HashMap::new()),
        }
    }

    /// The fastest-answering switch seen so far in a peer TD.
    pub fn nearest_in(&self, td: TdId) -> Option<Ipv4Addr> {
        self.nearest.read().get(&td).map(|(addr, _)| *addr)
    }

    pub fn nearest_snapshot(&self) -> HashMap<TdId, (Ipv4Addr, i64)> {
        self.nearest.read().clone()
    }

    /// One datagram in, at most one reply out (reply, destination).
    pub fn handle(&self, raw: &[u8], from: SocketAddr) -> Option<(Vec<u8>, SocketAddr)> {
        let SocketAddr::V4(from) = from else {
            return None;
        };

        if let Some((scope, send_us)) = decode_echo_request(raw) {
            let reply = encode_echo_response(scope, send_us, self.td);
            let port = match scope {
                EchoScope::Switch => SWITCH_PROBER_PORT,
                EchoScope::Client => CLIENT_PROBER_PORT,
            };
            return Some((reply, udp::dest(*from.ip(), port)));
        }

        if let Some((EchoScope::Switch, send_us, peer_td)) = decode_echo_response(raw) {
            let rtt = micros_now() - send_us;
            self.observe(peer_td, *from.ip(), rtt);
        }
        None
    }

    /// Keep the lowest RTT per peer TD.
    fn observe(&self, peer_td: TdId, switch: Ipv4Addr, rtt: i64) {
        let mut nearest = self.nearest.write();
        match nearest.get(&peer_td) {
            Some((_, best)) if *best <= rtt => {}
            _ => {
                info!(peer_td, %switch, rtt_us = rtt, "nearest peer switch updated");
                nearest.insert(peer_td, (switch, rtt));
            }
        }
    }

    /// Fire one echo request at every known switch in every peer TD.
    async fn probe_round(&self, socket: &UdpSocket) {
        let targets = self.engine.peer_switches();
        debug!(td = self.td, tds = targets.len(), "neighbour probe round");
        for (_, switches) in targets {
            for switch in switches {
                let request = encode_echo_request(EchoScope::Switch, micros_now());
                if let Err(err) = socket
                    .send_to(&request, udp::dest(switch, SWITCH_PROBER_PORT))
                    .await
                {
                    debug!(%switch, %err, "echo request failed");
                }
            }
        }
    }
}

pub async fn serve(
    prober: Arc<NeighborProber>,
    socket: UdpSocket,
    first_delay: Duration,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let start = tokio::time::Instant::now() + first_delay;
    let mut ticker = tokio::time::interval_at(start, interval);
    let mut buf = vec![0u8; udp::MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = ticker.tick() => prober.probe_round(&socket).await,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        if let Some((reply, dest)) = prober.handle(&buf[..len], from) {
                            if let Err(err) = socket.send_to(&reply, dest).await {
                                debug!(%dest, %err, "echo reply failed");
                            }
                        }
                    }
                    Err(err) => debug!(%err, "prober recv error"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prober() -> NeighborProber {
        let engine = Arc::new(ForwardingEngine::new(
            1,
            "8.0.1.2".parse().unwrap(),
            "10.0.1.1".parse().unwrap(),
        ));
        NeighborProber::new(1, engine)
    }

    fn from(ip: &str) -> SocketAddr {
        format!("{ip}:3009").parse().unwrap()
    }

    #[test]
    fn answers_switch_echo_requests() {
        let prober = prober();
        let request = encode_echo_request(EchoScope::Switch, 777);
        let (reply, dest) = prober.handle(&request, from("8.0.2.2")).unwrap();
        assert_eq!(dest, "8.0.2.2:3009".parse().unwrap());
        assert_eq!(
            decode_echo_response(&reply),
            Some((EchoScope::Switch, 777, 1))
        );
    }

    #[test]
    fn answers_client_echo_requests_on_client_port() {
        let prober = prober();
        let request = encode_echo_request(EchoScope::Client, 12);
        let (reply, dest) = prober.handle(&request, from("9.1.0.2")).unwrap();
        assert_eq!(dest, "9.1.0.2:3010".parse().unwrap());
        assert_eq!(
            decode_echo_response(&reply),
            Some((EchoScope::Client, 12, 1))
        );
    }

    #[test]
    fn keeps_lowest_rtt_per_td() {
        let prober = prober();
        prober.observe(2, "8.0.2.2".parse().unwrap(), 5_000);
        prober.observe(2, "8.0.2.3".parse().unwrap(), 1_000);
        prober.observe(2, "8.0.2.4".parse().unwrap(), 9_000);
        assert_eq!(prober.nearest_in(2), Some("8.0.2.3".parse().unwrap()));
        assert_eq!(prober.nearest_snapshot().len(), 1);
    }

    #[test]
    fn responses_update_via_handle() {
        let prober = prober();
        // A response whose timestamp is in the past yields a positive
        // RTT and installs the sender.
        let response = encode_echo_response(EchoScope::Switch, micros_now() - 2_000, 2);
        assert!(prober.handle(&response, from("8.0.2.2")).is_none());
        assert_eq!(prober.nearest_in(2), Some("8.0.2.2".parse().unwrap()));
    }

    #[test]
    fn unidentified_payload_ignored() {
        let prober = prober();
        assert!(prober.handle(b"GIVESWITCHES", from("8.0.2.2")).is_none());
        assert!(prober.nearest_snapshot().is_empty());
    }

    #[test]
    fn client_responses_do_not_pollute_peer_table() {
        let prober = prober();
        let response = encode_echo_response(EchoScope::Client, micros_now(), 2);
        prober.handle(&response, from("8.0.2.2"));
        assert!(prober.nearest_snapshot().is_empty());
    }
}
