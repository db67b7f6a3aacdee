//! Client state and datagram handling.
//!
//! The client keeps three small tables: the live switches of its own
//! TD (from `GIVESWITCHES`), the nearest of those switches (from the
//! client echo probes), and the routes it has been given (from
//! `GIVEPATH` replies). Injection picks the nearest switch when one
//! has been measured, otherwise the first known.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{debug, info};
use trustmesh_core::proto;
use trustmesh_core::types::{parse_td_tag, TdId};
use trustmesh_core::wire::{
    embed_send_time, read_send_time, Direction, OverlayDatagram,
};
use trustmesh_core::{CAPSULE_ECHO_PORT, CLIENT_REPLY_PORT};
use trustmesh_net::clock::micros_now;

/// One source route handed out by the path computer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub server: Ipv4Addr,
    pub hops: Vec<TdId>,
}

pub struct Client {
    name: String,
    addr: Ipv4Addr,
    payload_size: usize,
    switches: RwLock<Vec<Ipv4Addr>>,
    nearest: RwLock<Option<(Ipv4Addr, i64)>>,
    routes: RwLock<BTreeMap<Ipv4Addr, Vec<TdId>>>,
}

impl Client {
    pub fn new(name: String, addr: Ipv4Addr, payload_size: usize) -> Self {
        Self {
            name,
            addr,
            payload_size,
            switches: RwLock::new(Vec::new()),
            nearest: RwLock::new(None),
            routes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn install_switches(&self, switches: Vec<Ipv4Addr>) {
        let mut known = self.switches.write();
        for switch in switches {
            if !known.contains(&switch) {
                known.push(switch);
            }
        }
    }

    pub fn switches(&self) -> Vec<Ipv4Addr> {
        self.switches.read().clone()
    }

    /// Nearest probed switch, or the first known before probing has
    /// produced a measurement.
    pub fn chosen_switch(&self) -> Option<Ipv4Addr> {
        if let Some((switch, _)) = *self.nearest.read() {
            return Some(switch);
        }
        self.switches.read().first().copied()
    }

    /// Record one probe RTT; lower wins.
    pub fn observe_probe(&self, switch: Ipv4Addr, rtt: i64) {
        let mut nearest = self.nearest.write();
        match *nearest {
            Some((_, best)) if best <= rtt => {}
            _ => {
                info!(%switch, rtt_us = rtt, "nearest local switch updated");
                *nearest = Some((switch, rtt));
            }
        }
    }

    /// Digest one `GIVEPATH` reply. Empty replies are ignored; a
    /// usable one installs or refreshes a route.
    pub fn handle_path_reply(&self, raw: &str) -> Option<Route> {
        let elements = proto::parse_path_reply(raw)?;
        let (server_raw, tags) = elements.split_last()?;
        let server: Ipv4Addr = server_raw.parse().ok()?;
        let hops: Vec<TdId> = tags.iter().map(|t| parse_td_tag(t)).collect::<Option<_>>()?;
        if hops.is_empty() {
            return None;
        }

        let route = Route {
            server,
            hops: hops.clone(),
        };
        info!(%server, hops = route.hops.len(), "route installed");
        self.routes.write().insert(server, hops);
        Some(route)
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes
            .read()
            .iter()
            .map(|(server, hops)| Route {
                server: *server,
                hops: hops.clone(),
            })
            .collect()
    }

    /// Build one request datagram for a route, stamped with the
    /// current send time.
    pub fn build_request(&self, route: &Route) -> OverlayDatagram {
        let mut payload = vec![0u8; self.payload_size];
        embed_send_time(&mut payload, micros_now());
        OverlayDatagram {
            direction: Direction::Up,
            current_hop: 0,
            src: SocketAddrV4::new(self.addr, CLIENT_REPLY_PORT),
            dst: SocketAddrV4::new(route.server, CAPSULE_ECHO_PORT),
            hops: route.hops.clone(),
            payload,
        }
    }

    /// Digest one echoed reply; returns (rtt_us, hop_count).
    pub fn handle_reply(&self, raw: &[u8]) -> Option<(i64, u32)> {
        let dgram = match OverlayDatagram::decode(raw) {
            Ok(dgram) => dgram,
            Err(err) => {
                debug!(%err, "dropping malformed reply");
                return None;
            }
        };
        if dgram.direction != Direction::Down {
            return None;
        }
        let sent = read_send_time(&dgram.payload)?;
        let rtt = micros_now() - sent;
        info!(rtt_us = rtt, hops = dgram.hop_count(), "reply received");
        Some((rtt, dgram.hop_count()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::new("user:alice".into(), "9.1.0.2".parse().unwrap(), 64)
    }

    #[test]
    fn path_reply_installs_route() {
        let c = client();
        let route = c.handle_path_reply("path:AS0,AS1,AS2,11.0.0.2,").unwrap();
        assert_eq!(route.server, "11.0.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(route.hops, vec![0, 1, 2]);
        assert_eq!(c.routes().len(), 1);
    }

    #[test]
    fn empty_path_reply_is_ignored() {
        let c = client();
        assert!(c.handle_path_reply("path:,").is_none());
        assert!(c.routes().is_empty());
    }

    #[test]
    fn malformed_path_reply_is_ignored() {
        let c = client();
        assert!(c.handle_path_reply("path:AS0,notanip,").is_none());
        assert!(c.handle_path_reply("switches: 1 2 3").is_none());
        // A reply with no TD tags cannot be routed.
        assert!(c.handle_path_reply("path:11.0.0.2,").is_none());
    }

    #[test]
    fn refreshed_route_replaces_old_hops() {
        let c = client();
        c.handle_path_reply("path:AS0,AS1,AS2,11.0.0.2,").unwrap();
        c.handle_path_reply("path:AS0,AS2,11.0.0.2,").unwrap();
        let routes = c.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].hops, vec![0, 2]);
    }

    #[test]
    fn chosen_switch_prefers_probed_nearest() {
        let c = client();
        c.install_switches(vec!["8.0.0.2".parse().unwrap(), "8.0.0.3".parse().unwrap()]);
        assert_eq!(c.chosen_switch(), Some("8.0.0.2".parse().unwrap()));

        // 8.0.0.3 answers faster.
        c.observe_probe("8.0.0.2".parse().unwrap(), 5_000);
        c.observe_probe("8.0.0.3".parse().unwrap(), 1_000);
        assert_eq!(c.chosen_switch(), Some("8.0.0.3".parse().unwrap()));

        // A slower later measurement does not displace it.
        c.observe_probe("8.0.0.2".parse().unwrap(), 3_000);
        assert_eq!(c.chosen_switch(), Some("8.0.0.3".parse().unwrap()));
    }

    #[test]
    fn request_reply_roundtrip_measures_rtt() {
        let c = client();
        let route = Route {
            server: "11.0.0.2".parse().unwrap(),
            hops: vec![0, 1, 2],
        };
        let request = c.build_request(&route);
        assert_eq!(request.direction, Direction::Up);
        assert_eq!(request.current_hop, 0);
        assert_eq!(request.src.port(), CLIENT_REPLY_PORT);
        assert_eq!(request.dst.port(), CAPSULE_ECHO_PORT);

        // Echo it as the capsule server would.
        let mut reply = request.clone();
        reply.direction = Direction::Down;
        reply.current_hop = 2;
        let (rtt, hops) = c.handle_reply(&reply.encode()).unwrap();
        assert!(rtt >= 0);
        assert_eq!(hops, 3);
    }

    #[test]
    fn up_direction_reply_is_ignored() {
        let c = client();
        let route = Route {
            server: "11.0.0.2".parse().unwrap(),
            hops: vec![0],
        };
        let request = c.build_request(&route);
        assert!(c.handle_reply(&request.encode()).is_none());
        assert!(c.handle_reply(b"short").is_none());
    }

    #[test]
    fn duplicate_switches_not_installed_twice() {
        let c = client();
        c.install_switches(vec!["8.0.0.2".parse().unwrap()]);
        c.install_switches(vec!["8.0.0.2".parse().unwrap(), "8.0.0.3".parse().unwrap()]);
        assert_eq!(c.switches().len(), 2);
    }
}
