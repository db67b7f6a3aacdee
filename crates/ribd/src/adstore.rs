//! Advertisement store and flooding engine.
//!
//! Three kinds of datagram arrive on the ad store port: the
//! `GIVESWITCHES` query, the `GIVEADS <name>` query, and everything
//! else, which is parsed as an advertisement JSON and run through the
//! flooding pipeline:
//!
//! 1. loop suppression (our address already on the path)
//! 2. relay check (transit ads must come from a known peer)
//! 3. origin endorsement (we only originate names our owner signed for)
//! 4. monotonic cache update (strictly shorter paths win)
//! 5. trust ingestion from the carried certificates and path adjacency
//! 6. jittered flood to every peer except the origin and the sender

use crate::certstore::CertStore;
use crate::linkstate::LinkStateManager;
use crate::rib::PeerMap;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use trustmesh_core::topology::Topology;
use trustmesh_core::types::{td_tag, NameRecord, TdId, Transitivity, TrustCert};
use trustmesh_core::{proto, ADSTORE_PORT};

/// Upper bound on the random flood delay, decorrelating the storms
/// that a burst of advertisements would otherwise cause.
const FLOOD_JITTER_MAX: Duration = Duration::from_secs(10);

/// A datagram this store wants sent, possibly after a delay.
#[derive(Clone, Debug, PartialEq)]
pub struct Outbound {
    pub dest: SocketAddr,
    pub delay: Duration,
    pub payload: Vec<u8>,
}

impl Outbound {
    fn reply(dest: SocketAddr, payload: Vec<u8>) -> Self {
        Self {
            dest,
            delay: Duration::ZERO,
            payload,
        }
    }
}

pub struct AdStore {
    td: TdId,
    addr: Ipv4Addr,
    topology: Arc<Topology>,
    db: RwLock<HashMap<String, Vec<NameRecord>>>,
    certs: Arc<CertStore>,
    links: Arc<LinkStateManager>,
    peers: Arc<PeerMap>,
}

impl AdStore {
    pub fn new(
        td: TdId,
        addr: Ipv4Addr,
        topology: Arc<Topology>,
        certs: Arc<CertStore>,
        links: Arc<LinkStateManager>,
        peers: Arc<PeerMap>,
    ) -> Self {
        Self {
            td,
            addr,
            topology,
            db: RwLock::new(HashMap::new()),
            certs,
            links,
            peers,
        }
    }

    /// Stored advertisements for a name, every origin kept separately.
    pub fn records_for(&self, dc_name: &str) -> Vec<NameRecord> {
        self.db.read().get(dc_name).cloned().unwrap_or_default()
    }

    pub fn record_count(&self) -> usize {
        self.db.read().values().map(Vec::len).sum()
    }

    /// One datagram in, zero or more datagrams out.
    pub fn handle(&self, raw: &[u8], from: SocketAddr) -> Vec<Outbound> {
        if raw == proto::GIVESWITCHES.as_bytes() {
            let list = proto::format_switch_list(&self.links.live_switches());
            return vec![Outbound::reply(from, list.into_bytes())];
        }

        if let Some(rest) = raw.strip_prefix(proto::GIVEADS.as_bytes()) {
            let name = String::from_utf8_lossy(rest);
            let name = name.trim();
            if !name.is_empty() {
                return self.answer_give_ads(name, from);
            }
        }

        match NameRecord::from_json(raw) {
            Ok(record) => self.process_advertisement(record, from),
            Err(err) => {
                debug!(%from, %err, "dropping unparseable advertisement");
                Vec::new()
            }
        }
    }

    fn answer_give_ads(&self, name: &str, from: SocketAddr) -> Vec<Outbound> {
        let db = self.db.read();
        let best = db
            .get(name)
            .and_then(|records| records.iter().min_by_key(|r| r.td_path.len()));
        match best {
            Some(record) => vec![Outbound::reply(
                from,
                proto::format_ad_reply(record).into_bytes(),
            )],
            None => {
                debug!(name, "no advertisement stored");
                Vec::new()
            }
        }
    }

    fn process_advertisement(&self, mut entry: NameRecord, from: SocketAddr) -> Vec<Outbound> {
        let is_origin = entry.origin_rib == self.addr;

        if entry.td_path.contains(&self.addr) {
            debug!(name = %entry.dc_name, "loop suppressed");
            return Vec::new();
        }

        if !is_origin && !self.relayed_by_peer(&entry) {
            warn!(name = %entry.dc_name, %from, "advertisement relayed by non-peer, dropping");
            return Vec::new();
        }

        if is_origin && !self.endorse(&mut entry) {
            debug!(name = %entry.dc_name, "origin has no owner endorsement, refusing to propagate");
            return Vec::new();
        }

        if !self.update_cache(&entry, is_origin) {
            debug!(name = %entry.dc_name, "not updated");
            return Vec::new();
        }
        info!(td = self.td, name = %entry.dc_name, origin = %entry.origin_rib, hops = entry.td_path.len(), "advertisement stored");

        let mut flooded_path = entry.td_path.clone();
        flooded_path.push(self.addr);

        if !is_origin {
            self.ingest_transit(&entry, &flooded_path);
        }

        let mut flooded = entry.clone();
        flooded.td_path = flooded_path;
        self.flood(&flooded, from)
    }

    /// Transit ads must have been forwarded to us by a RIB we peer
    /// with; on the post-append path that RIB sits second from the end.
    fn relayed_by_peer(&self, entry: &NameRecord) -> bool {
        match entry.td_path.last() {
            Some(relay) => self.peers.contains_addr(*relay),
            None => false,
        }
    }

    /// Origin-only: attach the owner's trust certificate and any
    /// distrust certificates issued under the same name.
    fn endorse(&self, entry: &mut NameRecord) -> bool {
        let Some(cert) = self
            .certs
            .owner_endorsement(&entry.dc_name, entry.origin_server)
        else {
            return false;
        };
        entry.trust_cert = Some(TrustCert {
            kind: trustmesh_core::types::CertKind::Trust,
            issuer: cert.issuer,
            entity: cert.entity,
            r_transitivity: cert.transitivity,
        });
        entry.distrust_certs = self
            .certs
            .distrusts_issued_by(&entry.dc_name)
            .into_iter()
            .map(|a| trustmesh_core::types::DistrustCert {
                kind: trustmesh_core::types::CertKind::Distrust,
                issuer: a.issuer,
                entity: a.entity,
            })
            .collect();
        true
    }

    /// At most one record per (name, origin). Shorter paths replace,
    /// equal or longer paths are a no-op; our own origin always wins.
    fn update_cache(&self, entry: &NameRecord, is_origin: bool) -> bool {
        let mut db = self.db.write();
        let records = db.entry(entry.dc_name.clone()).or_default();
        match records
            .iter_mut()
            .find(|r| r.origin_rib == entry.origin_rib)
        {
            None => {
                records.push(entry.clone());
                true
            }
            Some(existing) => {
                if is_origin || entry.td_path.len() < existing.td_path.len() {
                    *existing = entry.clone();
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Before forwarding, fold what the advertisement proves into the
    /// local cert store: the carried certificates, the TD adjacency
    /// along the (post-append) path, and the origin's server binding.
    fn ingest_transit(&self, entry: &NameRecord, appended_path: &[Ipv4Addr]) {
        if let Some(cert) = &entry.trust_cert {
            self.certs.insert_trust(
                cert.issuer.clone(),
                cert.entity.clone(),
                cert.r_transitivity,
            );
            self.certs.insert_trust(
                cert.entity.clone(),
                cert.issuer.clone(),
                Transitivity::Unbounded,
            );
        }
        for cert in &entry.distrust_certs {
            self.certs
                .insert_distrust(cert.issuer.clone(), cert.entity.clone());
        }

        for pair in appended_path.windows(2) {
            let (Some(u), Some(v)) = (self.topology.td_of(pair[0]), self.topology.td_of(pair[1]))
            else {
                debug!("path hop not in topology, skipping adjacency edge");
                continue;
            };
            self.certs
                .insert_trust(td_tag(v), td_tag(u), Transitivity::Unbounded);
        }

        if let Some(origin_td) = self.topology.td_of(entry.origin_rib) {
            self.certs.insert_trust(
                td_tag(origin_td),
                entry.origin_server.to_string(),
                Transitivity::Unbounded,
            );
        }
    }

    fn flood(&self, flooded: &NameRecord, from: SocketAddr) -> Vec<Outbound> {
        let sender = match from {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => return Vec::new(),
        };
        let payload = flooded.to_json().into_bytes();
        let mut out = Vec::new();
        for (_, peer) in self.peers.snapshot() {
            if peer == flooded.origin_rib || peer == sender {
                continue;
            }
            out.push(Outbound {
                dest: SocketAddr::from((peer, ADSTORE_PORT)),
                delay: flood_jitter(),
                payload: payload.clone(),
            });
        }
        debug!(name = %flooded.dc_name, fanout = out.len(), "flooding advertisement");
        out
    }
}

fn flood_jitter() -> Duration {
    let max = FLOOD_JITTER_MAX.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}

/// Receive loop for the ad store port. Delayed floods are detached so
/// a jittered forward never blocks the next receive.
pub async fn serve(
    store: Arc<AdStore>,
    socket: tokio::net::UdpSocket,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; trustmesh_net::udp::MAX_DATAGRAM];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        for outbound in store.handle(&buf[..len], from) {
                            let socket = socket.clone();
                            tokio::spawn(async move {
                                if outbound.delay > Duration::ZERO {
                                    tokio::time::sleep(outbound.delay).await;
                                }
                                if let Err(err) = socket.send_to(&outbound.payload, outbound.dest).await {
                                    debug!(dest = %outbound.dest, %err, "flood send failed");
                                }
                            });
                        }
                    }
                    Err(err) => debug!(%err, "ad store recv error"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pathcomputer::PathComputer;
    use trustmesh_core::proto::PathQuery;
    use trustmesh_core::topology::TdEntry;
    use trustmesh_core::types::CertSubmission;

    fn topology() -> Arc<Topology> {
        Arc::new(
            Topology::from_entries(vec![
                TdEntry {
                    td: 0,
                    rib: "10.0.0.1".parse().unwrap(),
                    addrs: vec![],
                },
                TdEntry {
                    td: 1,
                    rib: "10.0.1.1".parse().unwrap(),
                    addrs: vec![],
                },
                TdEntry {
                    td: 2,
                    rib: "10.0.2.1".parse().unwrap(),
                    addrs: vec![],
                },
            ])
            .unwrap(),
        )
    }

    struct Fixture {
        store: AdStore,
        certs: Arc<CertStore>,
        peers: Arc<PeerMap>,
    }

    /// An ad store for TD 1 at 10.0.1.1, peered with TD 0 and TD 2.
    fn fixture() -> Fixture {
        let certs = Arc::new(CertStore::new());
        let peers = Arc::new(PeerMap::new());
        peers.insert(0, "10.0.0.1".parse().unwrap());
        peers.insert(2, "10.0.2.1".parse().unwrap());
        let links = Arc::new(LinkStateManager::new(
            Duration::from_secs(1),
            peers.clone(),
        ));
        let store = AdStore::new(
            1,
            "10.0.1.1".parse().unwrap(),
            topology(),
            certs.clone(),
            links,
            peers.clone(),
        );
        Fixture {
            store,
            certs,
            peers,
        }
    }

    fn ad(name: &str, origin: &str, server: &str, path: &[&str]) -> NameRecord {
        NameRecord {
            dc_name: name.into(),
            origin_rib: origin.parse().unwrap(),
            origin_server: server.parse().unwrap(),
            td_path: path.iter().map(|p| p.parse().unwrap()).collect(),
            trust_cert: None,
            distrust_certs: vec![],
        }
    }

    fn from_addr(ip: &str) -> SocketAddr {
        format!("{ip}:3001").parse().unwrap()
    }

    #[test]
    fn transit_ad_is_stored_and_flooded_onward() {
        let fx = fixture();
        let entry = ad("fogrobotics:x7k", "10.0.2.1", "11.0.0.2", &["10.0.2.1"]);
        let out = fx
            .store
            .handle(entry.to_json().as_bytes(), from_addr("10.0.2.1"));

        // Stored with the path as received.
        let stored = fx.store.records_for("fogrobotics:x7k");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].td_path, entry.td_path);

        // Flooded to TD 0 only (origin and sender excluded), with our
        // address appended and a bounded jitter.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dest, from_addr("10.0.0.1"));
        assert!(out[0].delay <= FLOOD_JITTER_MAX);
        let forwarded = NameRecord::from_json(&out[0].payload).unwrap();
        assert_eq!(
            forwarded.td_path,
            vec![
                "10.0.2.1".parse::<Ipv4Addr>().unwrap(),
                "10.0.1.1".parse().unwrap()
            ]
        );
    }

    #[test]
    fn loop_suppression_drops_and_does_not_forward() {
        let fx = fixture();
        let entry = ad(
            "fogrobotics:x7k",
            "10.0.2.1",
            "11.0.0.2",
            &["10.0.2.1", "10.0.1.1"],
        );
        let out = fx
            .store
            .handle(entry.to_json().as_bytes(), from_addr("10.0.2.1"));
        assert!(out.is_empty());
        assert_eq!(fx.store.record_count(), 0);
    }

    #[test]
    fn non_peer_relay_is_dropped_without_state_change() {
        let fx = fixture();
        // 10.0.9.9 is not a peer of TD 1.
        let mut entry = ad("fogrobotics:x7k", "10.0.2.1", "11.0.0.2", &["10.0.2.1"]);
        entry.td_path = vec!["10.0.9.9".parse().unwrap()];
        let out = fx
            .store
            .handle(entry.to_json().as_bytes(), from_addr("10.0.9.9"));
        assert!(out.is_empty());
        assert_eq!(fx.store.record_count(), 0);
        assert_eq!(fx.certs.relation_count(), (0, 0));
    }

    #[test]
    fn shorter_path_replaces_longer_never_reverse() {
        let fx = fixture();
        let long = ad(
            "fogrobotics:x7k",
            "10.0.2.1",
            "11.0.0.2",
            &["10.0.2.1", "10.0.0.1"],
        );
        // Peer check looks at the last path element.
        fx.store
            .handle(long.to_json().as_bytes(), from_addr("10.0.0.1"));
        let short = ad("fogrobotics:x7k", "10.0.2.1", "11.0.0.2", &["10.0.2.1"]);
        let out = fx
            .store
            .handle(short.to_json().as_bytes(), from_addr("10.0.2.1"));
        assert!(!out.is_empty());
        assert_eq!(fx.store.records_for("fogrobotics:x7k")[0].td_path.len(), 1);

        // Replaying the longer path is a no-op now.
        let out = fx
            .store
            .handle(long.to_json().as_bytes(), from_addr("10.0.0.1"));
        assert!(out.is_empty());
        assert_eq!(fx.store.records_for("fogrobotics:x7k")[0].td_path.len(), 1);
    }

    #[test]
    fn duplicate_ad_does_not_grow_db() {
        let fx = fixture();
        let entry = ad("fogrobotics:x7k", "10.0.2.1", "11.0.0.2", &["10.0.2.1"]);
        fx.store
            .handle(entry.to_json().as_bytes(), from_addr("10.0.2.1"));
        fx.store
            .handle(entry.to_json().as_bytes(), from_addr("10.0.2.1"));
        assert_eq!(fx.store.record_count(), 1);
    }

    #[test]
    fn origin_without_endorsement_refuses_to_propagate() {
        let certs = Arc::new(CertStore::new());
        let peers = Arc::new(PeerMap::new());
        peers.insert(0, "10.0.0.1".parse().unwrap());
        let links = Arc::new(LinkStateManager::new(Duration::from_secs(1), peers.clone()));
        let store = AdStore::new(
            2,
            "10.0.2.1".parse().unwrap(),
            topology(),
            certs,
            links,
            peers,
        );

        let entry = ad("fogrobotics:unendorsed", "10.0.2.1", "11.0.0.2", &[]);
        let out = store.handle(entry.to_json().as_bytes(), from_addr("11.0.0.2"));
        assert!(out.is_empty());
        assert_eq!(store.record_count(), 0);
    }

    #[test]
    fn origin_attaches_owner_certs_and_floods() {
        let certs = Arc::new(CertStore::new());
        certs.apply(CertSubmission {
            r_transitivity: Some(4),
            ..CertSubmission::trust("fogrobotics:x7k", "11.0.0.2")
        });
        certs.apply(CertSubmission::distrust("fogrobotics:x7k", "AS7"));

        let peers = Arc::new(PeerMap::new());
        peers.insert(1, "10.0.1.1".parse().unwrap());
        let links = Arc::new(LinkStateManager::new(Duration::from_secs(1), peers.clone()));
        let store = AdStore::new(
            2,
            "10.0.2.1".parse().unwrap(),
            topology(),
            certs,
            links,
            peers,
        );

        let entry = ad("fogrobotics:x7k", "10.0.2.1", "11.0.0.2", &[]);
        let out = store.handle(entry.to_json().as_bytes(), from_addr("11.0.0.2"));
        assert_eq!(out.len(), 1);

        let flooded = NameRecord::from_json(&out[0].payload).unwrap();
        assert_eq!(flooded.td_path, vec!["10.0.2.1".parse::<Ipv4Addr>().unwrap()]);
        let cert = flooded.trust_cert.unwrap();
        assert_eq!(cert.issuer, "fogrobotics:x7k");
        assert_eq!(cert.entity, "11.0.0.2");
        assert_eq!(flooded.distrust_certs.len(), 1);

        // The stored copy carries the certificates too.
        let stored = store.records_for("fogrobotics:x7k");
        assert!(stored[0].trust_cert.is_some());
    }

    #[test]
    fn transit_ingestion_builds_adjacency_and_server_edges() {
        let fx = fixture();
        let mut entry = ad("fogrobotics:x7k", "10.0.2.1", "11.0.0.2", &["10.0.2.1"]);
        entry.trust_cert = Some(TrustCert {
            kind: trustmesh_core::types::CertKind::Trust,
            issuer: "fogrobotics:x7k".into(),
            entity: "11.0.0.2".into(),
            r_transitivity: Transitivity::Bounded(4),
        });
        fx.store
            .handle(entry.to_json().as_bytes(), from_addr("10.0.2.1"));

        let (trust, _) = fx.certs.snapshot();
        // Carried cert, its structural reverse, AS1->AS2 adjacency from
        // the appended path, and the origin's server binding.
        assert!(trust
            .iter()
            .any(|a| a.issuer == "fogrobotics:x7k" && a.entity == "11.0.0.2"));
        assert!(trust
            .iter()
            .any(|a| a.issuer == "11.0.0.2" && a.entity == "fogrobotics:x7k"));
        assert!(trust.iter().any(|a| a.issuer == "AS1" && a.entity == "AS2"));
        assert!(trust
            .iter()
            .any(|a| a.issuer == "AS2" && a.entity == "11.0.0.2"));
    }

    #[test]
    fn give_switches_returns_live_set() {
        let fx = fixture();
        fx.store.links.record_ping("8.0.1.2".parse().unwrap());
        let out = fx
            .store
            .handle(proto::GIVESWITCHES.as_bytes(), from_addr("9.1.0.2"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, b"8.0.1.2");
        assert_eq!(out[0].delay, Duration::ZERO);
    }

    #[test]
    fn give_ads_returns_shortest_record() {
        let fx = fixture();
        let far = ad(
            "fogrobotics:x7k",
            "10.0.0.1",
            "11.0.0.9",
            &["10.0.0.1", "10.0.2.1"],
        );
        let near = ad("fogrobotics:x7k", "10.0.2.1", "11.0.0.2", &["10.0.2.1"]);
        fx.store
            .handle(far.to_json().as_bytes(), from_addr("10.0.2.1"));
        fx.store
            .handle(near.to_json().as_bytes(), from_addr("10.0.2.1"));
        assert_eq!(fx.store.record_count(), 2);

        let out = fx
            .store
            .handle(b"GIVEADS fogrobotics:x7k", from_addr("9.1.0.2"));
        assert_eq!(out.len(), 1);
        let reply = String::from_utf8(out[0].payload.clone()).unwrap();
        let record = proto::parse_ad_reply(&reply).unwrap();
        assert_eq!(record.origin_rib, "10.0.2.1".parse::<Ipv4Addr>().unwrap());

        assert!(fx
            .store
            .handle(b"GIVEADS nothere", from_addr("9.1.0.2"))
            .is_empty());
    }

    /// The three-TD end-to-end control-plane flow: a name advertised
    /// in TD 2 floods through TD 1 to TD 0, whose path computer then
    /// hands a client the full source route.
    #[test]
    fn flooded_name_becomes_routable_at_remote_td() {
        let topo = topology();
        let rib0: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let rib1: Ipv4Addr = "10.0.1.1".parse().unwrap();
        let rib2: Ipv4Addr = "10.0.2.1".parse().unwrap();

        let build = |td, addr: Ipv4Addr, peer_list: &[(u32, Ipv4Addr)]| {
            let certs = Arc::new(CertStore::new());
            let peers = Arc::new(PeerMap::new());
            for (peer_td, rib) in peer_list {
                peers.insert(*peer_td, *rib);
            }
            let links = Arc::new(LinkStateManager::new(Duration::from_secs(1), peers.clone()));
            let store = AdStore::new(td, addr, topo.clone(), certs.clone(), links, peers);
            (store, certs)
        };

        let (store2, certs2) = build(2, rib2, &[(1, rib1)]);
        let (store1, _) = build(1, rib1, &[(0, rib0), (2, rib2)]);
        let (store0, certs0) = build(0, rib0, &[(1, rib1)]);

        // Owner endorsement at the origin, client pledge at TD 0.
        certs2.apply(CertSubmission::trust("fogrobotics:x7k", "11.0.0.2"));
        certs0.apply(CertSubmission::trust("user:alice", rib0.to_string()));

        // The server advertises; each hop stores and forwards.
        let ad = ad("fogrobotics:x7k", "10.0.2.1", "11.0.0.2", &[]);
        let out2 = store2.handle(ad.to_json().as_bytes(), from_addr("11.0.0.2"));
        assert_eq!(out2.len(), 1);
        assert_eq!(out2[0].dest, SocketAddr::from((rib1, ADSTORE_PORT)));

        let out1 = store1.handle(&out2[0].payload, from_addr("10.0.2.1"));
        assert_eq!(out1.len(), 1);
        assert_eq!(out1[0].dest, SocketAddr::from((rib0, ADSTORE_PORT)));

        let out0 = store0.handle(&out1[0].payload, from_addr("10.0.1.1"));
        assert!(out0.is_empty());
        assert_eq!(store0.records_for("fogrobotics:x7k")[0].td_path.len(), 2);

        // TD 0's path computer can now route the client end to end.
        let computer = PathComputer::new(0, rib0, certs0);
        computer.rebuild();
        let reply = computer.handle_query(&PathQuery {
            client_name: "user:alice".into(),
            dc_name: "fogrobotics:x7k".into(),
        });
        assert_eq!(reply, "path:AS0,AS1,AS2,11.0.0.2,");
    }

    #[test]
    fn flood_excludes_origin_and_sender() {
        let fx = fixture();
        // Peer 0 relays an ad originated by peer 2: nobody is left to
        // flood to.
        let entry = ad(
            "fogrobotics:x7k",
            "10.0.2.1",
            "11.0.0.2",
            &["10.0.2.1", "10.0.0.1"],
        );
        let out = fx
            .store
            .handle(entry.to_json().as_bytes(), from_addr("10.0.0.1"));
        assert!(out.is_empty());
        // But it was stored.
        assert_eq!(fx.store.record_count(), 1);
        let _ = fx.peers.snapshot();
    }
}
