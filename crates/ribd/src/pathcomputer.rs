//! Trust-graph path computer.
//!
//! Once a second the graph is rebuilt from the cert store's relation
//! multisets: identifiers naming this node (its TD tag, its address,
//! or the literal `"me"`) collapse to `"me"`, each unique identifier
//! is interned, and all-pairs shortest paths run over unit-weight
//! trust edges. Distrust is applied up front as a vertex-pair cut: a
//! vertex an issuer distrusts is removed from that issuer's entire
//! view of the graph before its sweep runs, so the distrusted vertex
//! can neither terminate nor relay any of the issuer's paths and the
//! result does not depend on iteration order.
//!
//! `GIVEPATH` resolves the capsule name to its endorsed server via the
//! cert store, extracts the client-to-server path, and answers with
//! the TD tag sequence plus the server address.

use crate::certstore::CertStore;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use trustmesh_core::proto::{self, PathQuery};
use trustmesh_core::types::{td_tag, DistrustAssertion, TdId, Transitivity, TrustAssertion};

const INF: u32 = u32::MAX / 2;

/// Interned trust graph with its all-pairs shortest-path tables.
#[derive(Default)]
pub struct TrustGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    trust_edges: BTreeSet<(usize, usize)>,
    distrust_edges: BTreeSet<(usize, usize)>,
    /// Finite transitivity bounds, recorded for future pruning; path
    /// extraction does not consult them.
    transitivity: HashMap<(usize, usize), u32>,
    dist: Vec<u32>,
    next: Vec<Option<usize>>,
}

impl TrustGraph {
    pub fn build<F>(
        trust: &[TrustAssertion],
        distrust: &[DistrustAssertion],
        canonical: F,
    ) -> Self
    where
        F: Fn(&str) -> String,
    {
        let mut graph = TrustGraph::default();

        for assertion in trust {
            let issuer = graph.intern(canonical(&assertion.issuer));
            let entity = graph.intern(canonical(&assertion.entity));
            if issuer == entity {
                continue;
            }
            graph.trust_edges.insert((issuer, entity));
            if let Transitivity::Bounded(r) = assertion.transitivity {
                graph.transitivity.insert((issuer, entity), r);
            }
        }

        for assertion in distrust {
            let issuer = graph.intern(canonical(&assertion.issuer));
            let entity = graph.intern(canonical(&assertion.entity));
            graph.distrust_edges.insert((issuer, entity));
        }

        graph.run_apsp();
        graph
    }

    fn intern(&mut self, name: String) -> usize {
        if let Some(&id) = self.index.get(&name) {
            return id;
        }
        let id = self.names.len();
        self.index.insert(name.clone(), id);
        self.names.push(name);
        id
    }

    pub fn vertex_count(&self) -> usize {
        self.names.len()
    }

    pub fn distance(&self, from: &str, to: &str) -> Option<u32> {
        let n = self.names.len();
        let (&s, &t) = (self.index.get(from)?, self.index.get(to)?);
        let d = self.dist[s * n + t];
        (d < INF).then_some(d)
    }

    pub fn transitivity_of(&self, from: &str, to: &str) -> Option<u32> {
        let (&s, &t) = (self.index.get(from)?, self.index.get(to)?);
        self.transitivity.get(&(s, t)).copied()
    }

    /// All-pairs shortest paths over unit-weight trust edges: one
    /// breadth-first sweep per source, run on the source's view of the
    /// graph with its distrusted vertices cut out.
    fn run_apsp(&mut self) {
        let n = self.names.len();
        self.dist = vec![INF; n * n];
        self.next = vec![None; n * n];

        let mut adjacency = vec![Vec::new(); n];
        for &(u, v) in &self.trust_edges {
            adjacency[u].push(v);
        }

        let mut queue = std::collections::VecDeque::new();
        for source in 0..n {
            let banned: BTreeSet<usize> = self
                .distrust_edges
                .range((source, 0)..=(source, usize::MAX))
                .map(|&(_, v)| v)
                .collect();

            self.dist[source * n + source] = 0;
            queue.clear();
            queue.push_back(source);
            while let Some(u) = queue.pop_front() {
                for &v in &adjacency[u] {
                    if banned.contains(&v) || self.dist[source * n + v] != INF {
                        continue;
                    }
                    self.dist[source * n + v] = self.dist[source * n + u] + 1;
                    self.next[source * n + v] = Some(u);
                    queue.push_back(v);
                }
            }
        }
    }

    /// Vertices of the shortest `from -> to` path in forward order,
    /// endpoints included; empty when either endpoint is unknown or no
    /// path survives the distrust cuts.
    pub fn shortest_path(&self, from: &str, to: &str) -> Vec<String> {
        let n = self.names.len();
        let (Some(&s), Some(&t)) = (self.index.get(from), self.index.get(to)) else {
            return Vec::new();
        };
        if self.dist[s * n + t] >= INF {
            return Vec::new();
        }

        let mut path = vec![t];
        let mut v = t;
        while v != s {
            match self.next[s * n + v] {
                Some(prev) if path.len() <= n => {
                    v = prev;
                    path.push(v);
                }
                _ => return Vec::new(),
            }
        }
        path.reverse();
        path.into_iter().map(|i| self.names[i].clone()).collect()
    }
}

pub struct PathComputer {
    td: TdId,
    addr: Ipv4Addr,
    certs: Arc<CertStore>,
    graph: RwLock<TrustGraph>,
}

impl PathComputer {
    pub fn new(td: TdId, addr: Ipv4Addr, certs: Arc<CertStore>) -> Self {
        Self {
            td,
            addr,
            certs,
            graph: RwLock::new(TrustGraph::default()),
        }
    }

    /// Collapse every alias of this node to the literal `"me"`.
    fn canonical(&self, tag: &str) -> String {
        if tag == "me" || tag == td_tag(self.td) || tag == self.addr.to_string() {
            "me".to_owned()
        } else {
            tag.to_owned()
        }
    }

    /// Rebuild the graph from the current relation multisets.
    pub fn rebuild(&self) {
        let (trust, distrust) = self.certs.snapshot();
        let graph = TrustGraph::build(&trust, &distrust, |tag| self.canonical(tag));
        debug!(
            td = self.td,
            vertices = graph.vertex_count(),
            trust = graph.trust_edges.len(),
            distrust = graph.distrust_edges.len(),
            "trust graph recalculated"
        );
        *self.graph.write() = graph;
    }

    /// Answer one `GIVEPATH` request body. The reply path starts at
    /// the first TD after the client and ends with the server address;
    /// any failure collapses to the empty encoding, which requesters
    /// ignore.
    pub fn handle_query(&self, query: &PathQuery) -> String {
        let Some(target) = self.certs.endorsement_target(&query.dc_name) else {
            debug!(dc_name = %query.dc_name, "no endorsement for requested name");
            return proto::format_path_reply(&[]);
        };

        let graph = self.graph.read();
        let path = graph.shortest_path(
            &self.canonical(&query.client_name),
            &self.canonical(&target),
        );
        if path.len() < 2 {
            return proto::format_path_reply(&[]);
        }

        let elements: Vec<String> = path[1..]
            .iter()
            .map(|el| {
                if el == "me" {
                    td_tag(self.td)
                } else {
                    el.clone()
                }
            })
            .collect();
        info!(client = %query.client_name, dc_name = %query.dc_name, hops = elements.len(), "path computed");
        proto::format_path_reply(&elements)
    }

    pub fn handle(&self, raw: &[u8], _from: SocketAddr) -> Option<Vec<u8>> {
        let text = std::str::from_utf8(raw).ok()?;
        let query = PathQuery::from_request(text)?;
        Some(self.handle_query(&query).into_bytes())
    }
}

/// Serve `GIVEPATH` requests and keep the graph fresh on a fixed
/// cadence.
pub async fn serve(
    computer: Arc<PathComputer>,
    socket: tokio::net::UdpSocket,
    rebuild_interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(rebuild_interval);
    let mut buf = vec![0u8; trustmesh_net::udp::MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = ticker.tick() => computer.rebuild(),
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        if let Some(reply) = computer.handle(&buf[..len], from) {
                            if let Err(err) = socket.send_to(&reply, from).await {
                                debug!(%from, %err, "path reply failed");
                            }
                        }
                    }
                    Err(err) => debug!(%err, "path computer recv error"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
