//! Certificate store.
//!
//! Holds the raw trust/distrust relation multisets this RIB has been
//! told about. Nothing here is deduplicated; the path computer deals
//! in edges and dedupes at graph-build time.

use parking_lot::RwLock;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{debug, info};
use trustmesh_core::types::{
    is_scoped_tag, CertKind, CertSubmission, DistrustAssertion, Transitivity, TrustAssertion,
};

#[derive(Debug, Error)]
pub enum CertStoreError {
    #[error("malformed certificate: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Default)]
pub struct CertStore {
    trust: RwLock<Vec<TrustAssertion>>,
    distrust: RwLock<Vec<DistrustAssertion>>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one certificate submission datagram.
    pub fn ingest(&self, raw: &[u8]) -> Result<(), CertStoreError> {
        let sub = CertSubmission::from_json(raw)?;
        self.apply(sub);
        Ok(())
    }

    /// Apply a parsed submission. Scoped issuers (user/owner tags) get
    /// the reverse `entity -> issuer` edge so traffic from an AS back
    /// to its client or owner stays reachable on the graph.
    pub fn apply(&self, sub: CertSubmission) {
        match sub.kind {
            CertKind::Trust => {
                let transitivity = sub.transitivity();
                if is_scoped_tag(&sub.issuer) {
                    self.insert_trust(sub.entity.clone(), sub.issuer.clone(), Transitivity::Unbounded);
                }
                info!(issuer = %sub.issuer, entity = %sub.entity, "trust relation added");
                self.insert_trust(sub.issuer, sub.entity, transitivity);
            }
            CertKind::Distrust => {
                info!(issuer = %sub.issuer, entity = %sub.entity, "distrust relation added");
                self.insert_distrust(sub.issuer, sub.entity);
            }
        }
    }

    pub fn insert_trust(&self, issuer: String, entity: String, transitivity: Transitivity) {
        self.trust.write().push(TrustAssertion {
            issuer,
            entity,
            transitivity,
        });
    }

    pub fn insert_distrust(&self, issuer: String, entity: String) {
        self.distrust.write().push(DistrustAssertion { issuer, entity });
    }

    /// The owner endorsement an origin RIB must hold before it floods
    /// a name: a trust relation from the capsule's owner-scoped name
    /// to the advertising server's address.
    pub fn owner_endorsement(&self, dc_name: &str, server: Ipv4Addr) -> Option<TrustAssertion> {
        let server = server.to_string();
        self.trust
            .read()
            .iter()
            .find(|a| a.issuer == dc_name && a.entity == server)
            .cloned()
    }

    /// Distrust relations issued under a capsule name, carried along
    /// with its advertisement by the origin.
    pub fn distrusts_issued_by(&self, issuer: &str) -> Vec<DistrustAssertion> {
        self.distrust
            .read()
            .iter()
            .filter(|a| a.issuer == issuer)
            .cloned()
            .collect()
    }

    /// Resolve a capsule name to its endorsed server address string,
    /// for answering `GIVEPATH`.
    pub fn endorsement_target(&self, dc_name: &str) -> Option<String> {
        self.trust
            .read()
            .iter()
            .find(|a| a.issuer == dc_name)
            .map(|a| a.entity.clone())
    }

    pub fn snapshot(&self) -> (Vec<TrustAssertion>, Vec<DistrustAssertion>) {
        (self.trust.read().clone(), self.distrust.read().clone())
    }

    pub fn relation_count(&self) -> (usize, usize) {
        (self.trust.read().len(), self.distrust.read().len())
    }
}

/// Receive loop for the cert store port. Malformed submissions are
/// dropped without touching state.
pub async fn serve(
    store: std::sync::Arc<CertStore>,
    socket: tokio::net::UdpSocket,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; trustmesh_net::udp::MAX_DATAGRAM];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        if let Err(err) = store.ingest(&buf[..len]) {
                            debug!(%from, %err, "dropping certificate");
                        }
                    }
                    Err(err) => debug!(%err, "cert store recv error"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_issuer_gets_reverse_edge() {
        let store = CertStore::new();
        store
            .ingest(br#"{"issuer":"user:alice","type":"trust","entity":"10.0.0.1"}"#)
            .unwrap();

        let (trust, _) = store.snapshot();
        assert_eq!(trust.len(), 2);
        assert!(trust
            .iter()
            .any(|a| a.issuer == "user:alice" && a.entity == "10.0.0.1"));
        assert!(trust.iter().any(|a| {
            a.issuer == "10.0.0.1"
                && a.entity == "user:alice"
                && a.transitivity == Transitivity::Unbounded
        }));
    }

    #[test]
    fn bare_td_issuer_has_no_reverse_edge() {
        let store = CertStore::new();
        store
            .ingest(br#"{"issuer":"AS1","type":"trust","entity":"AS2"}"#)
            .unwrap();
        let (trust, _) = store.snapshot();
        assert_eq!(trust.len(), 1);
    }

    #[test]
    fn distrust_recorded_without_transitivity() {
        let store = CertStore::new();
        store
            .ingest(br#"{"issuer":"user:alice","type":"distrust","entity":"AS0"}"#)
            .unwrap();
        let (trust, distrust) = store.snapshot();
        assert!(trust.is_empty());
        assert_eq!(
            distrust,
            vec![DistrustAssertion {
                issuer: "user:alice".into(),
                entity: "AS0".into(),
            }]
        );
    }

    #[test]
    fn malformed_submission_leaves_state_untouched() {
        let store = CertStore::new();
        assert!(store.ingest(b"{").is_err());
        assert!(store.ingest(br#"{"issuer":"x"}"#).is_err());
        assert_eq!(store.relation_count(), (0, 0));
    }

    #[test]
    fn duplicate_submission_grows_multiset() {
        let store = CertStore::new();
        let raw = br#"{"issuer":"fogrobotics:x7k","type":"trust","entity":"11.0.0.2","r_transitivity":4}"#;
        store.ingest(raw).unwrap();
        store.ingest(raw).unwrap();
        let (trust, _) = store.snapshot();
        // One reverse edge per submission as well.
        assert_eq!(trust.len(), 4);
    }

    #[test]
    fn owner_endorsement_lookup() {
        let store = CertStore::new();
        store.apply(CertSubmission {
            r_transitivity: Some(4),
            ..CertSubmission::trust("fogrobotics:x7k", "11.0.0.2")
        });

        let server: Ipv4Addr = "11.0.0.2".parse().unwrap();
        let cert = store.owner_endorsement("fogrobotics:x7k", server).unwrap();
        assert_eq!(cert.transitivity, Transitivity::Bounded(4));
        assert!(store
            .owner_endorsement("fogrobotics:x7k", "11.0.0.9".parse().unwrap())
            .is_none());
        assert_eq!(
            store.endorsement_target("fogrobotics:x7k"),
            Some("11.0.0.2".into())
        );
    }
}
