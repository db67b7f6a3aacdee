//! Driver-supplied address fact tables.
//!
//! The driver that lays out the run knows which RIB fronts which trust
//! domain and which router addresses belong to it. Agents load the
//! table once at startup; after that it is read-only and shared by
//! reference.

use crate::types::TdId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate TD id {0}")]
    DuplicateTd(TdId),
    #[error("address {0} mapped to more than one TD")]
    DuplicateAddr(Ipv4Addr),
}

/// One trust domain: its RIB's address plus any further addresses
/// (routers, switches) that resolve to it on a trace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TdEntry {
    pub td: TdId,
    pub rib: Ipv4Addr,
    #[serde(default)]
    pub addrs: Vec<Ipv4Addr>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct TopologyFile {
    tds: Vec<TdEntry>,
}

/// Bidirectional TD/address fact table.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    td_to_rib: BTreeMap<TdId, Ipv4Addr>,
    addr_to_td: HashMap<Ipv4Addr, TdId>,
}

impl Topology {
    pub fn from_entries(entries: Vec<TdEntry>) -> Result<Self, TopologyError> {
        let mut topo = Topology::default();
        for entry in entries {
            if topo.td_to_rib.insert(entry.td, entry.rib).is_some() {
                return Err(TopologyError::DuplicateTd(entry.td));
            }
            for addr in std::iter::once(entry.rib).chain(entry.addrs) {
                match topo.addr_to_td.insert(addr, entry.td) {
                    Some(prev) if prev != entry.td => {
                        return Err(TopologyError::DuplicateAddr(addr))
                    }
                    _ => {}
                }
            }
        }
        Ok(topo)
    }

    pub fn load(path: &Path) -> Result<Self, TopologyError> {
        let raw = std::fs::read(path)?;
        let file: TopologyFile = serde_json::from_slice(&raw)?;
        Self::from_entries(file.tds)
    }

    /// RIB address of a TD.
    pub fn rib_of(&self, td: TdId) -> Option<Ipv4Addr> {
        self.td_to_rib.get(&td).copied()
    }

    /// TD that an address belongs to.
    pub fn td_of(&self, addr: Ipv4Addr) -> Option<TdId> {
        self.addr_to_td.get(&addr).copied()
    }

    /// All RIBs, ordered by TD id.
    pub fn ribs(&self) -> impl Iterator<Item = (TdId, Ipv4Addr)> + '_ {
        self.td_to_rib.iter().map(|(td, rib)| (*td, *rib))
    }

    pub fn len(&self) -> usize {
        self.td_to_rib.len()
    }

    pub fn is_empty(&self) -> bool {
        self.td_to_rib.is_empty()
    }
}
