//! Identifiers, trust assertions, and name advertisement records.
//!
//! The tag namespace is stringly typed on the wire: a bare TD tag
//! (`"AS3"`), a scoped user tag (`"user:alice"`), an owner-scoped
//! capsule name (`"fogrobotics:x7k"`), or a dotted-quad server address.
//! Scoped tags are exactly those containing a `:`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Trust-domain identifier, dense in `[0, N)` for a run.
pub type TdId = u32;

/// Render a TD id as its tag (`3` -> `"AS3"`).
pub fn td_tag(td: TdId) -> String {
    format!("AS{td}")
}

/// Parse a TD tag (`"AS3"` -> `3`). Anything else is `None`.
pub fn parse_td_tag(tag: &str) -> Option<TdId> {
    tag.strip_prefix("AS")?.parse().ok()
}

/// Scoped tags (user or owner issued) carry a `:` separator; bare TD
/// tags and address literals do not.
pub fn is_scoped_tag(tag: &str) -> bool {
    tag.contains(':')
}

/// Certificate kind discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertKind {
    Trust,
    Distrust,
}

/// Transitivity bound on a trust edge. Structural edges (TD peering,
/// TD-to-server mapping) are unbounded; owner- and user-issued policy
/// edges may carry a finite radius.
///
/// On the wire this is an integer with `i32::MAX` standing in for the
/// unbounded case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Transitivity {
    Bounded(u32),
    Unbounded,
}

impl From<i64> for Transitivity {
    fn from(raw: i64) -> Self {
        if (0..i64::from(i32::MAX)).contains(&raw) {
            Transitivity::Bounded(raw as u32)
        } else {
            Transitivity::Unbounded
        }
    }
}

impl From<Transitivity> for i64 {
    fn from(t: Transitivity) -> i64 {
        match t {
            Transitivity::Bounded(r) => i64::from(r),
            Transitivity::Unbounded => i64::from(i32::MAX),
        }
    }
}

/// A trust certificate as carried inside an advertisement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrustCert {
    #[serde(rename = "type")]
    pub kind: CertKind,
    pub issuer: String,
    pub entity: String,
    pub r_transitivity: Transitivity,
}

/// A distrust certificate as carried inside an advertisement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistrustCert {
    #[serde(rename = "type")]
    pub kind: CertKind,
    pub issuer: String,
    pub entity: String,
}

/// A certificate submission to a RIB's cert store.
///
/// `r_transitivity` may be omitted for trust submissions, in which case
/// the edge is unbounded. Distrust carries no transitivity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CertSubmission {
    pub issuer: String,
    #[serde(rename = "type")]
    pub kind: CertKind,
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r_transitivity: Option<i64>,
}

impl CertSubmission {
    pub fn trust(issuer: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            kind: CertKind::Trust,
            entity: entity.into(),
            r_transitivity: None,
        }
    }

    pub fn distrust(issuer: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            kind: CertKind::Distrust,
            entity: entity.into(),
            r_transitivity: None,
        }
    }

    pub fn transitivity(&self) -> Transitivity {
        match self.r_transitivity {
            Some(raw) => Transitivity::from(raw),
            None => Transitivity::Unbounded,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// A directed trust relation held by a cert store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustAssertion {
    pub issuer: String,
    pub entity: String,
    pub transitivity: Transitivity,
}

/// A directed distrust relation held by a cert store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistrustAssertion {
    pub issuer: String,
    pub entity: String,
}

/// One advertisement record: "capsule `dc_name` exists behind the RIB
/// at `origin_rib`, reachable over `td_path`".
///
/// `td_path` is ordered most-recent-appended-last and is serialized as
/// the arrow-joined form `"a.b.c.d->e.f.g.h"`. A record stored by an
/// ad store keeps the path as received, before the local TD is
/// appended for flooding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NameRecord {
    pub dc_name: String,
    #[serde(rename = "origin_AS")]
    pub origin_rib: Ipv4Addr,
    pub origin_server: Ipv4Addr,
    #[serde(with = "td_path_format")]
    pub td_path: Vec<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_cert: Option<TrustCert>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub distrust_certs: Vec<DistrustCert>,
}

impl NameRecord {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

impl fmt::Display for NameRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} ({} hops)",
            self.dc_name,
            self.origin_rib,
            self.td_path.len()
        )
    }
}

mod td_path_format {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::net::Ipv4Addr;

    pub fn serialize<S: Serializer>(path: &[Ipv4Addr], ser: S) -> Result<S::Ok, S::Error> {
        let joined = path
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join("->");
        ser.serialize_str(&joined)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<Ipv4Addr>, D::Error> {
        let raw = String::deserialize(de)?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        raw.split("->")
            .map(|seg| seg.parse().map_err(de::Error::custom))
            .collect()
    }
}
