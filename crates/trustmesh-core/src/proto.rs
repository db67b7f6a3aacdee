//! Control-plane message grammar.
//!
//! Everything here travels as a single UDP datagram. Commands are
//! ASCII-prefixed; echo probes append raw little-endian fields after
//! the prefix so the timestamp is echoed byte-exact.

use crate::types::{NameRecord, TdId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Request the live overlay switches of a TD.
pub const GIVESWITCHES: &str = "GIVESWITCHES";
/// Request the peer-TD table of a RIB.
pub const GIVEPEERS: &str = "GIVEPEERS";
/// Request the stored advertisement for a capsule name.
pub const GIVEADS: &str = "GIVEADS";
/// Request a TD path toward a capsule name.
pub const GIVEPATH: &str = "GIVEPATH";

/// Terminator token on switch lists; also doubles as "no entries".
const LIST_END: &str = "0.0.0.0";

/// Body of a `GIVEPATH` request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathQuery {
    pub client_name: String,
    pub dc_name: String,
}

impl PathQuery {
    pub fn to_request(&self) -> String {
        format!("{GIVEPATH} {}", serde_json::to_string(self).unwrap_or_default())
    }

    /// Parse the body following the `GIVEPATH ` prefix.
    pub fn from_request(raw: &str) -> Option<Self> {
        let body = raw.strip_prefix(GIVEPATH)?.trim_start();
        serde_json::from_str(body).ok()
    }
}

/// Space-separated dotted quads, as answered to `GIVESWITCHES`.
pub fn format_switch_list(switches: &[Ipv4Addr]) -> String {
    switches
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a switch list, stopping at the end terminator or a bad token.
pub fn parse_switch_list(raw: &str) -> Vec<Ipv4Addr> {
    let mut out = Vec::new();
    for token in raw.split_ascii_whitespace() {
        if token == LIST_END {
            break;
        }
        match token.parse() {
            Ok(addr) => out.push(addr),
            Err(_) => break,
        }
    }
    out
}

/// One line per peer, `"<td_num> <rib_ipv4>\n"`, as answered to `GIVEPEERS`.
pub fn format_peer_lines(peers: &BTreeMap<TdId, Ipv4Addr>) -> String {
    let mut out = String::new();
    for (td, rib) in peers {
        out.push_str(&format!("{td} {rib}\n"));
    }
    out
}

pub fn parse_peer_lines(raw: &str) -> BTreeMap<TdId, Ipv4Addr> {
    let mut out = BTreeMap::new();
    let mut tokens = raw.split_ascii_whitespace();
    while let (Some(td), Some(addr)) = (tokens.next(), tokens.next()) {
        if addr == LIST_END {
            break;
        }
        let (Ok(td), Ok(addr)) = (td.parse::<TdId>(), addr.parse::<Ipv4Addr>()) else {
            break;
        };
        out.insert(td, addr);
    }
    out
}

/// `"ad:" + <advertisement JSON>`, as answered to `GIVEADS`.
pub fn format_ad_reply(record: &NameRecord) -> String {
    format!("ad:{}", record.to_json())
}

pub fn parse_ad_reply(raw: &str) -> Option<NameRecord> {
    let body = raw.strip_prefix("ad:")?;
    NameRecord::from_json(body.as_bytes()).ok()
}

/// `"path:" + each element + ","`. An empty path encodes as `"path:,"`
/// and must be ignored by the requester.
pub fn format_path_reply(elements: &[String]) -> String {
    let mut out = String::from("path:");
    for el in elements {
        out.push_str(el);
        out.push(',');
    }
    if elements.is_empty() {
        out.push(',');
    }
    out
}

/// Parse a path reply; `None` if the prefix is missing, empty vec for
/// the empty-path encoding.
pub fn parse_path_reply(raw: &str) -> Option<Vec<String>> {
    let body = raw.strip_prefix("path:")?;
    Some(
        body.split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect(),
    )
}

/// Which probe pair a message belongs to: switch-to-switch or
/// client-to-local-switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EchoScope {
    Switch,
    Client,
}

impl EchoScope {
    fn request_prefix(self) -> &'static str {
        match self {
            EchoScope::Switch => "ECHOREQUEST",
            EchoScope::Client => "ECHOREQUESTCLIENT",
        }
    }

    fn response_prefix(self) -> &'static str {
        match self {
            EchoScope::Switch => "ECHORESPONSE",
            EchoScope::Client => "ECHORESPONSECLIENT",
        }
    }
}

/// `"<PREFIX> <i64_le_send_us>"`.
pub fn encode_echo_request(scope: EchoScope, send_us: i64) -> Vec<u8> {
    let prefix = scope.request_prefix();
    let mut out = Vec::with_capacity(prefix.len() + 1 + 8);
    out.extend_from_slice(prefix.as_bytes());
    out.push(b' ');
    out.extend_from_slice(&send_us.to_le_bytes());
    out
}

pub fn decode_echo_request(raw: &[u8]) -> Option<(EchoScope, i64)> {
    // The client prefix extends the switch prefix; try it first.
    for scope in [EchoScope::Client, EchoScope::Switch] {
        let prefix = scope.request_prefix().as_bytes();
        if raw.len() == prefix.len() + 1 + 8 && raw.starts_with(prefix) && raw[prefix.len()] == b' '
        {
            let micros = i64::from_le_bytes(raw[prefix.len() + 1..].try_into().ok()?);
            return Some((scope, micros));
        }
    }
    None
}

/// `"<PREFIX> <i64_le_send_us_echoed> <i32_le_local_td>"`.
pub fn encode_echo_response(scope: EchoScope, send_us: i64, td: TdId) -> Vec<u8> {
    let prefix = scope.response_prefix();
    let mut out = Vec::with_capacity(prefix.len() + 1 + 8 + 1 + 4);
    out.extend_from_slice(prefix.as_bytes());
    out.push(b' ');
    out.extend_from_slice(&send_us.to_le_bytes());
    out.push(b' ');
    out.extend_from_slice(&(td as i32).to_le_bytes());
    out
}

pub fn decode_echo_response(raw: &[u8]) -> Option<(EchoScope, i64, TdId)> {
    for scope in [EchoScope::Client, EchoScope::Switch] {
        let prefix = scope.response_prefix().as_bytes();
        let expected = prefix.len() + 1 + 8 + 1 + 4;
        if raw.len() == expected && raw.starts_with(prefix) && raw[prefix.len()] == b' ' {
            let at = prefix.len() + 1;
            let micros = i64::from_le_bytes(raw[at..at + 8].try_into().ok()?);
            let td = i32::from_le_bytes(raw[at + 9..].try_into().ok()?);
            return Some((scope, micros, TdId::try_from(td).ok()?));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_list_roundtrip() {
        let switches: Vec<Ipv4Addr> =
            vec!["8.0.0.2".parse().unwrap(), "8.0.0.3".parse().unwrap()];
        let raw = format_switch_list(&switches);
        assert_eq!(raw, "8.0.0.2 8.0.0.3");
        assert_eq!(parse_switch_list(&raw), switches);
    }

    #[test]
    fn switch_list_stops_at_terminator() {
        assert_eq!(
            parse_switch_list("8.0.0.2 0.0.0.0 8.0.0.9"),
            vec!["8.0.0.2".parse::<Ipv4Addr>().unwrap()]
        );
        assert!(parse_switch_list("").is_empty());
    }

    #[test]
    fn peer_lines_roundtrip() {
        let mut peers = BTreeMap::new();
        peers.insert(1, "10.0.1.1".parse().unwrap());
        peers.insert(2, "10.0.2.1".parse().unwrap());
        let raw = format_peer_lines(&peers);
        assert_eq!(raw, "1 10.0.1.1\n2 10.0.2.1\n");
        assert_eq!(parse_peer_lines(&raw), peers);
    }

    #[test]
    fn path_reply_grammar() {
        let elements = vec![
            "AS0".to_string(),
            "AS1".to_string(),
            "AS2".to_string(),
            "11.0.0.2".to_string(),
        ];
        let raw = format_path_reply(&elements);
        assert_eq!(raw, "path:AS0,AS1,AS2,11.0.0.2,");
        assert_eq!(parse_path_reply(&raw), Some(elements));

        assert_eq!(format_path_reply(&[]), "path:,");
        assert_eq!(parse_path_reply("path:,"), Some(vec![]));
        assert_eq!(parse_path_reply("GIVESWITCHES"), None);
    }

    #[test]
    fn give_path_request_roundtrip() {
        let query = PathQuery {
            client_name: "user:alice".into(),
            dc_name: "fogrobotics:x7k".into(),
        };
        let raw = query.to_request();
        assert!(raw.starts_with("GIVEPATH {"));
        assert_eq!(PathQuery::from_request(&raw), Some(query));
        assert_eq!(PathQuery::from_request("GIVEPATH nope"), None);
    }

    #[test]
    fn echo_request_roundtrip() {
        for scope in [EchoScope::Switch, EchoScope::Client] {
            let raw = encode_echo_request(scope, -42);
            assert_eq!(decode_echo_request(&raw), Some((scope, -42)));
        }
        assert_eq!(decode_echo_request(b"ECHOREQUEST"), None);
    }

    #[test]
    fn echo_response_echoes_timestamp_byte_exact() {
        let request = encode_echo_request(EchoScope::Switch, 9_876_543_210);
        let (scope, echoed) = decode_echo_request(&request).unwrap();
        let response = encode_echo_response(scope, echoed, 3);
        assert_eq!(
            decode_echo_response(&response),
            Some((EchoScope::Switch, 9_876_543_210, 3))
        );
    }

    #[test]
    fn echo_scopes_do_not_collide() {
        let raw = encode_echo_request(EchoScope::Client, 1);
        assert_eq!(decode_echo_request(&raw).unwrap().0, EchoScope::Client);
        let raw = encode_echo_response(EchoScope::Client, 1, 0);
        assert_eq!(decode_echo_response(&raw).unwrap().0, EchoScope::Client);
    }
}
